//! Chunk surgery units: sources, splitters, affix editors and the
//! visibility controls.

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::multibin::{EvalCtx, Multibin};
use crate::unit::{Sink, Unit};

/// `emit DATA…`: one chunk per argument; input payloads are discarded
/// but their metadata is inherited
pub struct Emit {
    data: Vec<Multibin>,
}

impl Emit {
    /// Creates the unit from its bound data expressions
    pub fn new(data: Vec<Multibin>) -> Self {
        Self { data }
    }
}

impl Unit for Emit {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        for expr in &self.data {
            let payload = expr.eval_on(&mut chunk)?;
            sink(chunk.derive(payload))?;
        }
        Ok(())
    }
}

/// `nop`: forward chunks unchanged
pub struct Nop;

impl Unit for Nop {
    fn process(&mut self, chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        sink(chunk)
    }
}

/// `ccp DATA` / `cca DATA`: prepend or append data to every payload.
/// The reverse direction strips the affix when present.
pub struct Affix {
    data: Multibin,
    append: bool,
}

impl Affix {
    /// The `ccp` flavor
    pub fn prepend(data: Multibin) -> Self {
        Self {
            data,
            append: false,
        }
    }

    /// The `cca` flavor
    pub fn append(data: Multibin) -> Self {
        Self { data, append: true }
    }
}

impl Unit for Affix {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let affix = self.data.eval_on(&mut chunk)?;
        if self.append {
            chunk.data_mut().extend_from_slice(&affix);
        } else {
            let mut data = affix;
            data.extend_from_slice(chunk.data());
            chunk.set_data(data);
        }
        sink(chunk)
    }

    fn reverse(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let affix = self.data.eval_on(&mut chunk)?;
        if self.append {
            if chunk.data().ends_with(&affix) {
                let keep = chunk.data().len() - affix.len();
                chunk.data_mut().truncate(keep);
            }
        } else if chunk.data().starts_with(&affix) {
            chunk.data_mut().drain(..affix.len());
        }
        sink(chunk)
    }
}

/// `rev`: reverse the payload byte order; its own inverse
pub struct Rev;

impl Unit for Rev {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        chunk.data_mut().reverse();
        sink(chunk)
    }

    fn reverse(&mut self, chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        self.process(chunk, sink)
    }
}

/// `chop SIZE`: split the payload into blocks of the given size; the
/// final block may be short
pub struct Chop {
    size: Multibin,
}

impl Chop {
    /// Creates the unit from its block size expression
    pub fn new(size: Multibin) -> Self {
        Self { size }
    }
}

impl Unit for Chop {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let size = {
            let mut ctx = EvalCtx::new(&mut chunk);
            self.size.eval_int(&mut ctx)?
        };
        if size <= 0 {
            return Err(Error::argument(format!(
                "invalid block size: {}",
                self.size.source()
            )));
        }
        let data = std::mem::take(chunk.data_mut());
        for block in data.chunks(size as usize) {
            sink(chunk.derive(block.to_vec()))?;
        }
        Ok(())
    }
}

/// `resplit PATTERN`: split the payload on a byte pattern, line breaks
/// by default
pub struct Resplit {
    pattern: Multibin,
}

impl Resplit {
    /// Creates the unit from its pattern expression
    pub fn new(pattern: Multibin) -> Self {
        Self { pattern }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from + needle.len() > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

impl Unit for Resplit {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let pattern = self.pattern.eval_on(&mut chunk)?;
        if pattern.is_empty() {
            return Err(Error::argument("empty split pattern"));
        }
        let data = std::mem::take(chunk.data_mut());
        let mut start = 0;
        while let Some(at) = find(&data, &pattern, start) {
            sink(chunk.derive(data[start..at].to_vec()))?;
            start = at + pattern.len();
        }
        sink(chunk.derive(data[start..].to_vec()))?;
        Ok(())
    }
}

/// `snip SLICE…`: emit one chunk per slice of the payload
pub struct Snip {
    slices: Vec<String>,
}

impl Snip {
    /// Creates the unit from its slice specifications
    pub fn new(slices: Vec<String>) -> Self {
        Self { slices }
    }
}

impl Unit for Snip {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let data = std::mem::take(chunk.data_mut());
        for spec in &self.slices {
            let range = crate::multibin::parse_slice(spec, data.len())?;
            sink(chunk.derive(data[range].to_vec()))?;
        }
        Ok(())
    }
}

/// `sep [DATA]`: insert a separator between the chunks of every frame
/// and make all chunks visible; meant to sit at the end of a frame
pub struct Sep {
    data: Multibin,
}

impl Sep {
    /// Creates the unit from its separator expression
    pub fn new(data: Multibin) -> Self {
        Self { data }
    }
}

impl Unit for Sep {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let separator = self.data.eval_on(&mut chunk)?;
        chunk.set_visible(true);
        chunk.set_next_scope(true);
        if chunk.path().last().copied().unwrap_or(0) > 0 {
            sink(chunk.derive(separator))?;
        }
        sink(chunk)
    }
}

/// `scope SLICE…`: restrict visibility within the current frame to the
/// chunks at the given indices
pub struct Scope {
    slices: Vec<(u64, Option<u64>)>,
}

impl Scope {
    /// Parses the index slices naming the chunks that stay visible
    pub fn new(specs: Vec<String>) -> Result<Self> {
        let mut slices = Vec::new();
        for spec in &specs {
            let parse = |bound: &str| -> Result<Option<u64>> {
                if bound.is_empty() {
                    return Ok(None);
                }
                bound
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| Error::argument(format!("invalid frame index: {bound:?}")))
            };
            let (start, end) = match spec.split_once(':') {
                Some((s, e)) => (parse(s)?.unwrap_or(0), parse(e)?),
                None => {
                    let index = parse(spec)?
                        .ok_or_else(|| Error::argument("empty scope index"))?;
                    (index, Some(index + 1))
                }
            };
            slices.push((start, end));
        }
        Ok(Self { slices })
    }

    fn selected(&self, index: u64) -> bool {
        self.slices
            .iter()
            .any(|(start, end)| index >= *start && end.map(|e| index < e).unwrap_or(true))
    }
}

impl Unit for Scope {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let index = chunk.path().last().copied().unwrap_or(0);
        let visible = self.selected(index);
        chunk.set_visible(visible);
        chunk.set_next_scope(visible);
        sink(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(unit: &mut dyn Unit, chunk: Chunk) -> Vec<Chunk> {
        let mut out = Vec::new();
        let mut sink = |c: Chunk| {
            out.push(c);
            Ok(())
        };
        unit.process(chunk, &mut sink).unwrap();
        out
    }

    #[test]
    fn test_emit_one_chunk_per_argument() {
        let mut emit = Emit::new(vec![
            Multibin::parse("BINARY").unwrap(),
            Multibin::parse("REFINERY").unwrap(),
        ]);
        let out = collect(&mut emit, Chunk::new(Vec::new()));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data(), b"BINARY");
        assert_eq!(out[1].data(), b"REFINERY");
    }

    #[test]
    fn test_affix_roundtrip() {
        let mut ccp = Affix::prepend(Multibin::parse("F").unwrap());
        let out = collect(&mut ccp, Chunk::new(b"OO".to_vec()));
        assert_eq!(out[0].data(), b"FOO");

        let mut sink_out = Vec::new();
        let mut sink = |c: Chunk| {
            sink_out.push(c);
            Ok(())
        };
        ccp.reverse(Chunk::new(b"FOO".to_vec()), &mut sink).unwrap();
        assert_eq!(sink_out[0].data(), b"OO");
    }

    #[test]
    fn test_chop_blocks() {
        let mut chop = Chop::new(Multibin::parse("2").unwrap());
        let out = collect(&mut chop, Chunk::new(b"OOOOOOO".to_vec()));
        let payloads: Vec<_> = out.iter().map(|c| c.data().to_vec()).collect();
        assert_eq!(payloads, [&b"OO"[..], b"OO", b"OO", b"O"]);
    }

    #[test]
    fn test_resplit_newlines() {
        let mut resplit = Resplit::new(Multibin::parse("\\n").unwrap());
        let out = collect(&mut resplit, Chunk::new(b"abc\ndef".to_vec()));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data(), b"abc");
        assert_eq!(out[1].data(), b"def");
    }

    #[test]
    fn test_resplit_inherits_meta() {
        use crate::meta::MetaValue;
        let mut resplit = Resplit::new(Multibin::parse("\\n").unwrap());
        let mut input = Chunk::new(b"a\nb".to_vec());
        input.bind("k", MetaValue::Int(7)).unwrap();
        let out = collect(&mut resplit, input);
        for chunk in &out {
            assert_eq!(chunk.meta_get("k"), Some(MetaValue::Int(7)));
        }
    }

    #[test]
    fn test_snip_slices() {
        let mut snip = Snip::new(vec![":3".into(), "-2:".into()]);
        let out = collect(&mut snip, Chunk::new(b"0123456789".to_vec()));
        assert_eq!(out[0].data(), b"012");
        assert_eq!(out[1].data(), b"89");
    }

    #[test]
    fn test_sep_between_frame_chunks() {
        let mut sep = Sep::new(Multibin::parse("-").unwrap());
        let mut first = Chunk::new(b"a".to_vec());
        first.path_mut().clear();
        first.path_mut().extend([0, 0]);
        let out = collect(&mut sep, first);
        assert_eq!(out.len(), 1); // no separator before the first chunk

        let mut second = Chunk::new(b"b".to_vec());
        second.path_mut().clear();
        second.path_mut().extend([0, 1]);
        let out = collect(&mut sep, second);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data(), b"-");
        assert_eq!(out[1].data(), b"b");
    }

    #[test]
    fn test_scope_limits_visibility() {
        let mut scope = Scope::new(vec!["0".into()]).unwrap();
        let mut first = Chunk::new(b"BINARY".to_vec());
        first.path_mut().clear();
        first.path_mut().extend([0, 0]);
        let mut second = Chunk::new(b"REFINERY".to_vec());
        second.path_mut().clear();
        second.path_mut().extend([0, 1]);
        assert!(collect(&mut scope, first)[0].visible());
        assert!(!collect(&mut scope, second)[0].visible());
    }
}
