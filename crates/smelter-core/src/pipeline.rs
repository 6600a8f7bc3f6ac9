//! The pipeline driver: bracket tokenization, stage wiring and the
//! streaming execution engine.
//!
//! A parsed command line is a flat sequence of unit invocations with
//! bracket tokens between them. Opening brackets attach to the preceding
//! unit: the outputs it produces for one input chunk form one frame of
//! the new layer. Closing brackets truncate the frame coordinate again,
//! prune meta variables bound inside the frame and re-enumerate chunk
//! indices; closing more frames than are open is tolerated and simply
//! leaves the stream at depth zero.
//!
//! Execution is single-threaded and pull-based: every stage is an
//! iterator over `Result<Chunk>` wrapping its upstream, so chunks flow
//! one at a time and nothing buffers a whole stream. The only buffering
//! happens where the contract demands it: frame-aware units hold exactly
//! one frame.
//!
//! Output is framed while frames remain open (or when a framed input
//! passes through untouched); otherwise chunks leave as raw bytes with
//! line breaks between them, and the `[]` squeeze marker is the explicit
//! way to fuse a unit's outputs into contiguous bytes.

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::frame::{FrameReader, FrameWriter, OutputMode};
use crate::unit::{Unit, UnitOpts, UnitSpec};
use crate::units;
use std::cell::Cell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use tracing::warn;

/// A lexed command line token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A unit name, switch or argument
    Word(String),
    /// Stage separator `|`
    Pipe,
    /// `[`: open a frame around the outputs of the preceding unit
    Open,
    /// `[|`: open a frame whose chunks turn invisible when it closes
    ScopedOpen,
    /// `]`: close the innermost frame
    Close,
    /// `|]`: close a scoped frame
    ScopedClose,
    /// `[]`: fuse the outputs of the preceding unit per input chunk
    Squeeze,
}

/// Lexes argv into words and bracket tokens.
///
/// An argv entry consisting only of the characters `[`, `]` and `|` is a
/// run of bracket tokens (`]]` closes two frames, `[]]]` is a squeeze
/// followed by two closes); anything else is a word.
pub fn lex(argv: &[String]) -> Vec<Token> {
    let mut tokens = Vec::new();
    for arg in argv {
        if arg.is_empty() || !arg.chars().all(|c| matches!(c, '[' | ']' | '|')) {
            tokens.push(Token::Word(arg.clone()));
            continue;
        }
        let bytes = arg.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let token = if bytes[i..].starts_with(b"[|") {
                i += 2;
                Token::ScopedOpen
            } else if bytes[i..].starts_with(b"|]") {
                i += 2;
                Token::ScopedClose
            } else if bytes[i..].starts_with(b"[]") {
                i += 2;
                Token::Squeeze
            } else {
                let t = match bytes[i] {
                    b'[' => Token::Open,
                    b']' => Token::Close,
                    _ => Token::Pipe,
                };
                i += 1;
                t
            };
            tokens.push(token);
        }
    }
    tokens
}

/// A lazily evaluated stream of chunks
pub type ChunkStream<'a> = Box<dyn Iterator<Item = Result<Chunk>> + 'a>;

/// Wraps a frame reader as a chunk stream
struct ReaderStream<R: Read> {
    reader: FrameReader<R>,
    failed: bool,
}

impl<R: Read> Iterator for ReaderStream<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.reader.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Re-enumerates trailing path indices so that every frame counts its
/// chunks up from zero
#[derive(Default)]
struct Reindex {
    prefix: Vec<u64>,
    next: u64,
    primed: bool,
}

impl Reindex {
    fn apply(&mut self, chunk: &mut Chunk) {
        let depth = chunk.path().len() - 1;
        let prefix = &chunk.path()[..depth];
        if !self.primed || prefix != self.prefix.as_slice() {
            self.prefix = prefix.to_vec();
            self.next = 0;
            self.primed = true;
        }
        chunk.path_mut()[depth] = self.next;
        self.next += 1;
    }
}

/// The per-unit stage: applies `process`/`reverse` to visible chunks,
/// forwards invisible ones, buffers one frame for frame-aware units,
/// nests outputs into fresh frames when the unit carries opening
/// brackets and optionally fuses each input's outputs into one chunk
struct UnitStage<'a> {
    upstream: ChunkStream<'a>,
    unit: Box<dyn Unit>,
    spec: &'static UnitSpec,
    opts: UnitOpts,
    /// Frames opened directly after this unit; its outputs for one input
    /// chunk populate one frame of the new layer
    nest: u32,
    /// True when the innermost opened frame is the scoped form
    scoped: bool,
    squeeze: bool,
    queue: VecDeque<Chunk>,
    /// Pending frame for frame-aware units, plus its frame prefix
    frame: Vec<Chunk>,
    frame_prefix: Vec<u64>,
    /// Canonicalizes input coordinates when they become frame prefixes
    reindex_in: Reindex,
    /// Canonicalizes the coordinates of emitted chunks
    reindex_out: Reindex,
    done: bool,
}

impl UnitStage<'_> {
    fn enqueue(&mut self, mut chunk: Chunk) {
        for _ in 0..self.nest {
            chunk.path_mut().push(0);
        }
        if self.nest > 0 && self.scoped {
            // scoped frames turn invisible on close unless a unit inside
            // schedules otherwise
            chunk.set_next_scope(false);
        }
        self.reindex_out.apply(&mut chunk);
        self.queue.push_back(chunk);
    }

    /// Runs one chunk through the unit, enqueueing its outputs.
    ///
    /// Unit errors drop the chunk with a warning; argument errors are
    /// fatal unless `-L` degrades them to unit errors.
    fn execute(&mut self, mut chunk: Chunk) -> Result<()> {
        if self.nest > 0 {
            self.reindex_in.apply(&mut chunk);
        }
        if !chunk.visible() {
            self.enqueue(chunk);
            return Ok(());
        }

        let path = chunk.path_string();
        let mut outputs: Vec<Chunk> = Vec::new();
        let mut sink = |c: Chunk| {
            outputs.push(c);
            Ok(())
        };
        let result = if self.opts.reverse {
            self.unit.reverse(chunk, &mut sink)
        } else {
            self.unit.process(chunk, &mut sink)
        };

        if let Err(e) = result {
            let e = match e {
                Error::Argument(msg) if self.opts.lenient => Error::unit(self.spec.name, msg),
                other => other,
            };
            if e.is_fatal() {
                return Err(e);
            }
            if !self.opts.quiet {
                let e = match e {
                    Error::Unit {
                        unit,
                        details,
                        path: None,
                    } => Error::Unit {
                        unit,
                        details,
                        path: Some(path),
                    },
                    other => other,
                };
                warn!("{e}");
            }
            return Ok(()); // chunk dropped, outputs discarded
        }

        if self.squeeze && outputs.len() > 1 {
            let mut fused = outputs.swap_remove(0);
            for chunk in outputs.drain(..) {
                fused.data_mut().extend_from_slice(chunk.data());
            }
            outputs.push(fused);
        }
        for chunk in outputs {
            self.enqueue(chunk);
        }
        Ok(())
    }

    /// Applies the whole-frame filter and runs the surviving chunks
    fn flush_frame(&mut self) -> Result<()> {
        if self.frame.is_empty() {
            return Ok(());
        }
        let frame = std::mem::take(&mut self.frame);
        let filtered = self.unit.filter(frame)?;
        for chunk in filtered {
            self.execute(chunk)?;
        }
        Ok(())
    }
}

impl Iterator for UnitStage<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.queue.pop_front() {
                return Some(Ok(chunk));
            }
            if self.done {
                return None;
            }
            match self.upstream.next() {
                Some(Ok(chunk)) => {
                    let result = if self.spec.frame_aware {
                        let prefix = &chunk.path()[..chunk.path().len() - 1];
                        if self.frame.is_empty() || prefix == self.frame_prefix.as_slice() {
                            self.frame_prefix = prefix.to_vec();
                            self.frame.push(chunk);
                            Ok(())
                        } else {
                            let flushed = self.flush_frame();
                            self.frame_prefix = chunk.path()[..chunk.path().len() - 1].to_vec();
                            self.frame.push(chunk);
                            flushed
                        }
                    } else {
                        self.execute(chunk)
                    };
                    if let Err(e) = result {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    if let Err(e) = self.flush_frame() {
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

/// Opens a frame with no unit in front of it: every chunk of the
/// surrounding scope becomes its own subframe holding one chunk
struct NestStage<'a> {
    upstream: ChunkStream<'a>,
    scoped: bool,
}

impl Iterator for NestStage<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = match self.upstream.next()? {
            Ok(chunk) => chunk,
            Err(e) => return Some(Err(e)),
        };
        chunk.path_mut().push(0);
        if self.scoped {
            chunk.set_next_scope(false);
        }
        Some(Ok(chunk))
    }
}

/// Closes a frame: truncates the coordinate, applies scheduled
/// visibility, prunes frame-scoped meta variables and re-enumerates the
/// parent frame. Chunks already at depth zero pass unchanged.
struct UnnestStage<'a> {
    upstream: ChunkStream<'a>,
    reindex: Reindex,
}

impl Iterator for UnnestStage<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = match self.upstream.next()? {
            Ok(chunk) => chunk,
            Err(e) => return Some(Err(e)),
        };
        if let Some(visible) = chunk.take_next_scope() {
            chunk.set_visible(visible);
        }
        if chunk.path().len() > 1 {
            chunk.path_mut().pop();
            let depth = chunk.depth();
            chunk.meta_mut().discard_deeper(depth);
            self.reindex.apply(&mut chunk);
        }
        Some(Ok(chunk))
    }
}

/// A unit invocation accumulating its trailing markers
struct Invocation {
    words: Vec<String>,
    nest: u32,
    scoped: bool,
    squeeze: bool,
    /// Set once a bracket marker follows the words; a further word then
    /// starts the next invocation, so `resplit [| put …` needs no
    /// explicit pipe after the bracket
    sealed: bool,
}

/// A compiled pipeline: the stream to drain plus the output mode
pub struct BuiltPipeline<'a> {
    /// The transformed chunk stream
    pub stream: ChunkStream<'a>,
    /// How the final chunks leave the process
    pub mode: OutputMode,
}

fn flush<'a>(pending: &mut Option<Invocation>, stream: ChunkStream<'a>) -> Result<ChunkStream<'a>> {
    match pending.take() {
        None => Ok(stream),
        Some(invocation) => {
            let (spec, unit, opts) = units::instantiate(&invocation.words)?;
            Ok(Box::new(UnitStage {
                upstream: stream,
                unit,
                spec,
                opts,
                nest: invocation.nest,
                scoped: invocation.scoped,
                squeeze: invocation.squeeze,
                queue: VecDeque::new(),
                frame: Vec::new(),
                frame_prefix: Vec::new(),
                reindex_in: Reindex::default(),
                reindex_out: Reindex::default(),
                done: false,
            }))
        }
    }
}

/// Compiles lexed tokens over an input stream.
///
/// `gauge` is the frame depth of the incoming stream and `framed` whether
/// it carried the magic marker; both feed the output mode computation.
pub fn build<'a>(
    tokens: &[Token],
    input: ChunkStream<'a>,
    gauge: u32,
    framed: bool,
) -> Result<BuiltPipeline<'a>> {
    let mut stream = input;
    let mut pending: Option<Invocation> = None;
    let mut depth = gauge as i64;
    let mut delta = 0i64;

    for token in tokens {
        match token {
            Token::Word(word) => {
                if pending.as_ref().is_some_and(|i| i.sealed) {
                    stream = flush(&mut pending, stream)?;
                }
                match &mut pending {
                    Some(invocation) => invocation.words.push(word.clone()),
                    None => {
                        pending = Some(Invocation {
                            words: vec![word.clone()],
                            nest: 0,
                            scoped: false,
                            squeeze: false,
                            sealed: false,
                        })
                    }
                }
            }
            Token::Pipe => {
                stream = flush(&mut pending, stream)?;
            }
            Token::Squeeze => match &mut pending {
                Some(invocation) => {
                    invocation.squeeze = true;
                    invocation.sealed = true;
                }
                None => return Err(Error::argument("squeeze brackets without a unit")),
            },
            Token::Open | Token::ScopedOpen => {
                let scoped = *token == Token::ScopedOpen;
                match &mut pending {
                    Some(invocation) => {
                        invocation.nest += 1;
                        invocation.scoped = scoped;
                        invocation.sealed = true;
                    }
                    None => {
                        stream = Box::new(NestStage {
                            upstream: stream,
                            scoped,
                        });
                    }
                }
                depth += 1;
                delta += 1;
            }
            Token::Close | Token::ScopedClose => {
                stream = flush(&mut pending, stream)?;
                stream = Box::new(UnnestStage {
                    upstream: stream,
                    reindex: Reindex::default(),
                });
                depth = (depth - 1).max(0);
                delta -= 1;
            }
        }
    }
    stream = flush(&mut pending, stream)?;

    let mode = if depth > 0 {
        OutputMode::Framed
    } else if framed && delta == 0 {
        OutputMode::Framed
    } else {
        OutputMode::Lines
    };
    Ok(BuiltPipeline { stream, mode })
}

/// Runs a full command line: reads a (framed or raw) stream from
/// `input`, executes every stage in process and serializes the result.
pub fn run<R: Read, W: Write>(argv: &[String], input: R, output: W) -> Result<()> {
    let reader = FrameReader::new(input)?;
    let gauge = reader.gauge();
    let framed = reader.framed();
    let stream: ChunkStream<'_> = Box::new(ReaderStream {
        reader,
        failed: false,
    });
    let tokens = lex(argv);
    let built = build(&tokens, stream, gauge, framed)?;
    drain(built, output)
}

/// Serializes a built pipeline, terminating cleanly when the consumer
/// closes its end of the pipe
pub fn drain<W: Write>(built: BuiltPipeline<'_>, output: W) -> Result<()> {
    let mut writer = FrameWriter::new(output, built.mode);
    for item in built.stream {
        let chunk = item?;
        match writer.write_chunk(&chunk) {
            Ok(()) => {}
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    match writer.finish() {
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

thread_local! {
    static RECURSION: Cell<u32> = const { Cell::new(0) };
}

/// Nested pipelines inside handlers are capped to keep recursive
/// expressions from blowing the stack
pub const MAX_RECURSION: u32 = 16;

/// Runs a unit invocation over a byte buffer in memory; the entry point
/// behind the `q` and `eat` handlers. Output payloads are concatenated.
pub fn run_oneshot(tokens: &[String], input: Vec<u8>) -> Result<Vec<u8>> {
    let depth = RECURSION.with(|r| r.get());
    if depth >= MAX_RECURSION {
        return Err(Error::argument("sub-pipeline recursion limit exceeded"));
    }
    RECURSION.with(|r| r.set(depth + 1));
    let result = (|| {
        let stream: ChunkStream<'_> = Box::new(std::iter::once(Ok(Chunk::new(input))));
        let built = build(&lex(tokens), stream, 0, false)?;
        let mut out = Vec::new();
        let mut writer = FrameWriter::new(&mut out, OutputMode::Raw);
        for item in built.stream {
            writer.write_chunk(&item?)?;
        }
        writer.finish()?;
        Ok(out)
    })();
    RECURSION.with(|r| r.set(depth));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaValue;

    fn argv(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    fn run_line(line: &str, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        run(&argv(line), input, &mut out).unwrap();
        out
    }

    #[test]
    fn test_lex_expands_bracket_runs() {
        let tokens = lex(&argv("chop 2 []]] | nop"));
        assert_eq!(
            tokens,
            vec![
                Token::Word("chop".into()),
                Token::Word("2".into()),
                Token::Squeeze,
                Token::Close,
                Token::Close,
                Token::Pipe,
                Token::Word("nop".into()),
            ]
        );
        assert_eq!(lex(&argv("[|")), vec![Token::ScopedOpen]);
        assert_eq!(lex(&argv("|]")), vec![Token::ScopedClose]);
    }

    #[test]
    fn test_single_unit_raw_passthrough() {
        assert_eq!(run_line("nop", b"hello"), b"hello");
        assert_eq!(run_line("hex", b"48656C6C6F"), b"Hello");
    }

    #[test]
    fn test_chop_frame_pipeline() {
        let out = run_line("emit OOOOOOOO | chop 2 [ | ccp F | cca . ]", b"");
        assert_eq!(out, b"FOO.\nFOO.\nFOO.\nFOO.");
    }

    #[test]
    fn test_extra_closes_are_tolerated() {
        let once = run_line("emit OOOOOOOO | chop 2 [ | ccp F ]", b"");
        let twice = run_line("emit OOOOOOOO | chop 2 [ | ccp F ]]", b"");
        assert_eq!(once, b"FOO\nFOO\nFOO\nFOO");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_squeeze_fuses_outputs() {
        // without squeeze each slice is its own chunk
        let plain = run_line("emit OOCLOOCL | chop 4 [ | snip 2:3 0:2 ]", b"");
        assert_eq!(plain, b"C\nOO\nC\nOO");
        // with squeeze each input's outputs fuse into one chunk
        let fused = run_line("emit OOCLOOCL | chop 4 [ | snip 2:3 0:2 []]", b"");
        assert_eq!(fused, b"COO\nCOO");
    }

    #[test]
    fn test_scoped_meta_example() {
        // emit "abc\ndef" | resplit "\n" [| put len size | cfmt {len}:{} |]
        // The scoped close hides the chunks from the outer pipe, so the
        // trailing ccp must leave them untouched.
        let out = run_line(
            "emit abc\\ndef | resplit [| put len size | cfmt {len}:{} |] | ccp y",
            b"",
        );
        assert_eq!(out, b"3:abc\n3:def");
    }

    #[test]
    fn test_meta_scope_pruned_after_close() {
        // len is bound inside the frame; after the close it must be gone,
        // so cfmt outside the bracket fails per chunk and drops everything
        let out = run_line(
            "emit abc\\ndef | resplit [ | put len size ] | cfmt -Q {len}:{}",
            b"",
        );
        assert_eq!(out, b"");
    }

    #[test]
    fn test_order_preservation() {
        assert_eq!(run_line("emit 3 1 2", b""), b"3\n1\n2");
        assert_eq!(run_line("emit 3 1 2 [ | nop ]", b""), b"3\n1\n2");
    }

    #[test]
    fn test_sorted_and_dedup() {
        assert_eq!(run_line("emit b a c a | sorted | dedup", b""), b"a\nb\nc");
    }

    #[test]
    fn test_frame_aware_unit_buffers_per_frame() {
        // two frames are sorted independently
        let out = run_line("emit dcba | chop 2 [ | chop 1 [ | sorted ]]", b"");
        assert_eq!(out, b"c\nd\na\nb");
    }

    #[test]
    fn test_scope_restricts_processing() {
        let out = run_line("emit BINARY REFINERY [ | scope 0 | ccp x ]", b"");
        assert_eq!(out, b"xBINARY\nREFINERY");
    }

    #[test]
    fn test_scoped_brackets_hide_chunks() {
        // chunks from a [| ... |] group stay invisible to the outer pipe;
        // the trailing ccp must not touch them
        let out = run_line("emit AB [| | ccp x |] | ccp y", b"");
        assert_eq!(out, b"xAB");
    }

    #[test]
    fn test_meta_travels_through_frames() {
        let out = run_line("emit abc | put tag T | resplit b [ | cfmt {tag}:{} ]", b"");
        assert_eq!(out, b"T:a\nT:c");
    }

    #[test]
    fn test_unit_error_drops_only_offending_chunk() {
        let out = run_line("emit 4141 zz 4242 [ | hex -Q ]", b"");
        assert_eq!(out, b"AA\nBB");
    }

    #[test]
    fn test_unknown_unit_is_argument_error() {
        let mut out = Vec::new();
        let err = run(&argv("definitely-not-a-unit"), &b""[..], &mut out).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_oneshot_subpipeline() {
        assert_eq!(run_oneshot(&argv("hex"), b"4142".to_vec()).unwrap(), b"AB");
        assert_eq!(
            run_oneshot(&argv("hex -R"), b"\xBA\xAD".to_vec()).unwrap(),
            b"BAAD"
        );
    }

    #[test]
    fn test_q_handler_uses_driver() {
        let out = run_line("emit q[hex]:4142", b"");
        assert_eq!(out, b"AB");
    }

    #[test]
    fn test_frame_roundtrip_across_processes() {
        // first process opens a frame, the second continues it, the third
        // closes it: the framed format on the intermediate pipes carries
        // the chunk structure
        let mut first = Vec::new();
        run(&argv("emit OOOOOOOO | chop 2 ["), &b""[..], &mut first).unwrap();
        let mut second = Vec::new();
        run(&argv("ccp F"), &first[..], &mut second).unwrap();
        let mut third = Vec::new();
        run(&argv("cca . ]"), &second[..], &mut third).unwrap();
        assert_eq!(third, b"FOO.\nFOO.\nFOO.\nFOO.");
    }

    #[test]
    fn test_put_binds_typed_values_across_pipe() {
        let mut first = Vec::new();
        run(&argv("emit abc | put n 7 | chop 1 ["), &b""[..], &mut first).unwrap();
        let mut reader = FrameReader::new(&first[..]).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.meta_get("n"), Some(MetaValue::Int(7)));
        assert_eq!(chunk.path(), [0, 0]);
    }

    #[test]
    fn test_recursion_cap() {
        // each level launches an in-memory emit whose argument launches
        // another; the cap turns runaway nesting into an argument error
        // instead of a stack overflow
        let mut expr = String::from("x");
        for _ in 0..MAX_RECURSION + 4 {
            expr = format!("q[emit {expr}]:z");
        }
        let args = vec!["emit".to_string(), expr];
        let mut out = Vec::new();
        assert!(run(&args, &b""[..], &mut out).is_err());
    }
}
