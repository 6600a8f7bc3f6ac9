//! The multibin handler registry and the built-in handlers.
//!
//! A handler is a named function from (payload bytes, evaluation context)
//! to bytes. Decoders transform the payload, readers pull values out of
//! the chunk's meta store, slicers address the chunk payload itself, and
//! generators synthesize byte sequences from nothing. The registry is
//! read-only after startup.

use crate::error::{Error, Result};
use crate::meta::is_valid_name;
use crate::multibin::{calc, decode_escapes, parse_slice, EvalCtx};
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::{alphabet, Engine as _};
use md5::{Digest as _, Md5};
use sha1::Sha1;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

/// Base64 engine that accepts both padded and unpadded input
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The 85 character alphabet of the original's base85 flavor
const B85_ALPHABET: &[u8; 85] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz!#$%&()*+-;<=>?@^_`{|}~";

/// PBKDF2 defaults for the `pbkdf2[size,salt]` shortcut
pub const PBKDF2_DEFAULT_ITERATIONS: u32 = 1000;

type HandlerFn = fn(&mut EvalCtx<'_>, &[String], Vec<u8>) -> Result<Vec<u8>>;

/// A named multibin handler
pub struct Handler {
    /// Name used in argument expressions
    pub name: &'static str,
    /// One-line description shown in `--help`
    pub about: &'static str,
    /// True if the handler can terminate a chain without a payload
    pub nullary: bool,
    /// True if the handler consults the chunk and must re-run per chunk
    pub volatile: bool,
    run: HandlerFn,
}

impl Handler {
    /// Applies the handler to a payload
    pub fn run(&self, ctx: &mut EvalCtx<'_>, args: &[String], input: Vec<u8>) -> Result<Vec<u8>> {
        (self.run)(ctx, args, input)
    }
}

/// The named set of multibin handlers
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl HandlerRegistry {
    /// The registry of built-in handlers
    pub fn builtin() -> &'static HandlerRegistry {
        static REGISTRY: OnceLock<HandlerRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            let mut handlers = HashMap::new();
            for handler in builtin_handlers() {
                handlers.insert(handler.name, handler);
            }
            HandlerRegistry { handlers }
        })
    }

    /// Looks up a handler by name
    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    /// Iterates over all handlers sorted by name
    pub fn iter(&self) -> impl Iterator<Item = &Handler> {
        let mut items: Vec<_> = self.handlers.values().collect();
        items.sort_by_key(|h| h.name);
        items.into_iter()
    }
}

fn arg_int(args: &[String], index: usize, what: &str) -> Result<i64> {
    let raw = args
        .get(index)
        .ok_or_else(|| Error::argument(format!("missing {what} argument")))?;
    calc::parse_int(raw).ok_or_else(|| Error::argument(format!("invalid {what}: {raw:?}")))
}

#[rustfmt::skip]
fn builtin_handlers() -> Vec<Handler> {
    vec![
        Handler { name: "hex", about: "decode hexadecimal digits, whitespace ignored", nullary: false, volatile: false, run: |_, _, input| hex_decode(&input) },
        Handler { name: "b64", about: "decode base64, padding optional", nullary: false, volatile: false, run: |_, _, input| b64_decode(&input) },
        Handler { name: "b85", about: "decode base85", nullary: false, volatile: false, run: |_, _, input| b85_decode(&input) },
        Handler { name: "url", about: "decode percent-encoding", nullary: false, volatile: false, run: |_, _, input| Ok(url_decode(&input)) },
        Handler { name: "esc", about: "decode backslash escape sequences", nullary: false, volatile: false, run: |_, _, input| escape_decode_bytes(&input) },
        Handler { name: "var", about: "read the named meta variable of the current chunk", nullary: false, volatile: true, run: run_var },
        Handler { name: "cut", about: "slice the chunk payload and remove the slice from it", nullary: false, volatile: true, run: run_cut },
        Handler { name: "copy", about: "slice the chunk payload, leaving it intact", nullary: false, volatile: true, run: run_copy },
        Handler { name: "md5", about: "MD5 digest of the payload", nullary: false, volatile: false, run: |_, _, input| Ok(Md5::digest(&input).to_vec()) },
        Handler { name: "sha1", about: "SHA-1 digest of the payload", nullary: false, volatile: false, run: |_, _, input| Ok(Sha1::digest(&input).to_vec()) },
        Handler { name: "sha256", about: "SHA-256 digest of the payload", nullary: false, volatile: false, run: |_, _, input| Ok(Sha256::digest(&input).to_vec()) },
        Handler { name: "pbkdf2", about: "pbkdf2[size,salt,iter?]: derive a key from the payload (HMAC-SHA1, 1000 iterations by default)", nullary: false, volatile: false, run: run_pbkdf2 },
        Handler { name: "q", about: "q[unit args..]: run a unit over the payload in memory", nullary: false, volatile: false, run: run_q },
        Handler { name: "eat", about: "eat[unit args..]: run a unit over the chunk payload, consuming it", nullary: true, volatile: true, run: run_eat },
        Handler { name: "rep", about: "rep[count]: repeat the payload", nullary: false, volatile: false, run: run_rep },
        Handler { name: "accu", about: "accu[count,seed,expr]: bytes of the feedback sequence A := expr(A)", nullary: true, volatile: false, run: run_accu },
        Handler { name: "range", about: "range:S:E: the byte sequence S..E", nullary: false, volatile: false, run: run_range },
        Handler { name: "file", about: "file[start,end?]:path: read bytes from a file", nullary: false, volatile: false, run: run_file },
    ]
}

fn run_var(ctx: &mut EvalCtx<'_>, _args: &[String], input: Vec<u8>) -> Result<Vec<u8>> {
    let name = String::from_utf8(input)
        .map_err(|_| Error::argument("variable name is not valid utf-8"))?;
    let name = name.trim();
    if !is_valid_name(name) && !crate::meta::RESERVED_NAMES.contains(&name) {
        return Err(Error::argument(format!("invalid variable name: {name:?}")));
    }
    ctx.chunk
        .meta_get(name)
        .map(|value| value.to_bytes())
        .ok_or_else(|| Error::argument(format!("variable {name} is not bound")))
}

fn run_cut(ctx: &mut EvalCtx<'_>, _args: &[String], input: Vec<u8>) -> Result<Vec<u8>> {
    let spec = String::from_utf8(input)
        .map_err(|_| Error::argument("slice specification is not valid utf-8"))?;
    let range = parse_slice(&spec, ctx.chunk.data().len())?;
    Ok(ctx.chunk.data_mut().drain(range).collect())
}

fn run_copy(ctx: &mut EvalCtx<'_>, _args: &[String], input: Vec<u8>) -> Result<Vec<u8>> {
    let spec = String::from_utf8(input)
        .map_err(|_| Error::argument("slice specification is not valid utf-8"))?;
    let range = parse_slice(&spec, ctx.chunk.data().len())?;
    Ok(ctx.chunk.data()[range].to_vec())
}

fn run_pbkdf2(_ctx: &mut EvalCtx<'_>, args: &[String], input: Vec<u8>) -> Result<Vec<u8>> {
    let size = arg_int(args, 0, "key size")?;
    if !(1..=1024).contains(&size) {
        return Err(Error::argument(format!("invalid key size: {size}")));
    }
    let salt = args
        .get(1)
        .map(|s| decode_escapes(s))
        .transpose()?
        .unwrap_or_default();
    let iterations = match args.get(2) {
        Some(_) => arg_int(args, 2, "iteration count")? as u32,
        None => PBKDF2_DEFAULT_ITERATIONS,
    };
    let mut key = vec![0u8; size as usize];
    pbkdf2::pbkdf2_hmac::<Sha1>(&input, &salt, iterations, &mut key);
    Ok(key)
}

fn subpipe_tokens(args: &[String]) -> Result<Vec<String>> {
    let tokens: Vec<String> = args
        .iter()
        .flat_map(|a| a.split_whitespace())
        .map(str::to_string)
        .collect();
    if tokens.is_empty() {
        return Err(Error::argument("empty unit invocation"));
    }
    Ok(tokens)
}

fn run_q(_ctx: &mut EvalCtx<'_>, args: &[String], input: Vec<u8>) -> Result<Vec<u8>> {
    let tokens = subpipe_tokens(args)?;
    crate::pipeline::run_oneshot(&tokens, input)
}

fn run_eat(ctx: &mut EvalCtx<'_>, args: &[String], _input: Vec<u8>) -> Result<Vec<u8>> {
    let data = std::mem::take(ctx.chunk.data_mut());
    if args.is_empty() {
        return Ok(data);
    }
    let tokens = subpipe_tokens(args)?;
    crate::pipeline::run_oneshot(&tokens, data)
}

fn run_rep(_ctx: &mut EvalCtx<'_>, args: &[String], input: Vec<u8>) -> Result<Vec<u8>> {
    let count = arg_int(args, 0, "repeat count")?;
    if count < 0 {
        return Err(Error::argument(format!("invalid repeat count: {count}")));
    }
    Ok(input.repeat(count as usize))
}

fn run_accu(_ctx: &mut EvalCtx<'_>, args: &[String], _input: Vec<u8>) -> Result<Vec<u8>> {
    let count = arg_int(args, 0, "byte count")?;
    if count < 0 {
        return Err(Error::argument(format!("invalid byte count: {count}")));
    }
    let mut a = match args.get(1) {
        Some(_) => arg_int(args, 1, "seed")?,
        None => 0,
    };
    let expr = args.get(2).map(String::as_str).unwrap_or("A+1");
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push((a & 0xFF) as u8);
        a = calc::eval_expr(expr, a)?;
    }
    Ok(out)
}

fn run_range(_ctx: &mut EvalCtx<'_>, _args: &[String], input: Vec<u8>) -> Result<Vec<u8>> {
    let spec = String::from_utf8(input)
        .map_err(|_| Error::argument("range specification is not valid utf-8"))?;
    let (start, end) = match spec.split_once(':') {
        Some((s, e)) => (
            calc::parse_int(s.trim()).ok_or_else(|| {
                Error::argument(format!("invalid range bound: {s:?}"))
            })?,
            calc::parse_int(e.trim()).ok_or_else(|| {
                Error::argument(format!("invalid range bound: {e:?}"))
            })?,
        ),
        None => (
            0,
            calc::parse_int(spec.trim()).ok_or_else(|| {
                Error::argument(format!("invalid range bound: {spec:?}"))
            })?,
        ),
    };
    if end < start {
        return Err(Error::argument(format!("empty range: {spec}")));
    }
    Ok((start..end).map(|v| (v & 0xFF) as u8).collect())
}

/// Resolves a handler path: absolute and locally present paths win,
/// otherwise relative paths are retried under `SMELTER_HOME`
fn resolve_path(path: &str, home: Option<&str>) -> std::path::PathBuf {
    let direct = std::path::PathBuf::from(path);
    if direct.is_absolute() || direct.exists() {
        return direct;
    }
    match home {
        Some(home) => std::path::Path::new(home).join(path),
        None => direct,
    }
}

fn run_file(_ctx: &mut EvalCtx<'_>, args: &[String], input: Vec<u8>) -> Result<Vec<u8>> {
    let path = String::from_utf8(input)
        .map_err(|_| Error::argument("file path is not valid utf-8"))?;
    let home = std::env::var("SMELTER_HOME").ok();
    let path = resolve_path(&path, home.as_deref());
    debug!(path = %path.display(), "reading file for multibin argument");
    let data = std::fs::read(&path)?;
    if args.is_empty() {
        return Ok(data);
    }
    let start = arg_int(args, 0, "start offset")?.clamp(0, data.len() as i64) as usize;
    let end = match args.get(1) {
        Some(_) => arg_int(args, 1, "end offset")?.clamp(start as i64, data.len() as i64) as usize,
        None => data.len(),
    };
    Ok(data[start..end].to_vec())
}

// byte-level codecs, shared with the codec units

/// Decodes ASCII hex digits, ignoring whitespace
pub fn hex_decode(input: &[u8]) -> Result<Vec<u8>> {
    let digits: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return Err(Error::argument("odd number of hex digits"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16);
            let lo = (pair[1] as char).to_digit(16);
            match (hi, lo) {
                (Some(hi), Some(lo)) => Ok((hi * 16 + lo) as u8),
                _ => Err(Error::argument(format!(
                    "invalid hex digits: {}{}",
                    pair[0] as char, pair[1] as char
                ))),
            }
        })
        .collect()
}

/// Encodes bytes as uppercase hex
pub fn hex_encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 2);
    for byte in input {
        out.push(b"0123456789ABCDEF"[(byte >> 4) as usize]);
        out.push(b"0123456789ABCDEF"[(byte & 0xF) as usize]);
    }
    out
}

/// Decodes base64, accepting both padded and unpadded input
pub fn b64_decode(input: &[u8]) -> Result<Vec<u8>> {
    let trimmed: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    B64.decode(&trimmed)
        .map_err(|e| Error::argument(format!("invalid base64: {e}")))
}

/// Encodes bytes as padded base64
pub fn b64_encode(input: &[u8]) -> Vec<u8> {
    B64.encode(input).into_bytes()
}

fn b85_index(c: u8) -> Option<u32> {
    B85_ALPHABET.iter().position(|&a| a == c).map(|i| i as u32)
}

/// Decodes base85 in the original's alphabet
pub fn b85_decode(input: &[u8]) -> Result<Vec<u8>> {
    let chars: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let mut out = Vec::with_capacity(chars.len() / 5 * 4 + 4);
    for group in chars.chunks(5) {
        let short = 5 - group.len();
        if short == 4 {
            return Err(Error::argument("truncated base85 group"));
        }
        let mut value: u64 = 0;
        for i in 0..5 {
            // short groups are padded with the highest alphabet character
            let c = group.get(i).copied().unwrap_or(b'~');
            let digit = b85_index(c)
                .ok_or_else(|| Error::argument(format!("invalid base85 character: {}", c as char)))?;
            value = value * 85 + digit as u64;
        }
        if value > u32::MAX as u64 {
            return Err(Error::argument("invalid base85 group"));
        }
        let bytes = (value as u32).to_be_bytes();
        out.extend_from_slice(&bytes[..4 - short]);
    }
    Ok(out)
}

/// Encodes bytes as base85 in the original's alphabet
pub fn b85_encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() / 4 * 5 + 5);
    for group in input.chunks(4) {
        let short = 4 - group.len();
        let mut padded = [0u8; 4];
        padded[..group.len()].copy_from_slice(group);
        let mut value = u32::from_be_bytes(padded);
        let mut digits = [0u8; 5];
        for slot in digits.iter_mut().rev() {
            *slot = B85_ALPHABET[(value % 85) as usize];
            value /= 85;
        }
        out.extend_from_slice(&digits[..5 - short]);
    }
    out
}

/// Decodes percent-encoded bytes; malformed sequences pass through
pub fn url_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' && i + 2 < input.len() {
            let hi = (input[i + 1] as char).to_digit(16);
            let lo = (input[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

/// Percent-encodes everything outside the unreserved set
pub fn url_encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    for &byte in input {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte);
        } else {
            out.push(b'%');
            out.extend_from_slice(&hex_encode(&[byte]));
        }
    }
    out
}

/// Decodes backslash escapes in a byte payload
pub fn escape_decode_bytes(input: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(input)
        .map_err(|_| Error::argument("escaped payload is not valid utf-8"))?;
    decode_escapes(text)
}

/// Escapes non-printable bytes with backslash sequences
pub fn escape_encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    for &byte in input {
        match byte {
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'"' => out.extend_from_slice(b"\\\""),
            0x20..=0x7E => out.push(byte),
            _ => {
                out.extend_from_slice(b"\\x");
                out.extend_from_slice(&hex_encode(&[byte]).to_ascii_lowercase());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::meta::MetaValue;
    use crate::multibin::Multibin;

    fn eval_on(source: &str, chunk: &mut Chunk) -> Result<Vec<u8>> {
        Multibin::parse(source)?.eval_on(chunk)
    }

    fn eval(source: &str) -> Vec<u8> {
        let mut chunk = Chunk::new(Vec::new());
        eval_on(source, &mut chunk).unwrap()
    }

    #[test]
    fn test_hex_roundtrip() {
        assert_eq!(hex_decode(b"48 65 6c 6C").unwrap(), b"Hell");
        assert_eq!(hex_encode(b"\xBA\xAD\xC0\xFF\xEE"), b"BAADC0FFEE");
        assert!(hex_decode(b"123").is_err());
        assert!(hex_decode(b"zz").is_err());
    }

    #[test]
    fn test_b64() {
        assert_eq!(b64_decode(b"SGVsbG8=").unwrap(), b"Hello");
        assert_eq!(b64_decode(b"SGVsbG8").unwrap(), b"Hello");
        assert_eq!(b64_encode(b"Hello"), b"SGVsbG8=");
        assert!(b64_decode(b"!!").is_err());
    }

    #[test]
    fn test_b85() {
        // vector produced with the reference implementation
        assert_eq!(b85_decode(b"NM&qnZy;B1a%^M").unwrap(), b"Hello World");
        assert_eq!(b85_encode(b"Hello World"), b"NM&qnZy;B1a%^M");
        assert_eq!(b85_encode(&[0, 0, 0, 0]), b"00000");
        assert_eq!(b85_decode(b"|NsC0").unwrap(), [0xFF; 4]);
        assert!(b85_decode(b"\x01").is_err());
    }

    #[test]
    fn test_url() {
        assert_eq!(url_decode(b"a%20b%3f"), b"a b?");
        assert_eq!(url_decode(b"100%"), b"100%");
        assert_eq!(url_encode(b"a b?"), b"a%20b%3F");
    }

    #[test]
    fn test_escape_codec() {
        assert_eq!(escape_decode_bytes(b"a\\x00b\\n").unwrap(), b"a\x00b\n");
        assert_eq!(escape_encode(b"a\x00b\n"), b"a\\x00b\\n");
    }

    #[test]
    fn test_digests() {
        assert_eq!(
            hex_encode(&eval("sha1:abc")).to_ascii_lowercase(),
            b"a9993e364706816aba3e25717850c26c9cd0d89d".to_vec()
        );
        assert_eq!(
            hex_encode(&eval("sha256:abc")).to_ascii_lowercase(),
            b"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".to_vec()
        );
        assert_eq!(
            hex_encode(&eval("md5:x")).to_ascii_lowercase(),
            b"9dd4e461268c8034f5c8564e155c67a6".to_vec()
        );
    }

    #[test]
    fn test_pbkdf2_defaults() {
        // pbkdf2_hmac_sha1("swordfish", "s4lty", 1000, 32)
        let key = eval("pbkdf2[32,s4lty]:swordfish");
        assert_eq!(
            hex_encode(&key).to_ascii_lowercase(),
            b"be13189447db555fa0e43bf08c90be5a47d151b9796728025d3338ccc871bc4c".to_vec()
        );
    }

    #[test]
    fn test_cut_mutates_chunk() {
        let mut chunk = Chunk::new(b"0123456789".to_vec());
        let out = eval_on("cut::4", &mut chunk).unwrap();
        assert_eq!(out, b"0123");
        assert_eq!(chunk.data(), b"456789");
    }

    #[test]
    fn test_copy_leaves_chunk() {
        let mut chunk = Chunk::new(b"0123456789".to_vec());
        let out = eval_on("copy:2:4", &mut chunk).unwrap();
        assert_eq!(out, b"23");
        assert_eq!(chunk.data(), b"0123456789");
    }

    #[test]
    fn test_var_missing_is_error() {
        let mut chunk = Chunk::new(Vec::new());
        assert!(eval_on("var:nope", &mut chunk).is_err());
        chunk.bind("k", MetaValue::Int(5)).unwrap();
        assert_eq!(eval_on("var:k", &mut chunk).unwrap(), b"5");
    }

    #[test]
    fn test_rep_and_range() {
        assert_eq!(eval("rep[3]:ab"), b"ababab");
        assert_eq!(eval("range:0x41:0x44"), b"ABC");
        assert_eq!(eval("range:3"), [0, 1, 2]);
    }

    #[test]
    fn test_accu_sequence() {
        assert_eq!(eval("accu[4,1,A*2]"), [1, 2, 4, 8]);
        assert_eq!(eval("accu[3]"), [0, 1, 2]);
    }

    #[test]
    fn test_eat_consumes_chunk() {
        let mut chunk = Chunk::new(b"414243".to_vec());
        let out = eval_on("eat[hex]", &mut chunk).unwrap();
        assert_eq!(out, b"ABC");
        assert!(chunk.data().is_empty());
    }

    #[test]
    fn test_resolve_path_prefers_local_then_home() {
        assert_eq!(
            resolve_path("/abs/x", Some("/home")),
            std::path::PathBuf::from("/abs/x")
        );
        assert_eq!(
            resolve_path("definitely/missing.bin", Some("/home")),
            std::path::PathBuf::from("/home/definitely/missing.bin")
        );
        assert_eq!(
            resolve_path("definitely/missing.bin", None),
            std::path::PathBuf::from("definitely/missing.bin")
        );
    }

    #[test]
    fn test_file_handler() {
        use std::io::Write as _;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let path = tmp.path().to_str().unwrap();
        let mut chunk = Chunk::new(Vec::new());
        assert_eq!(
            eval_on(&format!("file:{path}"), &mut chunk).unwrap(),
            b"0123456789"
        );
        let mut chunk = Chunk::new(Vec::new());
        assert_eq!(
            eval_on(&format!("file[2,6]:{path}"), &mut chunk).unwrap(),
            b"2345"
        );
    }
}
