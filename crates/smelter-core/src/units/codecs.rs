//! Codec units: transcoders between binary data and textual encodings,
//! plus zlib compression. The forward direction decodes; `-R` encodes.

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::multibin::handlers::{
    b64_decode, b64_encode, b85_decode, b85_encode, escape_decode_bytes, escape_encode,
    hex_decode, hex_encode, url_decode, url_encode,
};
use crate::unit::{Sink, Unit};
use flate2::read::{DeflateDecoder, ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Read;

/// A reversible byte-for-byte codec: decode forward, encode in reverse
pub struct ByteCodec {
    name: &'static str,
    decode: fn(&[u8]) -> Result<Vec<u8>>,
    encode: fn(&[u8]) -> Vec<u8>,
}

impl ByteCodec {
    /// Hexadecimal digits
    pub fn hex() -> Self {
        Self {
            name: "hex",
            decode: hex_decode,
            encode: hex_encode,
        }
    }

    /// Base64, padding optional on decode
    pub fn b64() -> Self {
        Self {
            name: "b64",
            decode: b64_decode,
            encode: b64_encode,
        }
    }

    /// Base85
    pub fn b85() -> Self {
        Self {
            name: "b85",
            decode: b85_decode,
            encode: b85_encode,
        }
    }

    /// Percent-encoding
    pub fn url() -> Self {
        Self {
            name: "url",
            decode: |data| Ok(url_decode(data)),
            encode: url_encode,
        }
    }

    /// Backslash escape sequences
    pub fn esc() -> Self {
        Self {
            name: "esc",
            decode: escape_decode_bytes,
            encode: escape_encode,
        }
    }
}

impl Unit for ByteCodec {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let decoded = (self.decode)(chunk.data())
            .map_err(|e| Error::unit(self.name, e.to_string()).with_path(chunk.path_string()))?;
        chunk.set_data(decoded);
        sink(chunk)
    }

    fn reverse(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let encoded = (self.encode)(chunk.data());
        chunk.set_data(encoded);
        sink(chunk)
    }
}

/// `zl`: zlib decompression; falls back to a raw deflate stream when the
/// two byte header is absent. The reverse direction compresses at the
/// highest level.
pub struct Zl;

fn zl_decode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    if ZlibDecoder::new(data).read_to_end(&mut out).is_ok() {
        return Ok(out);
    }
    out.clear();
    DeflateDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

impl Unit for Zl {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let decoded = zl_decode(chunk.data()).map_err(|e| {
            Error::unit("zl", format!("decompression failed: {e}")).with_path(chunk.path_string())
        })?;
        chunk.set_data(decoded);
        sink(chunk)
    }

    fn reverse(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let mut out = Vec::new();
        ZlibEncoder::new(chunk.data(), Compression::best()).read_to_end(&mut out)?;
        chunk.set_data(out);
        sink(chunk)
    }
}

/// `pack`: extract numbers from textual input and pack them as bytes.
///
/// The positional argument selects the base; `0` (the default) accepts
/// decimal and `0x` prefixed hex. The reverse direction renders each
/// byte as a number in the base (base 10 when auto), one per line.
pub struct Pack {
    base: u32,
}

impl Pack {
    /// Creates the unit; base 0 accepts decimal and 0x-prefixed hex
    pub fn new(base: u32) -> Result<Self> {
        if base != 0 && !(2..=36).contains(&base) {
            return Err(Error::argument(format!("invalid base: {base}")));
        }
        Ok(Self { base })
    }

    fn parse_token(&self, token: &str) -> Option<u64> {
        if self.base == 0 {
            let token = token.trim_start_matches('+');
            if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
                return u64::from_str_radix(hex, 16).ok();
            }
            return token.parse().ok();
        }
        u64::from_str_radix(token, self.base).ok()
    }
}

impl Unit for Pack {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let text = String::from_utf8_lossy(chunk.data()).into_owned();
        let mut out = Vec::new();
        for token in text.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let Some(value) = self.parse_token(token) else {
                continue; // non-numeric tokens are skipped, not an error
            };
            if value > u8::MAX as u64 {
                // wider values contribute all of their bytes
                let bytes = value.to_be_bytes();
                let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
                out.extend_from_slice(&bytes[skip..]);
            } else {
                out.push(value as u8);
            }
        }
        chunk.set_data(out);
        sink(chunk)
    }

    fn reverse(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let base = if self.base == 0 { 10 } else { self.base };
        let mut lines = Vec::new();
        for &byte in chunk.data() {
            if !lines.is_empty() {
                lines.push(b'\n');
            }
            lines.extend(render_radix(byte as u64, base).into_bytes());
        }
        chunk.set_data(lines);
        sink(chunk)
    }
}

fn render_radix(mut value: u64, base: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % base as u64) as usize]);
        value /= base as u64;
    }
    out.reverse();
    String::from_utf8(out).expect("radix digits are ascii")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(unit: &mut dyn Unit, data: &[u8], reverse: bool) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut sink = |c: Chunk| {
            out.push(c.into_data());
            Ok(())
        };
        let chunk = Chunk::new(data.to_vec());
        if reverse {
            unit.reverse(chunk, &mut sink).unwrap();
        } else {
            unit.process(chunk, &mut sink).unwrap();
        }
        out
    }

    #[test]
    fn test_codecs_invert() {
        // U.process(U.reverse(x)) == x for every documented codec
        let samples: &[&[u8]] = &[b"", b"Hello World", &[0, 1, 2, 254, 255]];
        let mut units: Vec<Box<dyn Unit>> = vec![
            Box::new(ByteCodec::hex()),
            Box::new(ByteCodec::b64()),
            Box::new(ByteCodec::b85()),
            Box::new(ByteCodec::url()),
            Box::new(ByteCodec::esc()),
            Box::new(Zl),
        ];
        for unit in &mut units {
            for sample in samples {
                let encoded = run(unit.as_mut(), sample, true);
                let decoded = run(unit.as_mut(), &encoded[0], false);
                assert_eq!(&decoded[0], sample);
            }
        }
    }

    #[test]
    fn test_zl_known_stream() {
        // zlib.compress(b"molten byte stream", 9)
        let compressed =
            hex_decode(b"78dacbcdcf2949cd5348aa2c4955282e294a4dcc0500436b0710").unwrap();
        let out = run(&mut Zl, &compressed, false);
        assert_eq!(out[0], b"molten byte stream");
    }

    #[test]
    fn test_zl_bad_stream_is_unit_error() {
        let mut sink = |_c: Chunk| Ok(());
        let err = Zl
            .process(Chunk::new(b"not compressed".to_vec()), &mut sink)
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_pack_auto_base() {
        let mut pack = Pack::new(0).unwrap();
        let out = run(&mut pack, b"0xBA 0xAD 0xC0 0xFF 0xEE", false);
        assert_eq!(out[0], [0xBA, 0xAD, 0xC0, 0xFF, 0xEE]);
        let out = run(&mut pack, b"65, 66 junk 67", false);
        assert_eq!(out[0], b"ABC");
    }

    #[test]
    fn test_pack_hex_base_and_reverse() {
        let mut pack = Pack::new(16).unwrap();
        let out = run(&mut pack, b"ba ad", false);
        assert_eq!(out[0], [0xBA, 0xAD]);
        let out = run(&mut pack, &[0xBA, 0xAD], true);
        assert_eq!(out[0], b"ba\nad");
    }

    #[test]
    fn test_pack_wide_values() {
        let mut pack = Pack::new(0).unwrap();
        let out = run(&mut pack, b"0xBAAD", false);
        assert_eq!(out[0], [0xBA, 0xAD]);
    }
}
