//! The framed pipe format: how a stream of chunks survives an OS pipe.
//!
//! A framed stream begins with a three byte magic marker and a version
//! byte, followed by a sequence of records. Chunk records carry the
//! payload, a visibility bit and the meta block; OPEN and CLOSE records
//! carry nothing and change the frame depth on the reader side. A stream
//! that does not start with the marker is raw bytes: a single visible
//! chunk at depth zero with no metadata.
//!
//! Frame coordinates are not serialized. The writer derives OPEN/CLOSE
//! runs from the paths of consecutive chunks (depth-first order), and the
//! reader reconstructs paths from a stack of per-depth counters. The two
//! are exact inverses for canonical streams, where trailing indices count
//! up from zero within every frame.

mod wire;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::meta::{MetaMap, MetaValue};
use std::io::{Read, Write};
use tracing::trace;

pub use wire::{decode_varint, put_varint, read_varint, zigzag_decode, zigzag_encode};

/// Marker identifying a framed stream
pub const MAGIC: [u8; 3] = [0x91, 0xD1, 0xF2];

/// Format version emitted after the magic marker
pub const VERSION: u8 = 0x01;

/// Record tag for a chunk; the low bit carries visibility
pub const TAG_CHUNK: u8 = 0x40;
/// Record tag opening a nested frame
pub const TAG_OPEN: u8 = 0x20;
/// Record tag closing the innermost frame
pub const TAG_CLOSE: u8 = 0x30;

/// Meta value kind tags
const KIND_BYTES: u8 = 0x01;
const KIND_INT: u8 = 0x02;
const KIND_STR: u8 = 0x03;
const KIND_LIST: u8 = 0x04;

fn put_meta_value(out: &mut Vec<u8>, value: &MetaValue) {
    match value {
        MetaValue::Bytes(b) => {
            out.push(KIND_BYTES);
            put_varint(out, b.len() as u64);
            out.extend_from_slice(b);
        }
        MetaValue::Int(i) => {
            out.push(KIND_INT);
            put_varint(out, zigzag_encode(*i));
        }
        MetaValue::Str(s) => {
            out.push(KIND_STR);
            put_varint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        MetaValue::List(items) => {
            out.push(KIND_LIST);
            put_varint(out, items.len() as u64);
            for item in items {
                put_meta_value(out, item);
            }
        }
    }
}

/// Serializes a meta store into the wire meta block. Entries are written
/// sorted by name so the encoding is deterministic.
pub fn encode_meta(meta: &MetaMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in meta.iter_sorted() {
        put_varint(&mut out, name.len() as u64);
        out.extend_from_slice(name.as_bytes());
        put_meta_value(&mut out, value);
    }
    out
}

fn take_slice<'a>(data: &mut &'a [u8], len: usize, offset: u64) -> Result<&'a [u8]> {
    if data.len() < len {
        return Err(Error::frame(offset, "truncated meta block"));
    }
    let (head, tail) = data.split_at(len);
    *data = tail;
    Ok(head)
}

fn take_varint(data: &mut &[u8]) -> Result<u64> {
    let (value, len) = decode_varint(data)?;
    *data = &data[len..];
    Ok(value)
}

fn read_meta_value(data: &mut &[u8], offset: u64) -> Result<MetaValue> {
    let kind = take_slice(data, 1, offset)?[0];
    match kind {
        KIND_BYTES => {
            let len = take_varint(data)? as usize;
            Ok(MetaValue::Bytes(take_slice(data, len, offset)?.to_vec()))
        }
        KIND_INT => Ok(MetaValue::Int(zigzag_decode(take_varint(data)?))),
        KIND_STR => {
            let len = take_varint(data)? as usize;
            let raw = take_slice(data, len, offset)?;
            let s = std::str::from_utf8(raw)
                .map_err(|_| Error::frame(offset, "meta string is not valid utf-8"))?;
            Ok(MetaValue::Str(s.to_string()))
        }
        KIND_LIST => {
            let count = take_varint(data)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(read_meta_value(data, offset)?);
            }
            Ok(MetaValue::List(items))
        }
        other => Err(Error::frame(
            offset,
            format!("unknown meta value kind: {other:#04x}"),
        )),
    }
}

/// Parses a wire meta block back into a store. Binding depths are not on
/// the wire; the caller re-binds entries at the receiving chunk's depth.
pub fn decode_meta(mut data: &[u8], offset: u64) -> Result<MetaMap> {
    let mut meta = MetaMap::new();
    while !data.is_empty() {
        let name_len = take_varint(&mut data)? as usize;
        let raw = take_slice(&mut data, name_len, offset)?;
        let name = std::str::from_utf8(raw)
            .map_err(|_| Error::frame(offset, "meta name is not valid utf-8"))?
            .to_string();
        let value = read_meta_value(&mut data, offset)?;
        meta.bind(name, value, 0);
    }
    Ok(meta)
}

/// Reads a stream of chunks from a byte pipe, framed or raw.
pub struct FrameReader<R: Read> {
    reader: R,
    framed: bool,
    /// Per-depth chunk counters; the snapshot of this stack is the path of
    /// the next chunk
    counters: Vec<u64>,
    /// First chunk, decoded eagerly to establish the stream gauge
    pending: Option<Chunk>,
    /// Raw-mode leftovers that did not match the magic marker
    head: Vec<u8>,
    offset: u64,
    done: bool,
}

impl<R: Read> FrameReader<R> {
    /// Probes the stream for the magic marker and prepares for decoding
    pub fn new(mut reader: R) -> Result<Self> {
        let mut head = vec![0u8; MAGIC.len() + 1];
        let mut filled = 0;
        while filled < head.len() {
            match reader.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        head.truncate(filled);

        let framed = filled == MAGIC.len() + 1 && head[..MAGIC.len()] == MAGIC;
        if framed && head[MAGIC.len()] != VERSION {
            return Err(Error::frame(
                MAGIC.len() as u64,
                format!("unsupported frame version: {:#04x}", head[MAGIC.len()]),
            ));
        }

        let mut this = Self {
            reader,
            framed,
            counters: vec![0],
            pending: None,
            head: if framed { Vec::new() } else { head },
            offset: (MAGIC.len() + 1) as u64,
            done: false,
        };
        if framed {
            this.pending = this.decode_record()?;
            if this.pending.is_none() {
                this.done = true;
            }
        }
        trace!(framed = this.framed, "frame reader initialized");
        Ok(this)
    }

    /// True if the input carried the magic marker
    pub fn framed(&self) -> bool {
        self.framed
    }

    /// Depth of the first chunk in the stream; zero for raw input
    pub fn gauge(&self) -> u32 {
        self.pending.as_ref().map(|c| c.depth()).unwrap_or(0)
    }

    fn read_tag(&mut self) -> Result<Option<u8>> {
        let mut tag = [0u8; 1];
        loop {
            return match self.reader.read(&mut tag) {
                Ok(0) => Ok(None),
                Ok(_) => {
                    self.offset += 1;
                    Ok(Some(tag[0]))
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e.into()),
            };
        }
    }

    fn decode_record(&mut self) -> Result<Option<Chunk>> {
        loop {
            let Some(tag) = self.read_tag()? else {
                return Ok(None);
            };
            match tag {
                TAG_OPEN => {
                    self.counters.push(0);
                }
                TAG_CLOSE => {
                    if self.counters.len() == 1 {
                        return Err(Error::frame(self.offset, "unmatched CLOSE record"));
                    }
                    self.counters.pop();
                    if let Some(top) = self.counters.last_mut() {
                        *top += 1;
                    }
                }
                tag if tag & !1 == TAG_CHUNK => {
                    let visible = tag & 1 != 0;
                    let payload_len = read_varint(&mut self.reader)? as usize;
                    let mut payload = vec![0u8; payload_len];
                    self.reader.read_exact(&mut payload).map_err(|_| {
                        Error::frame(self.offset, "truncated chunk payload")
                    })?;
                    let meta_len = read_varint(&mut self.reader)? as usize;
                    let mut meta_block = vec![0u8; meta_len];
                    self.reader.read_exact(&mut meta_block).map_err(|_| {
                        Error::frame(self.offset, "truncated meta block")
                    })?;
                    let mut meta = decode_meta(&meta_block, self.offset)?;
                    self.offset += (payload_len + meta_len) as u64;

                    let path = self.counters.clone();
                    if let Some(top) = self.counters.last_mut() {
                        *top += 1;
                    }
                    let depth = (path.len() - 1) as u32;
                    meta.rebind_all(depth);
                    return Ok(Some(Chunk::from_parts(payload, path, visible, meta)));
                }
                other => {
                    return Err(Error::frame(
                        self.offset,
                        format!("unknown record tag: {other:#04x}"),
                    ));
                }
            }
        }
    }

    /// Decodes the next chunk, or `None` at end of stream
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }
        if !self.framed {
            // raw input: one chunk holding all of it
            let mut data = std::mem::take(&mut self.head);
            self.reader.read_to_end(&mut data)?;
            self.done = true;
            return Ok(Some(Chunk::new(data)));
        }
        if let Some(chunk) = self.pending.take() {
            return Ok(Some(chunk));
        }
        match self.decode_record()? {
            Some(chunk) => Ok(Some(chunk)),
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

/// How serialized output leaves the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Emit the framed format
    Framed,
    /// Concatenate payloads
    Raw,
    /// Concatenate payloads separated by line breaks (framebreak)
    Lines,
}

/// Writes a stream of chunks to a byte pipe in the selected mode.
pub struct FrameWriter<W: Write> {
    writer: W,
    mode: OutputMode,
    /// Frame prefix of the previously written chunk
    open: Vec<u64>,
    started: bool,
}

impl<W: Write> FrameWriter<W> {
    /// Creates a writer; nothing is emitted until the first chunk
    pub fn new(writer: W, mode: OutputMode) -> Self {
        Self {
            writer,
            mode,
            open: Vec::new(),
            started: false,
        }
    }

    /// Serializes one chunk, inserting OPEN/CLOSE records as the frame
    /// path dictates
    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        match self.mode {
            OutputMode::Raw => {
                self.writer.write_all(chunk.data())?;
                return Ok(());
            }
            OutputMode::Lines => {
                if self.started {
                    self.writer.write_all(b"\n")?;
                }
                self.started = true;
                self.writer.write_all(chunk.data())?;
                return Ok(());
            }
            OutputMode::Framed => {}
        }

        if !self.started {
            self.writer.write_all(&MAGIC)?;
            self.writer.write_all(&[VERSION])?;
            self.started = true;
        }

        let frames = &chunk.path()[..chunk.path().len() - 1];
        let common = self
            .open
            .iter()
            .zip(frames.iter())
            .take_while(|(a, b)| a == b)
            .count();
        for _ in common..self.open.len() {
            self.writer.write_all(&[TAG_CLOSE])?;
        }
        for _ in common..frames.len() {
            self.writer.write_all(&[TAG_OPEN])?;
        }
        self.open = frames.to_vec();

        let tag = TAG_CHUNK | chunk.visible() as u8;
        let mut record = vec![tag];
        put_varint(&mut record, chunk.data().len() as u64);
        record.extend_from_slice(chunk.data());
        let meta = encode_meta(chunk.meta());
        put_varint(&mut record, meta.len() as u64);
        record.extend_from_slice(&meta);
        self.writer.write_all(&record)?;
        Ok(())
    }

    /// Closes any frames still open and flushes the underlying writer
    pub fn finish(&mut self) -> Result<()> {
        if self.mode == OutputMode::Framed {
            for _ in 0..self.open.len() {
                self.writer.write_all(&[TAG_CLOSE])?;
            }
            self.open.clear();
        }
        self.writer.flush()?;
        Ok(())
    }
}
