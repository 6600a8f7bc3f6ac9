//! Frame-aware units: these see one whole frame before emitting, so the
//! driver buffers the innermost frame for them. Invisible chunks keep
//! their positions and are never reordered or dropped.

use crate::chunk::Chunk;
use crate::error::Result;
use crate::unit::{Sink, Unit};

/// `sorted`: sort the visible chunks of every frame by payload
pub struct Sorted;

impl Unit for Sorted {
    fn process(&mut self, chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        sink(chunk)
    }

    fn filter(&mut self, mut frame: Vec<Chunk>) -> Result<Vec<Chunk>> {
        let slots: Vec<usize> = (0..frame.len()).filter(|&i| frame[i].visible()).collect();
        let mut visible: Vec<Chunk> = Vec::with_capacity(slots.len());
        for &i in slots.iter().rev() {
            visible.push(frame.remove(i));
        }
        visible.sort_by(|a, b| a.data().cmp(b.data()));
        for (&slot, chunk) in slots.iter().zip(visible) {
            frame.insert(slot, chunk);
        }
        Ok(frame)
    }
}

/// `dedup`: drop visible chunks whose payload was already seen in the
/// current frame
pub struct Dedup;

impl Unit for Dedup {
    fn process(&mut self, chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        sink(chunk)
    }

    fn filter(&mut self, frame: Vec<Chunk>) -> Result<Vec<Chunk>> {
        let mut seen = std::collections::HashSet::new();
        Ok(frame
            .into_iter()
            .filter(|chunk| !chunk.visible() || seen.insert(*blake3::hash(chunk.data()).as_bytes()))
            .collect())
    }
}
