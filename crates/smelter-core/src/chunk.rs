//! The unit of data in flight: a byte payload with frame coordinates,
//! visibility and attached meta variables.
//!
//! Chunks are created by the stream source, mutated only by the unit that
//! currently processes them, and handed downstream whole. Invisible chunks
//! traverse units unchanged.

use crate::error::{Error, Result};
use crate::meta::{is_valid_name, sniff_magic, MetaMap, MetaValue, RESERVED_NAMES};

/// One in-flight (payload, meta) tuple carried through the pipeline
#[derive(Debug, Clone)]
pub struct Chunk {
    data: Vec<u8>,
    /// Position within nested frames; length equals frame depth + 1
    path: Vec<u64>,
    visible: bool,
    /// Visibility this chunk assumes when the innermost frame closes; set
    /// by scoped bracket groups and the `scope`/`sep` units
    scope_fill: Option<bool>,
    meta: MetaMap,
}

impl Chunk {
    /// Creates a visible top-level chunk with no metadata
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            path: vec![0],
            visible: true,
            scope_fill: None,
            meta: MetaMap::new(),
        }
    }

    /// Creates a chunk from all of its parts; used by the frame decoder
    pub fn from_parts(data: Vec<u8>, path: Vec<u64>, visible: bool, meta: MetaMap) -> Self {
        debug_assert!(!path.is_empty());
        Self {
            data,
            path,
            visible,
            scope_fill: None,
            meta,
        }
    }

    /// The payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the payload
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Replaces the payload, keeping coordinates and metadata
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Consumes the chunk, returning the payload
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Frame depth this chunk currently lives at
    pub fn depth(&self) -> u32 {
        (self.path.len() - 1) as u32
    }

    /// Frame-path coordinates
    pub fn path(&self) -> &[u64] {
        &self.path
    }

    /// Mutable access to the frame path; owned by the driver
    pub fn path_mut(&mut self) -> &mut Vec<u64> {
        &mut self.path
    }

    /// The path joined with `/`, as surfaced in warnings and the reserved
    /// `path` variable
    pub fn path_string(&self) -> String {
        self.path
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Whether units process this chunk
    pub fn visible(&self) -> bool {
        self.visible
    }

    /// Alters visibility within the current frame
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Schedules the visibility this chunk assumes once the innermost frame
    /// closes
    pub fn set_next_scope(&mut self, visible: bool) {
        self.scope_fill = Some(visible);
    }

    /// Consumes the scheduled visibility, if any
    pub fn take_next_scope(&mut self) -> Option<bool> {
        self.scope_fill.take()
    }

    /// The variable store
    pub fn meta(&self) -> &MetaMap {
        &self.meta
    }

    /// Mutable access to the variable store
    pub fn meta_mut(&mut self) -> &mut MetaMap {
        &mut self.meta
    }

    /// Resolves a variable, including the reserved computed names `index`,
    /// `path`, `size` and `magic`
    pub fn meta_get(&self, name: &str) -> Option<MetaValue> {
        match name {
            "index" => Some(MetaValue::Int(*self.path.last().expect("path is never empty") as i64)),
            "path" => Some(MetaValue::Str(self.path_string())),
            "size" => Some(MetaValue::Int(self.data.len() as i64)),
            "magic" => Some(MetaValue::Str(sniff_magic(&self.data).to_string())),
            _ => self.meta.get(name).cloned(),
        }
    }

    /// Binds a variable at this chunk's current depth.
    ///
    /// Rejects malformed names and the reserved computed names.
    pub fn bind(&mut self, name: &str, value: MetaValue) -> Result<()> {
        if !is_valid_name(name) {
            return Err(Error::argument(format!("invalid variable name: {name:?}")));
        }
        if RESERVED_NAMES.contains(&name) {
            return Err(Error::argument(format!(
                "variable name {name:?} is reserved"
            )));
        }
        let depth = self.depth();
        self.meta.bind(name, value, depth);
        Ok(())
    }

    /// Derives a child chunk with new payload bytes.
    ///
    /// The child shares this chunk's meta snapshot (copy-on-write), path
    /// and visibility.
    pub fn derive(&self, data: impl Into<Vec<u8>>) -> Chunk {
        Chunk {
            data: data.into(),
            path: self.path.clone(),
            visible: self.visible,
            scope_fill: self.scope_fill,
            meta: self.meta.clone(),
        }
    }

    /// Takes over coordinates and visibility from a parent chunk and fills
    /// in meta entries the child does not bind itself
    pub fn inherit(&mut self, parent: &Chunk) {
        self.path = parent.path.clone();
        self.visible = parent.visible;
        self.scope_fill = parent.scope_fill;
        self.meta.fill_from(&parent.meta);
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
            && self.path == other.path
            && self.visible == other.visible
            && self.meta.iter_sorted() == other.meta.iter_sorted()
    }
}

impl Eq for Chunk {}
