//! Meta variable units: `put` binds variables, `cfmt` renders them.

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::meta::{is_valid_name, MetaValue, RESERVED_NAMES};
use crate::multibin::{calc, Multibin};
use crate::unit::{Sink, Unit};
use tracing::debug;

/// `put NAME [VALUE]`: bind a meta variable on every chunk.
///
/// Without a value the payload is bound. A value that is a bare
/// identifier naming a bound or reserved variable reads that variable
/// (so `put len size` captures the payload length); an integer literal
/// binds an integer; anything else is evaluated as multibin bytes.
pub struct Put {
    name: String,
    value: Option<PutValue>,
}

enum PutValue {
    Variable(String),
    Int(i64),
    Expr(Multibin),
}

impl Put {
    /// Validates the target name and compiles the value argument
    pub fn new(name: String, value: Option<String>) -> Result<Self> {
        if !is_valid_name(&name) || RESERVED_NAMES.contains(&name.as_str()) {
            return Err(Error::argument(format!(
                "cannot bind variable named {name:?}"
            )));
        }
        let value = value
            .map(|raw| -> Result<PutValue> {
                if is_valid_name(&raw) || RESERVED_NAMES.contains(&raw.as_str()) {
                    return Ok(PutValue::Variable(raw));
                }
                if let Some(i) = calc::parse_int(&raw) {
                    return Ok(PutValue::Int(i));
                }
                let mut expr = Multibin::parse(&raw)?;
                expr.bind()?;
                Ok(PutValue::Expr(expr))
            })
            .transpose()?;
        Ok(Self { name, value })
    }
}

impl Unit for Put {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let value = match &self.value {
            None => MetaValue::Bytes(chunk.data().to_vec()),
            Some(PutValue::Int(i)) => MetaValue::Int(*i),
            // an identifier that names no variable binds as literal text
            Some(PutValue::Variable(name)) => chunk
                .meta_get(name)
                .unwrap_or_else(|| MetaValue::Bytes(name.clone().into_bytes())),
            Some(PutValue::Expr(expr)) => MetaValue::Bytes(expr.eval_on(&mut chunk)?),
        };
        debug!(name = %self.name, kind = value.kind(), "binding variable");
        chunk.bind(&self.name, value)?;
        sink(chunk)
    }
}

/// `cfmt FMT`: render a format string over every chunk. `{}` inserts the
/// payload, `{name}` a meta variable, `{{`/`}}` literal braces.
pub struct Cfmt {
    segments: Vec<Segment>,
}

enum Segment {
    Literal(Vec<u8>),
    Payload,
    Variable(String),
}

impl Cfmt {
    /// Parses the format string into its segments
    pub fn new(format: &str) -> Result<Self> {
        let decoded = crate::multibin::decode_escapes(format)?;
        let text = String::from_utf8(decoded)
            .map_err(|_| Error::argument("format string is not valid utf-8"))?;
        let mut segments = Vec::new();
        let mut literal = Vec::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push(b'{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push(b'}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => {
                                return Err(Error::argument(format!(
                                    "unterminated placeholder in {format:?}"
                                )))
                            }
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    if name.is_empty() {
                        segments.push(Segment::Payload);
                    } else {
                        segments.push(Segment::Variable(name));
                    }
                }
                '}' => {
                    return Err(Error::argument(format!(
                        "unmatched closing brace in {format:?}"
                    )))
                }
                c => {
                    let mut buf = [0u8; 4];
                    literal.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }
}

impl Unit for Cfmt {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let mut out = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(bytes) => out.extend_from_slice(bytes),
                Segment::Payload => out.extend_from_slice(chunk.data()),
                Segment::Variable(name) => {
                    let value = chunk.meta_get(name).ok_or_else(|| {
                        Error::unit("cfmt", format!("variable {name} is not bound"))
                            .with_path(chunk.path_string())
                    })?;
                    out.extend(value.to_bytes());
                }
            }
        }
        chunk.set_data(out);
        sink(chunk)
    }
}
