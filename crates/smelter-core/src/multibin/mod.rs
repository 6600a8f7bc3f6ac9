//! The multibin argument language.
//!
//! Unit arguments are chains of the form `h1[a,b]:h2:payload`, evaluated
//! right to left: the rightmost literal is consumed by the handler to its
//! left, whose output feeds the next handler, and so on. The rightmost
//! atom may instead be a handler that synthesizes bytes without a payload
//! (`accu`, `eat`).
//!
//! Expressions compile once into a small IR. Expressions that consult the
//! chunk under evaluation (`var`, `cut`, `copy`, `eat`) are *volatile* and
//! re-evaluated per chunk; all others fold to a constant when the unit
//! binds its arguments.

pub(crate) mod calc;
pub mod handlers;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
pub use handlers::{Handler, HandlerRegistry};

/// Evaluation context handed to every handler
pub struct EvalCtx<'a> {
    /// The chunk under evaluation; mutating handlers like `cut` edit it
    pub chunk: &'a mut Chunk,
    /// The handler registry in effect
    pub registry: &'a HandlerRegistry,
}

impl<'a> EvalCtx<'a> {
    /// Creates a context over a chunk with the built-in registry
    pub fn new(chunk: &'a mut Chunk) -> Self {
        Self {
            chunk,
            registry: HandlerRegistry::builtin(),
        }
    }
}

#[derive(Debug, Clone)]
struct Step {
    name: String,
    args: Vec<String>,
}

#[derive(Debug, Clone)]
enum Terminal {
    /// Literal payload bytes, escape sequences already decoded
    Literal(Vec<u8>),
    /// A handler that synthesizes bytes without a payload
    Synth(Step),
}

/// A compiled multibin expression
#[derive(Debug, Clone)]
pub struct Multibin {
    steps: Vec<Step>,
    terminal: Terminal,
    volatile: bool,
    source: String,
    cached: Option<Vec<u8>>,
}

impl Multibin {
    /// Compiles an argument string against the built-in registry
    pub fn parse(source: &str) -> Result<Self> {
        Self::parse_with(source, HandlerRegistry::builtin())
    }

    /// Compiles an argument string against the given registry
    pub fn parse_with(source: &str, registry: &HandlerRegistry) -> Result<Self> {
        let mut steps = Vec::new();
        let mut pos = 0;

        loop {
            let rest = &source[pos..];
            let colon = find_toplevel_colon(rest);
            let segment = &rest[..colon.unwrap_or(rest.len())];

            let Some((name, args)) = split_invocation(segment) else {
                // not handler-shaped: everything from here is the literal
                return Self::with_literal(steps, source, pos, registry);
            };
            let known = registry.get(name).is_some();
            let bracketed = segment.len() > name.len();

            match colon {
                Some(colon) => {
                    if known {
                        steps.push(Step {
                            name: name.to_string(),
                            args: args?,
                        });
                        pos += colon + 1;
                    } else if bracketed {
                        return Err(Error::argument(format!("unknown handler: {name}")));
                    } else {
                        // bare unknown identifier: the remainder is a literal
                        return Self::with_literal(steps, source, pos, registry);
                    }
                }
                None => {
                    // final segment
                    if bracketed && known {
                        let handler = registry.get(name).expect("checked above");
                        if !handler.nullary {
                            return Err(Error::argument(format!(
                                "handler {name} requires a payload"
                            )));
                        }
                        return Ok(Self::finish(
                            steps,
                            Terminal::Synth(Step {
                                name: name.to_string(),
                                args: args?,
                            }),
                            source,
                            registry,
                        ));
                    }
                    // bare trailing identifier is always a literal
                    return Self::with_literal(steps, source, pos, registry);
                }
            }
        }
    }

    fn with_literal(
        steps: Vec<Step>,
        source: &str,
        pos: usize,
        registry: &HandlerRegistry,
    ) -> Result<Self> {
        let literal = decode_escapes(&source[pos..])?;
        Ok(Self::finish(steps, Terminal::Literal(literal), source, registry))
    }

    fn finish(
        steps: Vec<Step>,
        terminal: Terminal,
        source: &str,
        registry: &HandlerRegistry,
    ) -> Self {
        let volatile = steps
            .iter()
            .chain(match &terminal {
                Terminal::Synth(step) => Some(step),
                Terminal::Literal(_) => None,
            })
            .any(|step| {
                registry
                    .get(&step.name)
                    .map(|h| h.volatile)
                    .unwrap_or(false)
            });
        Self {
            steps,
            terminal,
            volatile,
            source: source.to_string(),
            cached: None,
        }
    }

    /// The original argument text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True if evaluation depends on the chunk and must repeat per chunk
    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    /// Pre-evaluates a constant expression so later calls are free.
    ///
    /// Volatile expressions are left alone. Called once when a unit binds
    /// its arguments; failures here are argument errors.
    pub fn bind(&mut self) -> Result<()> {
        if !self.volatile && self.cached.is_none() {
            let mut scratch = Chunk::new(Vec::new());
            let mut ctx = EvalCtx::new(&mut scratch);
            self.cached = Some(self.run(&mut ctx)?);
        }
        Ok(())
    }

    /// Evaluates the expression against a chunk
    pub fn eval(&self, ctx: &mut EvalCtx<'_>) -> Result<Vec<u8>> {
        if let Some(cached) = &self.cached {
            return Ok(cached.clone());
        }
        self.run(ctx)
    }

    /// Convenience wrapper building the context in place
    pub fn eval_on(&self, chunk: &mut Chunk) -> Result<Vec<u8>> {
        self.eval(&mut EvalCtx::new(chunk))
    }

    /// Evaluates and interprets the result as an integer
    pub fn eval_int(&self, ctx: &mut EvalCtx<'_>) -> Result<i64> {
        let raw = self.eval(ctx)?;
        let text = std::str::from_utf8(&raw)
            .map_err(|_| Error::argument(format!("{}: not an integer", self.source)))?;
        calc::parse_int(text.trim())
            .ok_or_else(|| Error::argument(format!("{}: not an integer", self.source)))
    }

    fn run(&self, ctx: &mut EvalCtx<'_>) -> Result<Vec<u8>> {
        let mut value = match &self.terminal {
            Terminal::Literal(bytes) => bytes.clone(),
            Terminal::Synth(step) => apply(step, ctx, Vec::new())?,
        };
        for step in self.steps.iter().rev() {
            value = apply(step, ctx, value)?;
        }
        Ok(value)
    }
}

fn apply(step: &Step, ctx: &mut EvalCtx<'_>, input: Vec<u8>) -> Result<Vec<u8>> {
    let handler = ctx
        .registry
        .get(&step.name)
        .ok_or_else(|| Error::argument(format!("unknown handler: {}", step.name)))?;
    handler.run(ctx, &step.args, input)
}

/// Finds the first `:` outside square brackets
fn find_toplevel_colon(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

/// Splits `name` or `name[a,b]` into the handler name and its arguments.
/// Returns `None` when the segment is not shaped like an invocation.
fn split_invocation(segment: &str) -> Option<(&str, Result<Vec<String>>)> {
    let name_end = segment
        .char_indices()
        .find(|(i, c)| {
            !(c.is_ascii_alphanumeric() || *c == '_') || (*i == 0 && c.is_ascii_digit())
        })
        .map(|(i, _)| i)
        .unwrap_or(segment.len());
    if name_end == 0 {
        return None;
    }
    let name = &segment[..name_end];
    let rest = &segment[name_end..];
    if rest.is_empty() {
        return Some((name, Ok(Vec::new())));
    }
    if !rest.starts_with('[') || !rest.ends_with(']') {
        return None;
    }
    Some((name, split_args(&rest[1..rest.len() - 1])))
}

/// Splits a bracketed argument list on top-level commas
fn split_args(args: &str) -> Result<Vec<String>> {
    if args.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in args.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                if depth == 0 {
                    return Err(Error::argument(format!("unbalanced brackets in [{args}]")));
                }
                depth -= 1;
            }
            ',' if depth == 0 => {
                out.push(args[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::argument(format!("unbalanced brackets in [{args}]")));
    }
    out.push(args[start..].to_string());
    Ok(out)
}

/// Decodes backslash escape sequences in a literal.
///
/// Supports `\n \r \t \0 \\ \" \xHH`; an unrecognized escape is kept
/// verbatim, backslash included.
pub fn decode_escapes(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('r') => out.push(b'\r'),
            Some('t') => out.push(b'\t'),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some('x') => {
                let hi = chars.next();
                let lo = chars.next();
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    return Err(Error::argument(format!("truncated \\x escape in {text:?}")));
                };
                let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16).map_err(|_| {
                    Error::argument(format!("invalid \\x escape in {text:?}"))
                })?;
                out.push(byte);
            }
            Some(other) => {
                out.push(b'\\');
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => out.push(b'\\'),
        }
    }
    Ok(out)
}

/// Parses a python-style slice `S:E` (either bound optional, negative
/// values count from the end) against a length, returning the clamped
/// byte range.
pub fn parse_slice(spec: &str, len: usize) -> Result<std::ops::Range<usize>> {
    let resolve = |bound: &str, default: i64| -> Result<i64> {
        let bound = bound.trim();
        if bound.is_empty() {
            return Ok(default);
        }
        calc::parse_int(bound)
            .ok_or_else(|| Error::argument(format!("invalid slice bound: {bound:?}")))
    };
    let clamp = |v: i64| -> usize {
        let v = if v < 0 { v + len as i64 } else { v };
        v.clamp(0, len as i64) as usize
    };

    let (start, end) = match spec.split_once(':') {
        Some((s, e)) => (resolve(s, 0)?, resolve(e, len as i64)?),
        None => {
            // a single index selects one byte
            let s = resolve(spec, 0)?;
            let start = clamp(s);
            return Ok(start..(start + 1).min(len));
        }
    };
    let start = clamp(start);
    let end = clamp(end).max(start);
    Ok(start..end)
}
