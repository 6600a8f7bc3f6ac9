//! # smelter-core
//!
//! The runtime behind the smelter toolkit: composable units that
//! transform binary data, chained through pipes that speak a
//! self-describing framed format.
//!
//! ## Architecture
//!
//! - [`chunk`]: the unit of data in flight, a payload with frame
//!   coordinates, visibility and meta variables
//! - [`meta`]: the copy-on-write variable store and its value kinds
//! - [`frame`]: the framed pipe format that lets chunked streams survive
//!   a process boundary
//! - [`multibin`]: the argument expression language and its handler
//!   registry
//! - [`unit`]: the contract every transformation obeys
//! - [`units`]: the built-in unit registry
//! - [`pipeline`]: bracket parsing and the streaming execution engine
//! - [`error`]: error types and the fatal/recoverable split
//!
//! ## Example
//!
//! ```
//! use smelter_core::pipeline;
//!
//! let argv: Vec<String> = ["emit", "q[hex]:414243", "|", "b64", "-R"]
//!     .iter()
//!     .map(|s| s.to_string())
//!     .collect();
//! let mut out = Vec::new();
//! pipeline::run(&argv, &b""[..], &mut out)?;
//! assert_eq!(out, b"QUJD");
//! # Ok::<(), smelter_core::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod chunk;
pub mod error;
pub mod frame;
pub mod meta;
pub mod multibin;
pub mod pipeline;
pub mod unit;
pub mod units;

// Re-export primary types for convenience
pub use chunk::Chunk;
pub use error::{Error, Result};
pub use frame::{FrameReader, FrameWriter, OutputMode};
pub use meta::{MetaMap, MetaValue};
pub use multibin::{EvalCtx, Multibin};
pub use unit::{Unit, UnitOpts, UnitSpec};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
