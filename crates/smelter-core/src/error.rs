//! Error types for the smelter-core library.
//!
//! Failures fall into four classes with different propagation policies:
//! argument errors abort before any data is processed (exit 2), frame
//! errors mean the input stream itself is corrupt (exit 1), unit errors
//! affect a single chunk and are recoverable, and I/O errors terminate the
//! pipeline cleanly when a peer closes its end of a pipe.

use thiserror::Error;

/// Result type alias for smelter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type covering every failure class of the pipeline runtime
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Multibin parse failure, unknown handler or bad switch
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Corrupt framed stream
    #[error("corrupt frame at offset {offset}: {details}")]
    Frame {
        /// Byte offset in the framed stream where decoding failed
        offset: u64,
        /// Detailed description of the issue
        details: String,
    },

    /// Per-chunk processing failure; recoverable, the chunk is dropped
    #[error("failure in {unit}: {details}")]
    Unit {
        /// Name of the unit that failed
        unit: String,
        /// Frame path of the offending chunk, if known
        path: Option<String>,
        /// What went wrong
        details: String,
    },

    /// Stdio failure, including a peer closing its end of the pipe
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a new argument error
    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    /// Creates a new frame error at the given stream offset
    pub fn frame(offset: u64, details: impl Into<String>) -> Self {
        Self::Frame {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new per-chunk unit error
    pub fn unit(unit: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Unit {
            unit: unit.into(),
            path: None,
            details: details.into(),
        }
    }

    /// Attaches the frame path of the offending chunk to a unit error
    pub fn with_path(self, path: impl Into<String>) -> Self {
        match self {
            Self::Unit { unit, details, .. } => Self::Unit {
                unit,
                path: Some(path.into()),
                details,
            },
            other => other,
        }
    }

    /// Returns true if this error must unwind the entire pipeline.
    ///
    /// Unit errors affect a single chunk: the driver logs them, drops the
    /// chunk and continues. A broken pipe on stdout is also non-fatal in
    /// the sense that it triggers a clean shutdown rather than an abort.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Unit { .. } => false,
            Self::Io(e) => e.kind() != std::io::ErrorKind::BrokenPipe,
            _ => true,
        }
    }

    /// Process exit code mandated for this error class
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Argument(_) => 2,
            Self::Frame { .. } | Self::Unit { .. } => 1,
            Self::Io(e) => {
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    0
                } else {
                    1
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::unit("aes", "invalid key length").with_path("0/3");
        assert!(err.to_string().contains("failure in aes"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_fatality() {
        assert!(!Error::unit("zl", "bad stream").is_fatal());
        assert!(Error::argument("no such handler").is_fatal());
        assert!(Error::frame(12, "bad tag").is_fatal());
        let gone = Error::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!gone.is_fatal());
        assert_eq!(gone.exit_code(), 0);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::argument("bad switch").exit_code(), 2);
        assert_eq!(Error::frame(0, "truncated varint").exit_code(), 1);
    }
}
