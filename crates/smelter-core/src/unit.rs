//! The contract every transformation obeys, and the registry that maps
//! unit names to factories.
//!
//! A unit consumes one chunk at a time and emits zero or more chunks
//! through a sink, so emission stays lazy and nothing buffers a whole
//! stream. Reversible units additionally implement [`Unit::reverse`];
//! frame-aware units implement [`Unit::filter`], which the driver feeds
//! one complete frame at a time. Units never touch stdio — serialization
//! is the driver's job.

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::multibin::Multibin;
use clap::{Arg, ArgAction, ArgMatches, Command};

/// Receives the chunks a unit emits
pub type Sink<'a> = &'a mut dyn FnMut(Chunk) -> Result<()>;

/// A single transformation in a pipeline
pub trait Unit {
    /// Transforms one input chunk into zero or more output chunks
    fn process(&mut self, chunk: Chunk, sink: Sink<'_>) -> Result<()>;

    /// The inverse transformation, selected by `-R`.
    ///
    /// Only called when the unit's registry entry advertises
    /// reversibility.
    fn reverse(&mut self, chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let _ = sink;
        Err(Error::unit("reverse", "unit is not reversible").with_path(chunk.path_string()))
    }

    /// Reorders or filters one whole frame; only called for units whose
    /// registry entry is frame-aware
    fn filter(&mut self, frame: Vec<Chunk>) -> Result<Vec<Chunk>> {
        Ok(frame)
    }
}

/// Per-invocation switches reserved on every unit
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitOpts {
    /// `-R`: run the inverse direction
    pub reverse: bool,
    /// `-Q`: suppress warnings about dropped chunks
    pub quiet: bool,
    /// `-L`: degrade argument failures in chunk processing to dropped
    /// chunks instead of aborting the pipeline
    pub lenient: bool,
}

impl UnitOpts {
    /// Extracts the reserved switches from parsed arguments
    pub fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            reverse: matches.get_flag("reverse"),
            quiet: matches.get_flag("quiet"),
            lenient: matches.get_flag("lenient"),
        }
    }
}

/// Registry entry describing a unit: its flags, its command line and its
/// factory
pub struct UnitSpec {
    /// Unit name on the command line
    pub name: &'static str,
    /// One-line description
    pub about: &'static str,
    /// True if the unit implements [`Unit::reverse`]
    pub reversible: bool,
    /// True if the unit implements [`Unit::filter`]; the driver buffers
    /// one full frame before invoking it
    pub frame_aware: bool,
    /// Adds the unit's own arguments to its command
    pub configure: fn(Command) -> Command,
    /// Builds a configured unit instance from parsed arguments
    pub build: fn(&ArgMatches) -> Result<Box<dyn Unit>>,
}

impl UnitSpec {
    /// The complete clap command for this unit, reserved switches included
    pub fn command(&self) -> Command {
        let base = Command::new(self.name)
            .about(self.about)
            .no_binary_name(true)
            .arg(
                Arg::new("reverse")
                    .short('R')
                    .long("reverse")
                    .action(ArgAction::SetTrue)
                    .help("use the reverse operation"),
            )
            .arg(
                Arg::new("quiet")
                    .short('Q')
                    .long("quiet")
                    .action(ArgAction::SetTrue)
                    .help("suppress warnings about dropped chunks"),
            )
            .arg(
                Arg::new("lenient")
                    .short('L')
                    .long("lenient")
                    .action(ArgAction::SetTrue)
                    .help("drop chunks on argument failures instead of aborting"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(ArgAction::Count)
                    .help("increase log verbosity"),
            );
        (self.configure)(base)
    }

    /// Parses argv for this unit and builds the instance
    pub fn instantiate(&self, args: &[String]) -> Result<(Box<dyn Unit>, UnitOpts)> {
        let matches = self
            .command()
            .try_get_matches_from(args)
            .map_err(|e| Error::argument(e.to_string()))?;
        let opts = UnitOpts::from_matches(&matches);
        if opts.reverse && !self.reversible {
            return Err(Error::argument(format!(
                "unit {} is not reversible",
                self.name
            )));
        }
        let unit = (self.build)(&matches)?;
        Ok((unit, opts))
    }
}

/// Compiles and pre-binds an optional multibin argument
pub fn multibin_opt(matches: &ArgMatches, id: &str) -> Result<Option<Multibin>> {
    matches
        .get_one::<String>(id)
        .map(|raw| {
            let mut expr = Multibin::parse(raw)?;
            expr.bind()?;
            Ok(expr)
        })
        .transpose()
}

/// Compiles and pre-binds a required multibin argument
pub fn multibin_req(matches: &ArgMatches, id: &str) -> Result<Multibin> {
    multibin_opt(matches, id)?
        .ok_or_else(|| Error::argument(format!("missing required argument: {id}")))
}

/// Compiles and pre-binds every occurrence of a repeated multibin argument
pub fn multibin_all(matches: &ArgMatches, id: &str) -> Result<Vec<Multibin>> {
    matches
        .get_many::<String>(id)
        .into_iter()
        .flatten()
        .map(|raw| {
            let mut expr = Multibin::parse(raw)?;
            expr.bind()?;
            Ok(expr)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_spec() -> UnitSpec {
        UnitSpec {
            name: "testnop",
            about: "forward chunks unchanged",
            reversible: false,
            frame_aware: false,
            configure: |c| c,
            build: |_| {
                struct Nop;
                impl Unit for Nop {
                    fn process(&mut self, chunk: Chunk, sink: Sink<'_>) -> Result<()> {
                        sink(chunk)
                    }
                }
                Ok(Box::new(Nop))
            },
        }
    }

    #[test]
    fn test_reserved_switches() {
        let spec = nop_spec();
        let (_, opts) = spec.instantiate(&["-Q".into(), "-L".into()]).unwrap();
        assert!(opts.quiet);
        assert!(opts.lenient);
        assert!(!opts.reverse);
    }

    #[test]
    fn test_reverse_requires_reversible() {
        let spec = nop_spec();
        let err = match spec.instantiate(&["-R".into()]) {
            Err(e) => e,
            Ok(_) => panic!("expected instantiate error"),
        };
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_unknown_switch_is_argument_error() {
        let spec = nop_spec();
        let err = match spec.instantiate(&["--bogus".into()]) {
            Err(e) => e,
            Ok(_) => panic!("expected instantiate error"),
        };
        assert_eq!(err.exit_code(), 2);
    }
}
