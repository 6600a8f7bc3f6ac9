//! smelter - composable binary transformation pipelines
//!
//! Every invocation runs one unit (or, with quoted `|` tokens, a whole
//! pipeline) over stdin and writes the result to stdout. Units speak a
//! self-describing framed format on their pipes, so chunked streams
//! survive the shell:
//!
//! ```text
//! $ emit secret | smelter b64 -R
//! $ cat blob | smelter chop 16 [ | smelter hex -R ]
//! ```

use anyhow::{anyhow, Result};
use chrono::Local;
use smelter_core::multibin::HandlerRegistry;
use smelter_core::{pipeline, units};
use std::fmt;
use std::io::{self, IsTerminal};
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Event formatter producing the `(HH:MM:SS) message` warning style
struct ClockFormat;

impl<S, N> FormatEvent<S, N> for ClockFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        write!(writer, "({}) ", Local::now().format("%H:%M:%S"))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn init_logging(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(io::stderr)
        .event_format(ClockFormat)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {e}"))
}

fn print_overview() {
    println!("smelter - composable binary transformation pipelines");
    println!();
    println!("usage: smelter <unit> [switches] [arguments...] [brackets...]");
    println!();
    println!("units:");
    for spec in units::REGISTRY {
        let mut flags = String::new();
        if spec.reversible {
            flags.push_str(" [-R]");
        }
        println!("  {:<10}{}{}", spec.name, spec.about, flags);
    }
    println!();
    println!("multibin argument handlers (h1[args]:h2:payload):");
    for handler in HandlerRegistry::builtin().iter() {
        println!("  {:<10}{}", handler.name, handler.about);
    }
    println!();
    println!("brackets: [ opens a frame, ] closes it, [| ... |] scopes it,");
    println!("[] fuses the outputs of a unit, ]] adds line breaks on close.");
}

/// Counts `-v` occurrences without disturbing unit arguments
fn count_verbosity(args: &[String]) -> u8 {
    args.iter()
        .map(|a| match a.as_str() {
            "-v" | "--verbose" => 1,
            a if a.starts_with('-')
                && a.len() > 1
                && a.chars().skip(1).all(|c| c == 'v') =>
            {
                (a.len() - 1) as u8
            }
            _ => 0,
        })
        .sum()
}

fn wants_help(args: &[String]) -> bool {
    args.iter().any(|a| a == "--help" || a == "-h")
}

fn run(args: &[String]) -> i32 {
    if args.is_empty() || args[0] == "help" {
        print_overview();
        return 0;
    }
    if wants_help(args) {
        match units::find(&args[0]) {
            Some(spec) => {
                let mut command = spec.command();
                print!("{}", command.render_long_help());
            }
            None => print_overview(),
        }
        return 0;
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    let result = if stdin.is_terminal() {
        // no upstream data; feed the pipeline a single empty chunk
        pipeline::run(args, io::empty(), stdout.lock())
    } else {
        pipeline::run(args, stdin.lock(), stdout.lock())
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            let code = e.exit_code();
            if code != 0 {
                eprintln!("({}) {}", Local::now().format("%H:%M:%S"), e);
            }
            code
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = init_logging(count_verbosity(&args)) {
        eprintln!("{e}");
        std::process::exit(1);
    }
    std::process::exit(run(&args));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_verbosity() {
        let args = |s: &str| s.split_whitespace().map(str::to_string).collect::<Vec<_>>();
        assert_eq!(count_verbosity(&args("b64 -R")), 0);
        assert_eq!(count_verbosity(&args("b64 -v")), 1);
        assert_eq!(count_verbosity(&args("b64 -vvv")), 3);
        assert_eq!(count_verbosity(&args("b64 -v -v")), 2);
    }

    #[test]
    fn test_wants_help() {
        let args = |s: &str| s.split_whitespace().map(str::to_string).collect::<Vec<_>>();
        assert!(wants_help(&args("b64 --help")));
        assert!(!wants_help(&args("b64 -R")));
    }

    #[test]
    fn test_run_reports_argument_errors() {
        let args = vec!["definitely-not-a-unit".to_string()];
        // stdin may or may not be a terminal under the test harness; an
        // unknown unit fails during pipeline construction either way
        assert_eq!(run(&args), 2);
    }
}
