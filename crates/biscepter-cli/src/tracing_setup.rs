//! Tracing subscriber wiring for the CLI.
//!
//! Priority, highest first:
//!
//! 1. `BISCEPTER_LOG` (per-target directives, e.g. `biscepter=debug`)
//! 2. `RUST_LOG`
//! 3. The `--verbose` flag: 0 → warn, 1 → info, 2 → debug, 3+ → trace;
//!    negative values disable output entirely.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Call once, before anything logs.
pub fn init(verbose: i8) {
    let filter = build_filter(verbose);
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn build_filter(verbose: i8) -> EnvFilter {
    if let Ok(directives) = std::env::var("BISCEPTER_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    flag_filter(verbose)
}

fn flag_filter(verbose: i8) -> EnvFilter {
    let directive = match verbose {
        i8::MIN..=-1 => "off",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::new(directive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_expected_levels() {
        assert_eq!(flag_filter(-1).to_string(), "off");
        assert_eq!(flag_filter(0).to_string(), "warn");
        assert_eq!(flag_filter(1).to_string(), "info");
        assert_eq!(flag_filter(2).to_string(), "debug");
        assert_eq!(flag_filter(3).to_string(), "trace");
        assert_eq!(flag_filter(9).to_string(), "trace");
    }
}
