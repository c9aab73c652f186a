//! Tracing subscriber setup for the `plankton` binary

use std::io::{self, IsTerminal};

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Filter directives for a verbosity level; `RUST_LOG` takes precedence
pub fn filter_directives(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "plankton=info,warn",
        1 => "plankton=debug,info",
        2 => "plankton=trace,debug",
        _ => "trace",
    }
}

/// Install the global subscriber
///
/// JSON lines when `json_output` is set, ANSI output on a terminal and plain
/// output otherwise.
pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool) -> Result<()> {
    let directives = filter_directives(verbosity, quiet);
    let env_filter = if quiet {
        EnvFilter::new(directives)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
    };

    if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).try_init()?;
    } else if io::stdout().is_terminal() && !quiet {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_ansi(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, false, "plankton=info,warn")]
    #[test_case(1, false, "plankton=debug,info")]
    #[test_case(2, false, "plankton=trace,debug")]
    #[test_case(7, false, "trace")]
    #[test_case(3, true, "error")]
    fn test_filter_directives(verbosity: u8, quiet: bool, expected: &str) {
        assert_eq!(filter_directives(verbosity, quiet), expected);
    }

    #[test]
    fn test_directives_parse() {
        for verbosity in 0..4 {
            assert!(EnvFilter::try_new(filter_directives(verbosity, false)).is_ok());
        }
    }
}
