//! Tracing setup shared by the CodeBlue binaries.
//!
//! Protocol output goes to stdout, so every log line is written to stderr.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directive used when `RUST_LOG` is unset and the caller asked for detail
const VERBOSE_DIRECTIVE: &str = "warn,codeblue_core=debug,codeblue=debug";

/// Initialize logging; `RUST_LOG` always wins over `verbose`
pub fn init(verbose: bool) {
    let directive = if verbose { VERBOSE_DIRECTIVE } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(verbose)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Capture logs in test output
#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("debug"))
        .try_init();
}
