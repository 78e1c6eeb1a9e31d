//! Logging initialization for the CLI.
//!
//! The library emits tracing events; the CLI installs the subscriber.
//! Verbosity flags pick the default filter, `RUST_LOG` overrides it.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Install the global subscriber. Safe to call more than once; only the
/// first call takes effect.
pub fn init(verbose: bool, quiet: bool) {
    INIT.call_once(|| {
        let default = if quiet {
            "error"
        } else if verbose {
            "debug"
        } else {
            "info"
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(default.parse().expect("static directive"))
                .from_env_lossy()
        });

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(false).without_time())
            .init();
    });
}
