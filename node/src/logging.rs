//! Tracing setup.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber from the `-v` verbosity count.
///
/// `RUST_LOG` takes precedence when set.
pub fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let (global, local) = match verbosity {
            0 => ("warn", "info"),
            1 => ("warn", "debug"),
            2 => ("info", "trace"),
            _ => ("debug", "trace"),
        };
        EnvFilter::new(format!("{global},blocksync_node={local}"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
