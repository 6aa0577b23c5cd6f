//! Logging setup.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "relcache=info";

/// Install the stderr subscriber. `RUST_LOG` overrides the default filter;
/// `verbose` raises the crate to `debug` when `RUST_LOG` is unset.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "relcache=debug" } else { DEFAULT_FILTER };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_thread_ids(true)
        .with_target(false)
        .try_init();
}
