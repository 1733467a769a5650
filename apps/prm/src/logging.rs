//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging
///
/// `RUST_LOG` always wins over the built-in filters. Logs go to stderr so
/// they never mix with rendered output.
pub fn init_tracing(json_mode: bool, debug_enabled: bool) {
    let default_filter = if debug_enabled {
        "info,prm=debug,prm_resources=debug"
    } else {
        "warn,prm=info,prm_resources=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if json_mode {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_thread_names(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_thread_names(debug_enabled)
            .init();
    }
}
