//! Logging helpers
//!
//! Thin wrapper around `env_logger` so the binary and tests share one setup.

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over `level` when it is set.
///
/// # Parameters
///
/// * `level` - Default log level (error, warn, info, debug, trace)
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    // A second initialisation (e.g. from another test) is not an error for us
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
