//! This module provides a built-in logger implementation.
//!
//! The built-in logger implementation uses the `env_logger` crate.  It is enabled by the Cargo
//! feature "builtin_env_logger" which is enabled by default.  When enabled, it will be initialized
//! during server startup and will show logs of levels INFO or lower (the lower, the more
//! important).
//!
//! Deployments that already run their own logging stack (e.g. one that writes structured JSON to
//! a sidecar collector) can disable the Cargo feature "builtin_env_logger" and install their own
//! `log::Log` implementation before starting the server.

/// Attempt to init an env_logger for the server.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                // By default, show info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );

            match result {
                Ok(()) => {
                    debug!("initialized the logger.");
                }
                Err(e) => {
                    // Currently `log::SetLoggerError` can only be raised for one reason: the logger has already been initialized.
                    debug!("failed to initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("didn't initialize the built-in env_logger.  The Cargo feature \"builtin_env_logger\" is not enabled.");
        }
    }
}
