//! Subscriber setup for applications embedding the crate.
//!
//! The library itself only emits `tracing` events; nothing is printed until the
//! application installs a subscriber, either its own or the one built here.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a global fmt subscriber.
///
/// `RUST_LOG` wins over `config.log_level` when set. Returns `false` when a
/// subscriber was already installed, which makes repeated calls harmless.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let installed = if config.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    installed
}
