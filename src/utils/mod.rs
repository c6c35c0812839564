//! # Utility Modules
//!
//! - **Logging**: `tracing-subscriber` setup
//! - **Metrics**: atomic traffic and session counters
//! - **Timeout**: default durations and deadline wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
