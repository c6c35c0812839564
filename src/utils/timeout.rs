//! Async timeout helpers and default durations.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{NetError, Result};

/// Default timeout for connection attempts
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between keep-alive pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Default time allowed for a graceful shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` with a deadline; an elapsed deadline becomes [`NetError::Timeout`]
/// naming `what`.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration, what: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(NetError::Timeout(what.to_string())),
    }
}
