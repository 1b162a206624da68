//! Shared timeout constants and helpers.
//!
//! Every wall-clock limit the session engine relies on lives here so the
//! engine, the handshake, and the tests agree on the same numbers.

use crate::error::{LanError, Result};
use std::future::Future;
use std::time::Duration;

/// TCP connect attempts give up after this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Waited queries and the handshake reply share this response window.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between reconnect attempts after a failed connect or a dropped socket.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Cadence of the session engine's housekeeping tick.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive idle ticks before the engine declares a heartbeat timeout.
pub const HEARTBEAT_IDLE_TICKS: u32 = 120;

/// Run a future with a time limit, mapping expiry onto [`LanError::Timeout`].
///
/// # Errors
/// Returns the future's own error if it completes with one, or
/// `LanError::Timeout` if the limit elapses first.
pub async fn with_timeout_error<F, T>(fut: F, limit: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(LanError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_limit() {
        let value = with_timeout_error(async { Ok(7u8) }, Duration::from_secs(1)).await;
        assert!(matches!(value, Ok(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_with_timeout_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        };
        let result = with_timeout_error(slow, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(LanError::Timeout)));
    }
}
