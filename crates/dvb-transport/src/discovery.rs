use std::future::Future;
use std::time::Duration;

use tracing::info;

use crate::adapter::TransportError;

/// Fixed-delay retry policy for service/characteristic resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for DiscoveryRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Runs `op` until it succeeds or the policy is exhausted.
pub async fn with_discovery_retry<T, F, Fut>(
    policy: DiscoveryRetry,
    what: &str,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                info!(attempt, what, error = %err, "discovery attempt failed");
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(TransportError::Connection(format!(
        "could not resolve {what} after {attempts} attempts: {reason}"
    )))
}
