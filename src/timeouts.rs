//! Deadline handling for blocking remote calls
//!
//! Every remote operation runs under a deadline. Proxied paths and
//! anonymity-network hosts have materially higher and more variable latency,
//! so they get a longer default; an operator-set override takes precedence
//! over either computed value.
//!
//! Expiry cancels the in-flight operation at its next await point. That
//! cancellation is best-effort; the connection controller's reset is what
//! actually reclaims the connection afterwards.

use std::future::Future;
use std::time::Duration;

use crate::config::ServerEndpoint;
use crate::error::SyncError;

/// Deadline for direct connections
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(12);

/// Deadline when the path goes through a proxy or an onion host
pub const PROXY_DEADLINE: Duration = Duration::from_secs(30);

/// Select the deadline for the configured endpoint.
pub fn deadline_for(
    endpoint: Option<&ServerEndpoint>,
    use_proxy: bool,
    override_deadline: Option<Duration>,
) -> Duration {
    if let Some(deadline) = override_deadline {
        if !deadline.is_zero() {
            return deadline;
        }
    }

    let onion = endpoint.map(ServerEndpoint::is_onion).unwrap_or(false);
    if use_proxy || onion {
        PROXY_DEADLINE
    } else {
        DEFAULT_DEADLINE
    }
}

/// Run `operation` under `deadline`, mapping expiry to [`SyncError::Timeout`].
pub async fn run_with_deadline<T, F>(deadline: Duration, operation: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout),
    }
}
