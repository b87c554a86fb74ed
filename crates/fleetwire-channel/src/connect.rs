use std::time::Duration;

use fleetwire_transport::{Endpoint, IpcStream, KeepaliveOptions, TransportError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ChannelError, Result};

/// Floor for the reconnect delay so a zero backoff cannot spin.
const MIN_BACKOFF: Duration = Duration::from_millis(10);

/// Connect to `endpoint`, retrying peers that are not listening yet with a
/// fixed `backoff` between attempts.
///
/// Gives up with [`ChannelError::Connect`] once `deadline` passes (never
/// when `None`), and with [`ChannelError::Closed`] when `cancel` fires.
/// Errors that retrying cannot fix are returned immediately.
pub(crate) async fn connect_with_backoff(
    endpoint: &Endpoint,
    keepalive: &KeepaliveOptions,
    backoff: Duration,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<IpcStream> {
    let backoff = backoff.max(MIN_BACKOFF);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let connect = fleetwire_transport::connect(endpoint, keepalive);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(ChannelError::Closed),
            outcome = until(deadline, connect) => outcome,
        };

        let err = match outcome {
            Some(Ok(stream)) => {
                debug!(%endpoint, attempt, "connected");
                return Ok(stream);
            }
            Some(Err(err)) => err,
            None => timed_out(endpoint),
        };

        if !err.is_retryable() {
            return Err(connect_error(endpoint, err));
        }

        let delay = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(connect_error(endpoint, err));
                }
                backoff.min(deadline - now)
            }
            None => backoff,
        };

        if attempt == 1 {
            warn!(%endpoint, %err, "connect failed; will reconnect in {:?}", delay);
        } else {
            debug!(%endpoint, %err, attempt, "connect failed; will reconnect in {:?}", delay);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ChannelError::Closed),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn until<F: std::future::Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn timed_out(endpoint: &Endpoint) -> TransportError {
    TransportError::Connect {
        endpoint: endpoint.clone(),
        source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect deadline elapsed"),
    }
}

fn connect_error(endpoint: &Endpoint, source: TransportError) -> ChannelError {
    ChannelError::Connect {
        endpoint: endpoint.clone(),
        source,
    }
}
