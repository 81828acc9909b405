//! Expired-key notification setup and forwarding.

use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::PubSub;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{Error, Result};

/// Tuning for the pattern-subscription forwarder.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Upper bound on how long the forwarder sleeps in the backend read
    /// before re-checking its own liveness and cancellation state.
    pub health_check_interval: Duration,
    /// How long one send into the notification channel may wait on a slow
    /// application before the stall is logged. Delivery then keeps
    /// waiting; the library never drops a notification itself.
    pub send_timeout: Duration,
    /// Logical database index used in the expiry channel pattern.
    pub db: i64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(1),
            send_timeout: Duration::from_secs(600),
            db: 0,
        }
    }
}

/// Performs the two-step notification setup, in order, each step required:
/// enable expired-key events server-side, then pattern-subscribe to them.
///
/// Either failure aborts library initialization.
pub(crate) async fn subscribe(backend: &Backend, config: &SubscriberConfig) -> Result<PubSub> {
    backend
        .enable_expired_events()
        .await
        .map_err(|e| Error::InitFailed(format!("enabling expired-key events: {e}")))?;

    backend
        .subscribe_expired(config.db)
        .await
        .map_err(|e| Error::InitFailed(format!("subscribing to expired-key events: {e}")))
}

/// Forwards expired-key names into the notification channel until the
/// subscription ends or `scope` is cancelled.
pub(crate) async fn forward(
    pubsub: PubSub,
    tx: mpsc::Sender<String>,
    config: SubscriberConfig,
    scope: CancellationToken,
) {
    let mut messages = pubsub.into_on_message();

    loop {
        let next = tokio::time::timeout(config.health_check_interval, messages.next());
        let msg = tokio::select! {
            _ = scope.cancelled() => {
                debug!("expiry forwarder stopped");
                return;
            }
            res = next => match res {
                Err(_idle) => continue,
                Ok(None) => {
                    warn!("expired-event subscription closed");
                    return;
                }
                Ok(Some(msg)) => msg,
            },
        };

        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "undecodable expiry notification");
                continue;
            }
        };

        let permit = tokio::select! {
            _ = scope.cancelled() => {
                debug!("expiry forwarder stopped");
                return;
            }
            permit = reserve_slot(&tx, config.send_timeout) => match permit {
                Some(permit) => permit,
                None => {
                    // receiver dropped; shutdown is under way
                    debug!("notification channel closed");
                    return;
                }
            },
        };
        permit.send(payload);
    }
}

/// Waits for capacity in the notification channel, logging once when the
/// wait exceeds `stall_after`. Backpressure only: the notification is
/// handed over as soon as the application catches up. Returns `None` when
/// the channel is closed.
async fn reserve_slot(
    tx: &mpsc::Sender<String>,
    stall_after: Duration,
) -> Option<mpsc::Permit<'_, String>> {
    match tokio::time::timeout(stall_after, tx.reserve()).await {
        Ok(Ok(permit)) => Some(permit),
        Ok(Err(_)) => None,
        Err(_) => {
            warn!("notification delivery stalled, waiting for a slow receiver");
            tx.reserve().await.ok()
        }
    }
}
