//! Heartbeat keeper: keeps the TTL keys backing owned sessions alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{Backend, Extend};
use crate::identity::ConsumerId;
use crate::keys::HeartbeatKey;
use crate::ownership::OwnershipTable;

/// Runs the keeper loop until `scope` is cancelled.
///
/// Ticks at half the heartbeat interval so at least one extension attempt
/// lands inside every TTL window under normal scheduling. On cancel the
/// keys are deliberately left to expire: that expiry is the takeover
/// signal to the surviving workers.
pub(crate) async fn run(
    backend: Backend,
    identity: ConsumerId,
    table: Arc<OwnershipTable>,
    interval: Duration,
    scope: CancellationToken,
) {
    let mut ticker = tokio::time::interval((interval / 2).max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = scope.cancelled() => {
                debug!("heartbeat keeper stopped");
                return;
            }
            _ = ticker.tick() => {
                extend_all(&backend, &identity, &table, interval).await;
            }
        }
    }
}

async fn extend_all(
    backend: &Backend,
    identity: &ConsumerId,
    table: &OwnershipTable,
    ttl: Duration,
) {
    for owned in table.snapshot() {
        let key = HeartbeatKey::new(&owned.data_stream_name, &owned.entry_id).to_string();

        match backend.extend_if_owner(&key, identity.as_str(), ttl).await {
            Ok(Extend::Extended) => {}
            Ok(Extend::NotOwner) => {
                // the key expired or was claimed by a peer; ownership is
                // gone and must not be resurrected from here
                warn!(session = %owned.data_stream_name, "lost ownership of session");
                table.remove(&owned.data_stream_name);
            }
            Err(e) => {
                // transient; the next tick retries within the TTL window
                warn!(
                    session = %owned.data_stream_name,
                    error = %e,
                    "heartbeat extension failed"
                );
            }
        }
    }
}
