//! Group reader: turns ingress entries into session assignments.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{Acquire, Backend, IngressEntry};
use crate::envelope::{AssignedSession, SessionEnvelope};
use crate::identity::ConsumerId;
use crate::keys::HeartbeatKey;
use crate::ownership::{OwnedSession, OwnershipTable};

/// One blocking-read slice. Re-issued in a loop, so the group read is
/// effectively unbounded while cancellation is still observed between
/// slices.
const BLOCK_SLICE: Duration = Duration::from_secs(5);

/// Pause before retrying after a failed group read.
const READ_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Runs the read loop as this worker's group consumer until `scope` is
/// cancelled or the application drops the ingress receiver.
///
/// Entries are forwarded in backend delivery order. Before an assignment
/// is published the session's heartbeat key must be held; an entry whose
/// key is already held elsewhere (a heartbeat restart already claimed by a
/// peer) is handed back to its owner instead of being delivered twice.
pub(crate) async fn run(
    backend: Backend,
    identity: ConsumerId,
    table: Arc<OwnershipTable>,
    hb_interval: Duration,
    tx: mpsc::Sender<AssignedSession>,
    scope: CancellationToken,
) {
    loop {
        let read = tokio::select! {
            _ = scope.cancelled() => {
                debug!("group reader stopped");
                return;
            }
            read = backend.read_new_sessions(&identity, 1, BLOCK_SLICE) => read,
        };

        let entries = match read {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "group read failed, retrying");
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                }
                continue;
            }
        };

        for entry in entries {
            if !handle_entry(&backend, &identity, &table, hb_interval, &tx, entry).await {
                return;
            }
        }
    }
}

/// Processes one ingress entry. Returns `false` once the ingress channel
/// is closed and the loop should end.
async fn handle_entry(
    backend: &Backend,
    identity: &ConsumerId,
    table: &OwnershipTable,
    hb_interval: Duration,
    tx: &mpsc::Sender<AssignedSession>,
    entry: IngressEntry,
) -> bool {
    let IngressEntry { entry_id, payload } = entry;

    let Some(raw) = payload else {
        warn!(entry = %entry_id, "ingress entry is missing the envelope field, discarding");
        discard(backend, &entry_id).await;
        return true;
    };

    let envelope = match SessionEnvelope::decode(&raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(entry = %entry_id, error = %e, "malformed ingress envelope, discarding");
            discard(backend, &entry_id).await;
            return true;
        }
    };

    let key = HeartbeatKey::new(&envelope.data_stream_name, &entry_id);
    match backend
        .try_acquire(&key.to_string(), identity.as_str(), hb_interval)
        .await
    {
        Ok(Acquire::Acquired) => {}
        Ok(Acquire::AlreadyHeld) => {
            give_back(backend, &key, &entry_id).await;
            return true;
        }
        Err(e) => {
            // the SET's outcome is unknown; resolve it the same way as a
            // lost race, by asking the key who holds the session now
            warn!(
                session = %envelope.data_stream_name,
                error = %e,
                "failed to acquire session lock"
            );
            give_back(backend, &key, &entry_id).await;
            return true;
        }
    }

    table.insert(OwnedSession {
        data_stream_name: envelope.data_stream_name.clone(),
        entry_id: entry_id.clone(),
    });
    debug!(session = %envelope.data_stream_name, entry = %entry_id, "session assigned");

    if tx.send(AssignedSession { entry_id, envelope }).await.is_err() {
        debug!("ingress channel closed");
        return false;
    }
    true
}

/// Acknowledges an entry that can never become a session, keeping the
/// group's pending set bounded.
async fn discard(backend: &Backend, entry_id: &str) {
    if let Err(e) = backend.ack_entry(entry_id).await {
        warn!(entry = %entry_id, error = %e, "failed to discard entry");
    }
}

/// Hands an entry this worker read but did not lock over to whichever
/// worker holds the session key now.
async fn give_back(backend: &Backend, key: &HeartbeatKey, entry_id: &str) {
    match backend.current_owner(&key.to_string()).await {
        Ok(Some(owner)) => {
            debug!(session = %key.data_stream_name, %owner, "session already held, reassigning entry");
            if let Err(e) = backend.reassign_entry(entry_id, &owner).await {
                warn!(
                    session = %key.data_stream_name,
                    error = %e,
                    "failed to reassign entry to its owner"
                );
            }
        }
        Ok(None) => {
            // no key stands at the moment; if one is created and later
            // expires, the notification path routes the entry onward
            debug!(session = %key.data_stream_name, "session has no owner, leaving entry pending");
        }
        Err(e) => {
            warn!(
                session = %key.data_stream_name,
                error = %e,
                "failed to look up session owner"
            );
        }
    }
}
