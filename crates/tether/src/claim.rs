//! Race-safe takeover of orphaned sessions.

use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::{Acquire, Backend};
use crate::error::{Error, Result};
use crate::identity::ConsumerId;
use crate::keys::HeartbeatKey;
use crate::ownership::{OwnedSession, OwnershipTable};

/// Attempts to move the pending group entry before the claim is abandoned.
const REASSIGN_ATTEMPTS: u32 = 3;

/// Delay between reassignment attempts.
const REASSIGN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Takes over the session named by an expired heartbeat key.
///
/// The conditional SET in the first step is the sole arbiter between
/// competing successors: exactly one caller creates the key, every other
/// caller gets [`Error::AlreadyClaimed`] immediately and must not retry.
pub(crate) async fn take_over(
    backend: &Backend,
    identity: &ConsumerId,
    table: &OwnershipTable,
    hb_interval: Duration,
    expired_key: &str,
) -> Result<()> {
    let key = HeartbeatKey::parse(expired_key)?;
    let key_name = key.to_string();

    match backend
        .try_acquire(&key_name, identity.as_str(), hb_interval)
        .await?
    {
        Acquire::Acquired => {}
        Acquire::AlreadyHeld => {
            // expected contention: every subscribed worker saw the same
            // expiry and exactly one of them got here first
            debug!(session = %key.data_stream_name, "lost claim race");
            return Err(Error::AlreadyClaimed);
        }
    }

    // competing claimants may interleave between their SET attempts and
    // this point; one value-matched extension closes the TTL window the
    // race could have narrowed
    if let Err(e) = backend
        .extend_if_owner(&key_name, identity.as_str(), hb_interval)
        .await
    {
        warn!(session = %key.data_stream_name, error = %e, "post-claim extension failed");
    }

    table.insert(OwnedSession {
        data_stream_name: key.data_stream_name.clone(),
        entry_id: key.entry_id.clone(),
    });

    // move the pending entry to this consumer so acknowledgements and
    // pending-entry listings attribute it here
    let mut attempt = 0;
    let reassign_err = loop {
        attempt += 1;
        match backend
            .reassign_entry(&key.entry_id, identity.as_str())
            .await
        {
            Ok(()) => {
                debug!(session = %key.data_stream_name, "session claimed");
                return Ok(());
            }
            Err(e) if attempt < REASSIGN_ATTEMPTS => {
                warn!(
                    session = %key.data_stream_name,
                    attempt,
                    error = %e,
                    "entry reassignment failed, retrying"
                );
                tokio::time::sleep(REASSIGN_RETRY_DELAY).await;
            }
            Err(e) => break e,
        }
    };

    // the claim is incomplete: release the key and deregister so a
    // successor can win it, preserving "key exists implies ownership"
    table.remove(&key.data_stream_name);
    if let Err(e) = backend.release_if_owner(&key_name, identity.as_str()).await {
        warn!(
            session = %key.data_stream_name,
            error = %e,
            "failed to release session key after claim failure"
        );
    }

    Err(reassign_err)
}
