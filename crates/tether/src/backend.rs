//! Thin semantic wrapper over the backend's stream, consumer-group, key
//! and pub/sub primitives.
//!
//! Each method maps to one server round trip. The conditional key
//! operations return typed outcomes (`Acquire`, `Extend`, `Release`)
//! instead of folding "already held" or "not the owner" into a generic
//! error: those are ordinary results of the ownership protocol, not
//! failures. Connectivity faults bubble up unchanged as
//! [`Error::BackendUnavailable`].

use std::sync::Arc;
use std::time::Duration;

use redis::aio::{ConnectionManager, PubSub};
use redis::streams::StreamReadReply;
use redis::{Client, Script};

use crate::envelope::LBS_FIELD;
use crate::error::Result;
use crate::identity::ConsumerId;
use crate::keys;

/// Keyspace-notification flag set enabling keyevent messages for expired
/// keys (`E` = keyevent class, `x` = expired events).
const EXPIRED_EVENT_FLAGS: &str = "Ex";

/// Extend the key's TTL iff the stored owner matches. Atomic server-side.
const EXTEND_IF_OWNER: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return -1
";

/// Delete the key iff the stored owner matches. Atomic server-side.
const RELEASE_IF_OWNER: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return -1
";

/// Outcome of a conditional set-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The key was created; this worker is the owner.
    Acquired,
    /// The key already exists under some owner.
    AlreadyHeld,
}

/// Outcome of a value-matched TTL extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extend {
    Extended,
    /// The key is missing or carries another worker's id.
    NotOwner,
}

/// Outcome of a value-matched delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Released,
    /// The key is missing or carries another worker's id.
    NotOwner,
}

/// One un-acknowledged entry read from the ingress stream.
#[derive(Debug, Clone)]
pub struct IngressEntry {
    /// Server-assigned monotonic id.
    pub entry_id: String,
    /// Raw value of the envelope field; `None` when the field is absent.
    pub payload: Option<String>,
}

/// Adapter over the Redis commands the library needs.
///
/// Cheap to clone: the command path shares one auto-reconnecting
/// multiplexed connection, and pub/sub connections are opened on demand
/// from the retained client handle.
#[derive(Clone)]
pub struct Backend {
    conn: ConnectionManager,
    /// Dedicated connection for blocking group reads. A blocking XREADGROUP
    /// parks its connection server-side, which would stall every heartbeat
    /// extension and claim multiplexed behind it on `conn`.
    read_conn: ConnectionManager,
    client: Client,
    stream: String,
    group: String,
    extend: Arc<Script>,
    release: Arc<Script>,
}

impl Backend {
    /// Establishes the command and group-read connections for `service`.
    pub async fn connect(client: Client, service: &str) -> Result<Self> {
        let conn = client.get_connection_manager().await?;
        let read_conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            read_conn,
            client,
            stream: keys::ingress_stream(service),
            group: keys::ingress_group(service),
            extend: Arc::new(Script::new(EXTEND_IF_OWNER)),
            release: Arc::new(Script::new(RELEASE_IF_OWNER)),
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    pub fn group_name(&self) -> &str {
        &self.group
    }

    /// Appends one envelope to the ingress stream and returns its entry id.
    pub async fn append_session(&self, payload: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg(LBS_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(entry_id)
    }

    /// Creates the consumer group at the stream tail, creating the stream
    /// itself when absent.
    ///
    /// Only entries appended after this call are delivered to the group;
    /// pre-existing entries are not back-consumed. A group left behind by
    /// an earlier worker generation is reused as-is.
    pub async fn create_group_at_tail(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocking group read of entries never delivered to any consumer.
    ///
    /// Returns the empty vector when `block` elapses without traffic.
    pub async fn read_new_sessions(
        &self,
        consumer: &ConsumerId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<IngressEntry>> {
        let mut conn = self.read_conn.clone();
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer.as_str())
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let payload: Option<String> = id.get(LBS_FIELD);
                entries.push(IngressEntry {
                    entry_id: id.id,
                    payload,
                });
            }
        }
        Ok(entries)
    }

    /// Acknowledges one ingress entry on behalf of this worker's group.
    pub async fn ack_entry(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _acked: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Transfers a pending entry to `consumer` without redelivery.
    ///
    /// min-idle is zero: administrative reassignment must work no matter
    /// how recently the previous consumer touched the entry.
    pub async fn reassign_entry(&self, entry_id: &str, consumer: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(consumer)
            .arg(0)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Turns on keyevent notifications for expired keys.
    pub async fn enable_expired_events(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(EXPIRED_EVENT_FLAGS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Opens a dedicated pub/sub connection pattern-subscribed to the
    /// expired-key channel of database `db`.
    pub async fn subscribe_expired(&self, db: i64) -> Result<PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(keys::expired_event_pattern(db)).await?;
        Ok(pubsub)
    }

    /// Creates `key` with value `owner` and the given TTL iff it does not
    /// exist. The backend's native conditional SET makes this the single
    /// serialization point between competing workers.
    pub async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<Acquire> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(if set.is_some() {
            Acquire::Acquired
        } else {
            Acquire::AlreadyHeld
        })
    }

    /// Refreshes the TTL on `key` iff its value equals `owner`.
    pub async fn extend_if_owner(&self, key: &str, owner: &str, ttl: Duration) -> Result<Extend> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .extend
            .key(key)
            .arg(owner)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        Ok(match outcome {
            1 => Extend::Extended,
            _ => Extend::NotOwner,
        })
    }

    /// Deletes `key` iff its value equals `owner`.
    pub async fn release_if_owner(&self, key: &str, owner: &str) -> Result<Release> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .release
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;

        Ok(match outcome {
            1 => Release::Released,
            _ => Release::NotOwner,
        })
    }

    /// Reads the consumer id recorded on a heartbeat key, if it still
    /// exists.
    pub async fn current_owner(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(owner)
    }
}
