//! Naming conventions for backend state.
//!
//! Every piece of remote state the library touches is derived from two
//! inputs: the service name and the per-session heartbeat key. Keeping the
//! composition rules in one place makes the round-trip guarantees easy to
//! audit.

use std::fmt;

use crate::error::{Error, Result};

const INPUT_SUFFIX: &str = "-input";
const GROUP_SUFFIX: &str = "-group";

/// Name of the shared ingress stream for a service.
pub fn ingress_stream(service: &str) -> String {
    format!("{service}{INPUT_SUFFIX}")
}

/// Name of the consumer group all workers of a service join.
pub fn ingress_group(service: &str) -> String {
    format!("{service}{GROUP_SUFFIX}")
}

/// Pub/sub pattern matching expired-key events on the given database.
pub fn expired_event_pattern(db: i64) -> String {
    format!("__keyevent@{db}__:expired")
}

/// The TTL key asserting ownership of one session.
///
/// Named `"<data_stream_name>:<entry_id>"`; the value stored under it is
/// the owning worker's consumer id. `parse` and `Display` round-trip
/// losslessly for session names without `':'`, which the ingress contract
/// requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatKey {
    /// Name of the per-session substream.
    pub data_stream_name: String,
    /// Id of the entry backing the session in the ingress group.
    pub entry_id: String,
}

impl HeartbeatKey {
    pub fn new(data_stream_name: impl Into<String>, entry_id: impl Into<String>) -> Self {
        Self {
            data_stream_name: data_stream_name.into(),
            entry_id: entry_id.into(),
        }
    }

    /// Splits an expired key name on the first `':'`.
    ///
    /// Payloads without a separator are not heartbeat keys (the expiry
    /// channel carries every expired key on the database) and are rejected
    /// as [`Error::InvalidPayload`].
    pub fn parse(raw: &str) -> Result<Self> {
        let (name, id) = raw
            .split_once(':')
            .ok_or_else(|| Error::InvalidPayload(format!("'{raw}' is not a session key")))?;

        if name.is_empty() || id.is_empty() {
            return Err(Error::InvalidPayload(format!(
                "'{raw}' is missing a session name or entry id"
            )));
        }

        Ok(Self::new(name, id))
    }
}

impl fmt::Display for HeartbeatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.data_stream_name, self.entry_id)
    }
}
