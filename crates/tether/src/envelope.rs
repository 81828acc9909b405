//! Ingress envelope wire format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The single stream-entry field carrying the serialized envelope.
pub const LBS_FIELD: &str = "lbs_input";

/// Announcement of a new session, published on the ingress stream.
///
/// `info` is opaque application metadata: the library forwards it verbatim
/// and never looks inside. Top-level fields this version does not know
/// about are captured in `extra` and survive a decode/encode round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    /// Name of the per-session substream the new owner reads from.
    pub data_stream_name: String,

    /// Application metadata, forwarded untouched.
    #[serde(default)]
    pub info: Map<String, Value>,

    /// Unknown fields, preserved for forward compatibility.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionEnvelope {
    pub fn new(data_stream_name: impl Into<String>, info: Map<String, Value>) -> Self {
        Self {
            data_stream_name: data_stream_name.into(),
            info,
            extra: Map::new(),
        }
    }

    pub(crate) fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    pub(crate) fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidPayload(e.to_string()))
    }
}

/// A session handed to this worker by the group reader.
///
/// By the time the application sees one of these, the worker already holds
/// the session's heartbeat key and the ownership table lists it.
#[derive(Debug, Clone)]
pub struct AssignedSession {
    /// Id of the ingress entry backing this assignment.
    pub entry_id: String,
    /// The decoded announcement.
    pub envelope: SessionEnvelope,
}
