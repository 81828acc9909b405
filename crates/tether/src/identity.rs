//! Consumer identity derived from the pod environment.

use std::env;
use std::fmt;

use crate::error::{Error, Result};

/// Prefix applied to the environment hint to form the group consumer name.
pub const CONSUMER_PREFIX: &str = "redis-consumer-";

const POD_NAME: &str = "POD_NAME";
const POD_IP: &str = "POD_IP";

/// The stable consumer name this process uses within the consumer group.
///
/// Derived once at construction from `POD_NAME` (preferred) or `POD_IP`
/// and immutable for the process lifetime. A restarted worker gets a new
/// pod name and is therefore a new identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Reads the environment hints in priority order.
    ///
    /// Returns [`Error::ConfigMissing`] when both are absent or empty.
    pub fn from_env() -> Result<Self> {
        let hint = env::var(POD_NAME)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| env::var(POD_IP).ok().filter(|v| !v.is_empty()))
            .ok_or(Error::ConfigMissing)?;

        Ok(Self(format!("{CONSUMER_PREFIX}{hint}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
