//! Error types for the tether client.

use thiserror::Error;

/// Errors returned by the tether client.
///
/// The contention outcomes (`AlreadyClaimed`, `NotOwned`) are expected
/// under normal operation and carry their own variants so callers can
/// branch on them without string matching.
#[derive(Debug, Error)]
pub enum Error {
    /// Neither `POD_NAME` nor `POD_IP` is set in the environment.
    #[error("consumer identity missing: set POD_NAME or POD_IP")]
    ConfigMissing,

    /// The backend connection failed or a command could not complete.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] redis::RedisError),

    /// Another worker won the claim race for this session.
    #[error("session already claimed by another worker")]
    AlreadyClaimed,

    /// The session is not in this worker's ownership table.
    #[error("session '{0}' is not owned by this worker")]
    NotOwned(String),

    /// A stream entry or expiry notification could not be decoded.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Library initialization failed; no background tasks are running.
    #[error("initialization failed: {0}")]
    InitFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
