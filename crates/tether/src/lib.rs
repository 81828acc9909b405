//! tether: fault-tolerant, load-balanced work distribution over Redis
//! streams.
//!
//! A fleet of ephemeral workers shares one ingress stream of session
//! announcements, consumed through a single consumer group. Winning an
//! announcement transfers ownership of that session's substream to
//! exactly one worker, asserted by a TTL'd heartbeat key the owner keeps
//! refreshing. When a worker dies its keys expire, the backend broadcasts
//! the expiry to every subscribed peer, and the first peer to recreate a
//! key owns the orphaned session. The conditional SET is the only
//! arbiter, so no two workers ever own a session at once.
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use tether::Tether;
//!
//! # async fn example() -> tether::Result<()> {
//! let client = redis::Client::open("redis://127.0.0.1/")?;
//! let worker = Tether::new(client, std::time::Duration::from_secs(1), "consumer").await?;
//!
//! let scope = CancellationToken::new();
//! let (mut sessions, mut expirations) = worker.init(&scope).await?;
//!
//! tokio::select! {
//!     Some(assigned) = sessions.recv() => {
//!         // read assigned.envelope.data_stream_name until finished, then:
//!         worker.done(&assigned.envelope.data_stream_name).await?;
//!     }
//!     Some(expired_key) = expirations.recv() => {
//!         // a peer died; try to take its session over
//!         match worker.claim(&expired_key).await {
//!             Ok(()) | Err(tether::Error::AlreadyClaimed) => {}
//!             Err(e) => return Err(e),
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod envelope;
pub mod error;
pub mod expiry;
pub mod identity;
pub mod keys;
pub mod ownership;

mod claim;
mod heartbeat;
mod reader;

pub use client::Tether;
pub use envelope::{AssignedSession, SessionEnvelope, LBS_FIELD};
pub use error::{Error, Result};
pub use expiry::SubscriberConfig;
pub use identity::ConsumerId;
pub use keys::HeartbeatKey;
