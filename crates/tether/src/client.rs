//! Client façade: lifecycle, output channels, and the operation surface.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{Backend, Release};
use crate::claim;
use crate::envelope::{AssignedSession, SessionEnvelope};
use crate::error::{Error, Result};
use crate::expiry::{self, SubscriberConfig};
use crate::heartbeat;
use crate::identity::ConsumerId;
use crate::keys::HeartbeatKey;
use crate::ownership::OwnershipTable;
use crate::reader;

/// Capacity of the two application-facing channels.
const CHANNEL_CAPACITY: usize = 500;

/// Heartbeat interval applied when the caller passes zero.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

enum Lifecycle {
    Idle,
    Running(CancellationToken),
    Closed,
}

/// A worker's handle onto the shared ingress stream.
///
/// One `Tether` joins the service's consumer group under this process's
/// pod identity, competes for session announcements, keeps heartbeat keys
/// alive for the sessions it wins, and watches for the expired keys of
/// dead peers so their sessions can be claimed.
pub struct Tether {
    backend: Backend,
    identity: ConsumerId,
    hb_interval: Duration,
    subscriber: SubscriberConfig,
    table: Arc<OwnershipTable>,
    lifecycle: Mutex<Lifecycle>,
}

impl Tether {
    /// Builds a client for `service_name` over the given backend handle.
    ///
    /// The consumer identity is captured from the environment here, once;
    /// a zero `hb_interval` falls back to one second. Fails with
    /// [`Error::ConfigMissing`] when neither `POD_NAME` nor `POD_IP` is
    /// set, or [`Error::BackendUnavailable`] when the command connection
    /// cannot be established.
    pub async fn new(
        client: redis::Client,
        hb_interval: Duration,
        service_name: &str,
    ) -> Result<Self> {
        Self::with_config(client, hb_interval, service_name, SubscriberConfig::default()).await
    }

    /// Like [`Tether::new`] with explicit subscription tuning.
    pub async fn with_config(
        client: redis::Client,
        hb_interval: Duration,
        service_name: &str,
        subscriber: SubscriberConfig,
    ) -> Result<Self> {
        let identity = ConsumerId::from_env()?;
        let hb_interval = effective_interval(hb_interval);
        let backend = Backend::connect(client, service_name).await?;

        Ok(Self {
            backend,
            identity,
            hb_interval,
            subscriber,
            table: Arc::new(OwnershipTable::new()),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Starts the background tasks and returns the two output channels:
    /// session assignments and expired-key notifications.
    ///
    /// The consumer group is created at the stream tail when missing, so
    /// only announcements published after the first worker's `init` are
    /// delivered; older stream entries are never back-consumed. Keyspace
    /// notifications for expired keys are enabled and subscribed before
    /// any task starts; failure of either step fails `init` with no tasks
    /// left running.
    ///
    /// All tasks stop when `scope` is cancelled or [`Tether::close`] is
    /// called, after which both channels report end-of-stream. `init` can
    /// run once per client; a restarted worker is a new identity and a new
    /// client.
    pub async fn init(
        &self,
        scope: &CancellationToken,
    ) -> Result<(mpsc::Receiver<AssignedSession>, mpsc::Receiver<String>)> {
        let tasks = scope.child_token();
        {
            let mut lifecycle = self.lock_lifecycle();
            match *lifecycle {
                Lifecycle::Idle => *lifecycle = Lifecycle::Running(tasks.clone()),
                Lifecycle::Running(_) => {
                    return Err(Error::InitFailed("client is already initialized".into()));
                }
                Lifecycle::Closed => {
                    return Err(Error::InitFailed("client is closed".into()));
                }
            }
        }

        let pubsub = match self.prepare().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                let mut lifecycle = self.lock_lifecycle();
                if matches!(*lifecycle, Lifecycle::Running(_)) {
                    *lifecycle = Lifecycle::Idle;
                }
                return Err(e);
            }
        };

        let (ingress_tx, ingress_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (notify_tx, notify_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(reader::run(
            self.backend.clone(),
            self.identity.clone(),
            Arc::clone(&self.table),
            self.hb_interval,
            ingress_tx,
            tasks.clone(),
        ));
        tokio::spawn(heartbeat::run(
            self.backend.clone(),
            self.identity.clone(),
            Arc::clone(&self.table),
            self.hb_interval,
            tasks.clone(),
        ));
        tokio::spawn(expiry::forward(
            pubsub,
            notify_tx,
            self.subscriber.clone(),
            tasks,
        ));

        info!(
            consumer = %self.identity,
            stream = %self.backend.stream_name(),
            "tether initialized"
        );
        Ok((ingress_rx, notify_rx))
    }

    /// Group creation and notification setup, in init order.
    async fn prepare(&self) -> Result<redis::aio::PubSub> {
        self.backend.create_group_at_tail().await?;
        expiry::subscribe(&self.backend, &self.subscriber).await
    }

    /// Attempts to take over the session named by an expired heartbeat
    /// key, as delivered on the notification channel.
    ///
    /// Exactly one of the workers racing for a key wins; the others get
    /// [`Error::AlreadyClaimed`] and should simply move on. To abandon an
    /// in-flight claim, drop the future.
    pub async fn claim(&self, expired_key: &str) -> Result<()> {
        claim::take_over(
            &self.backend,
            &self.identity,
            &self.table,
            self.hb_interval,
            expired_key,
        )
        .await
    }

    /// Releases a finished session: deletes its heartbeat key, acknowledges
    /// the backing ingress entry, and forgets the session locally.
    ///
    /// Returns [`Error::NotOwned`] when this worker does not own the
    /// session. A heartbeat key that already expired is not an error:
    /// the session had moved on, and the acknowledgement still settles
    /// this worker's pending entry.
    pub async fn done(&self, data_stream_name: &str) -> Result<()> {
        let owned = self
            .table
            .get(data_stream_name)
            .ok_or_else(|| Error::NotOwned(data_stream_name.to_string()))?;

        let key = HeartbeatKey::new(&owned.data_stream_name, &owned.entry_id).to_string();
        if let Release::NotOwner = self
            .backend
            .release_if_owner(&key, self.identity.as_str())
            .await?
        {
            debug!(session = %data_stream_name, "session key already gone on release");
        }

        self.backend.ack_entry(&owned.entry_id).await?;
        self.table.remove(data_stream_name);
        info!(session = %data_stream_name, "session released");
        Ok(())
    }

    /// Publishes a session announcement on the ingress stream and returns
    /// its entry id. Producer-side convenience; workers never call this.
    pub async fn append_session(&self, envelope: &SessionEnvelope) -> Result<String> {
        let payload = envelope.encode()?;
        self.backend.append_session(&payload).await
    }

    /// Snapshot of the session names this worker currently owns.
    pub fn streams_owned(&self) -> Vec<String> {
        self.table.names()
    }

    /// The consumer name this worker uses within the group.
    pub fn consumer_id(&self) -> &str {
        self.identity.as_str()
    }

    /// Stops every background task and closes both output channels.
    ///
    /// Heartbeat keys are left to expire so peers learn the sessions are
    /// up for takeover. Idempotent: repeat calls are no-ops.
    pub fn close(&self) {
        let mut lifecycle = self.lock_lifecycle();
        if let Lifecycle::Running(tasks) = &*lifecycle {
            tasks.cancel();
            info!(consumer = %self.identity, "tether closed");
        }
        *lifecycle = Lifecycle::Closed;
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        // lifecycle state stays usable even if a holder panicked
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Applies the default when the caller passes a zero interval.
fn effective_interval(hb_interval: Duration) -> Duration {
    if hb_interval.is_zero() {
        DEFAULT_HEARTBEAT_INTERVAL
    } else {
        hb_interval
    }
}
