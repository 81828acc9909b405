//! In-memory registry of the sessions this worker currently owns.

use dashmap::DashMap;

/// One owned session: the substream name plus the ingress entry backing it.
///
/// The lock handle is implicit: the remote heartbeat key named after these
/// two fields, conditioned on this worker's consumer id. Holding an
/// `OwnedSession` without the key being live means ownership is already
/// gone and the heartbeat keeper will drop the record on its next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedSession {
    pub data_stream_name: String,
    pub entry_id: String,
}

/// Ownership table keyed by session name.
///
/// Mutated from three places: the group reader (insert on new entry), the
/// heartbeat keeper (remove on lost ownership) and the release path
/// (remove on `done`). DashMap serializes the mutators per shard;
/// `names` and `snapshot` observe a consistent point-in-time view of each
/// entry.
#[derive(Debug, Default)]
pub struct OwnershipTable {
    sessions: DashMap<String, OwnedSession>,
}

impl OwnershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session, replacing any previous record for the name.
    pub fn insert(&self, session: OwnedSession) {
        self.sessions
            .insert(session.data_stream_name.clone(), session);
    }

    /// Removes and returns the record for `name`, if owned.
    pub fn remove(&self, name: &str) -> Option<OwnedSession> {
        self.sessions.remove(name).map(|(_, session)| session)
    }

    /// Returns a copy of the record for `name`, if owned.
    pub fn get(&self, name: &str) -> Option<OwnedSession> {
        self.sessions.get(name).map(|entry| entry.value().clone())
    }

    /// Names of all owned sessions.
    pub fn names(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Copies of all owned records, for iteration outside the map locks.
    pub fn snapshot(&self) -> Vec<OwnedSession> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
