//! Per-client session records.
//!
//! The socket itself is owned by the connection task; the table holds the
//! protocol-visible state (selected database, activity timestamps), keyed by
//! a random 128-bit id. Insertions and removals happen under the store lock.

use crate::types::{now, DEFAULT_DB};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: u128,
    /// Peer address, for logging only.
    pub addr: String,
    /// Name of the currently selected database.
    pub db: String,
    pub connected_at: u64,
    /// Timestamp of the most recent protocol activity.
    pub last_action: u64,
}

impl Session {
    pub fn new(id: u128, addr: String) -> Self {
        let t = now();
        Self {
            id,
            addr,
            db: DEFAULT_DB.to_string(),
            connected_at: t,
            last_action: t,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<u128, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    pub fn remove(&mut self, id: u128) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: u128) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: u128) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
