//! Expiration index: one record per key carrying a TTL, kept sorted
//! ascending by deadline.
//!
//! Records hold the owning database name and an owned copy of the key
//! instead of a reference into the trie; the entry is re-resolved under the
//! store lock when the record fires. The vector is fully re-sorted after
//! every TTL-mutating operation; TTL mutations are rare next to reads.

/// One pending expiration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireRecord {
    pub db: String,
    pub key: Vec<u8>,
    /// Absolute epoch-seconds deadline (`ctime + ttl`).
    pub deadline: u64,
}

#[derive(Debug, Default)]
pub struct ExpireIndex {
    records: Vec<ExpireRecord>,
}

impl ExpireIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Register (or refresh) the record for `(db, key)`. Any previous record
    /// for the same key is dropped first, so each key appears at most once.
    pub fn register(&mut self, db: &str, key: &[u8], deadline: u64) {
        self.cancel(db, key);
        self.records.push(ExpireRecord {
            db: db.to_string(),
            key: key.to_vec(),
            deadline,
        });
        self.records.sort_by_key(|r| r.deadline);
    }

    /// Drop the record for `(db, key)`, if any.
    pub fn cancel(&mut self, db: &str, key: &[u8]) {
        self.records.retain(|r| r.db != db || r.key != key);
    }

    /// Drop every record under `prefix` in `db`.
    pub fn cancel_prefix(&mut self, db: &str, prefix: &[u8]) {
        self.records
            .retain(|r| r.db != db || !r.key.starts_with(prefix));
    }

    /// Drop every record belonging to `db`.
    pub fn cancel_db(&mut self, db: &str) {
        self.records.retain(|r| r.db != db);
    }

    /// Pop records with `deadline <= at`, relying on the sort invariant to
    /// stop at the first record still in the future.
    pub fn take_due(&mut self, at: u64) -> Vec<ExpireRecord> {
        let due = self.records.partition_point(|r| r.deadline <= at);
        self.records.drain(..due).collect()
    }

    /// Deadline of the next record to fire, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.records.first().map(|r| r.deadline)
    }

    pub fn contains(&self, db: &str, key: &[u8]) -> bool {
        self.records.iter().any(|r| r.db == db && r.key == key)
    }
}
