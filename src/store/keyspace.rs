//! The keyspace: named databases plus the expiration index, coordinated so
//! that both stay consistent. One instance lives behind the store lock;
//! every mutation and every scan runs with the lock held.
//!
//! Expired entries are evicted lazily by point and prefix reads, and in bulk
//! by [`Keyspace::sweep`] on the periodic timer.

use super::expire::ExpireIndex;
use super::trie::{shift_numeric, Entry, Trie};
use std::collections::HashMap;
use tracing::debug;

/// A `(ttl, key, value)` triple as reported to clients.
pub type KeyValue = (i32, Vec<u8>, Vec<u8>);

#[derive(Debug, Default)]
pub struct Keyspace {
    /// Database registry, keyed by name.
    databases: HashMap<String, Trie>,
    expiring: ExpireIndex,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a database, creating it when absent.
    pub fn ensure_db(&mut self, name: &str) {
        self.databases.entry(name.to_string()).or_default();
    }

    pub fn db_count(&self) -> usize {
        self.databases.len()
    }

    /// Keys in one database; 0 when the database does not exist.
    pub fn db_size(&self, db: &str) -> usize {
        self.databases.get(db).map_or(0, Trie::len)
    }

    /// Keys across all databases.
    pub fn total_keys(&self) -> usize {
        self.databases.values().map(Trie::len).sum()
    }

    /// Insert or replace `key`. A nonnegative ttl registers the key with the
    /// expiration index; a negative one clears any pending expiration.
    pub fn put(&mut self, db: &str, key: &[u8], value: Vec<u8>, ttl: i32) {
        let trie = self.databases.entry(db.to_string()).or_default();
        trie.insert(key, value, ttl);
        match trie.get(key).and_then(Entry::deadline) {
            Some(deadline) => self.expiring.register(db, key, deadline),
            None => self.expiring.cancel(db, key),
        }
    }

    /// Point lookup. Expired entries are evicted and reported as a miss;
    /// hits update the entry's access time.
    pub fn get(&mut self, db: &str, key: &[u8], at: u64) -> Option<(i32, Vec<u8>)> {
        let trie = self.databases.get_mut(db)?;
        let hit = match trie.get_mut(key) {
            None => return None,
            Some(entry) if entry.is_expired_at(at) => None,
            Some(entry) => {
                entry.latime = at;
                Some((entry.ttl, entry.data.clone()))
            }
        };
        if hit.is_none() {
            trie.remove(key);
            self.expiring.cancel(db, key);
        }
        hit
    }

    /// Delete `key`. Returns true iff an entry was removed.
    pub fn delete(&mut self, db: &str, key: &[u8]) -> bool {
        let Some(trie) = self.databases.get_mut(db) else {
            return false;
        };
        let removed = trie.remove(key);
        if removed {
            self.expiring.cancel(db, key);
        }
        removed
    }

    /// Set or refresh the TTL of an existing key. Returns false on a miss
    /// (a key expired at `at` counts as missing and is evicted).
    pub fn set_ttl(&mut self, db: &str, key: &[u8], ttl: i32, at: u64) -> bool {
        let Some(trie) = self.databases.get_mut(db) else {
            return false;
        };
        let assigned = match trie.get_mut(key) {
            None => return false,
            Some(entry) if entry.is_expired_at(at) => None,
            Some(entry) => {
                entry.set_ttl(ttl);
                Some(entry.deadline())
            }
        };
        match assigned {
            None => {
                trie.remove(key);
                self.expiring.cancel(db, key);
                false
            }
            Some(Some(deadline)) => {
                self.expiring.register(db, key, deadline);
                true
            }
            Some(None) => {
                self.expiring.cancel(db, key);
                true
            }
        }
    }

    /// Shift a numeric value by `delta`. False when the key is missing,
    /// expired, or not a decimal integer.
    pub fn shift(&mut self, db: &str, key: &[u8], delta: i64, at: u64) -> bool {
        let Some(trie) = self.databases.get_mut(db) else {
            return false;
        };
        let shifted = match trie.get_mut(key) {
            None => return false,
            Some(entry) if entry.is_expired_at(at) => None,
            Some(entry) => Some(shift_numeric(entry, delta)),
        };
        match shifted {
            None => {
                trie.remove(key);
                self.expiring.cancel(db, key);
                false
            }
            Some(shifted) => shifted,
        }
    }

    /// Prefix read: live `(ttl, key, value)` triples in lexicographic order.
    /// Expired entries discovered along the way are evicted.
    pub fn get_prefix(&mut self, db: &str, prefix: &[u8], at: u64) -> Vec<KeyValue> {
        let Some(trie) = self.databases.get_mut(db) else {
            return Vec::new();
        };
        let mut live = Vec::new();
        let mut dead: Vec<Vec<u8>> = Vec::new();
        trie.for_each_prefix_mut(prefix, |key, entry| {
            if entry.is_expired_at(at) {
                dead.push(key.to_vec());
            } else {
                entry.latime = at;
                live.push((entry.ttl, key.to_vec(), entry.data.clone()));
            }
        });
        self.evict(db, &dead);
        live
    }

    /// Prefix enumeration reporting keys only (values left empty).
    pub fn keys(&mut self, db: &str, prefix: &[u8], at: u64) -> Vec<KeyValue> {
        let Some(trie) = self.databases.get_mut(db) else {
            return Vec::new();
        };
        let mut live = Vec::new();
        let mut dead: Vec<Vec<u8>> = Vec::new();
        trie.for_each_prefix(prefix, |key, entry| {
            if entry.is_expired_at(at) {
                dead.push(key.to_vec());
            } else {
                live.push((entry.ttl, key.to_vec(), Vec::new()));
            }
        });
        self.evict(db, &dead);
        live
    }

    /// Delete every key under `prefix`. Returns the number removed.
    pub fn delete_prefix(&mut self, db: &str, prefix: &[u8]) -> usize {
        let Some(trie) = self.databases.get_mut(db) else {
            return 0;
        };
        let removed = trie.remove_prefix(prefix);
        if removed > 0 {
            self.expiring.cancel_prefix(db, prefix);
        }
        removed
    }

    /// Replace value and ttl of every entry under `prefix`, refreshing the
    /// expiration index per entry. Returns the number touched.
    pub fn set_prefix(&mut self, db: &str, prefix: &[u8], value: &[u8], ttl: i32) -> usize {
        let Some(trie) = self.databases.get_mut(db) else {
            return 0;
        };
        let mut touched: Vec<(Vec<u8>, Option<u64>)> = Vec::new();
        trie.for_each_prefix_mut(prefix, |key, entry| {
            entry.replace(value.to_vec(), ttl);
            touched.push((key.to_vec(), entry.deadline()));
        });
        for (key, deadline) in &touched {
            match deadline {
                Some(deadline) => self.expiring.register(db, key, *deadline),
                None => self.expiring.cancel(db, key),
            }
        }
        touched.len()
    }

    /// Shift every numeric value under `prefix` by `delta`; non-numeric
    /// entries are skipped, expired ones evicted. Returns the number shifted.
    pub fn shift_prefix(&mut self, db: &str, prefix: &[u8], delta: i64, at: u64) -> usize {
        let Some(trie) = self.databases.get_mut(db) else {
            return 0;
        };
        let mut shifted = 0;
        let mut dead: Vec<Vec<u8>> = Vec::new();
        trie.for_each_prefix_mut(prefix, |key, entry| {
            if entry.is_expired_at(at) {
                dead.push(key.to_vec());
            } else if shift_numeric(entry, delta) {
                shifted += 1;
            }
        });
        self.evict(db, &dead);
        shifted
    }

    /// Count live entries under `prefix`.
    pub fn count_prefix(&self, db: &str, prefix: &[u8], at: u64) -> usize {
        let Some(trie) = self.databases.get(db) else {
            return 0;
        };
        let mut count = 0;
        trie.for_each_prefix(prefix, |_, entry| {
            if !entry.is_expired_at(at) {
                count += 1;
            }
        });
        count
    }

    /// Drop every key in one database.
    pub fn flush(&mut self, db: &str) {
        if let Some(trie) = self.databases.get_mut(db) {
            trie.clear();
        }
        self.expiring.cancel_db(db);
    }

    /// Evict every due record: remove the entry it names (when it is still
    /// the expired one) and drop the record. Returns the number evicted.
    pub fn sweep(&mut self, at: u64) -> usize {
        let due = self.expiring.take_due(at);
        let mut removed = 0;
        for record in due {
            let Some(trie) = self.databases.get_mut(&record.db) else {
                continue;
            };
            let still_due = trie
                .get(&record.key)
                .is_some_and(|entry| entry.is_expired_at(at));
            if still_due && trie.remove(&record.key) {
                debug!(db = %record.db, key = ?String::from_utf8_lossy(&record.key), "expired");
                removed += 1;
            }
        }
        removed
    }

    fn evict(&mut self, db: &str, keys: &[Vec<u8>]) {
        if keys.is_empty() {
            return;
        }
        if let Some(trie) = self.databases.get_mut(db) {
            for key in keys {
                trie.remove(key);
            }
        }
        for key in keys {
            self.expiring.cancel(db, key);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_expirations(&self) -> usize {
        self.expiring.len()
    }

    #[cfg(test)]
    pub(crate) fn has_expiration(&self, db: &str, key: &[u8]) -> bool {
        self.expiring.contains(db, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now, NO_TTL};

    const DB: &str = "db0";

    fn keyspace() -> Keyspace {
        let mut ks = Keyspace::new();
        ks.ensure_db(DB);
        ks
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mut ks = keyspace();
        ks.put(DB, b"foo", b"bar".to_vec(), NO_TTL);
        let (ttl, value) = ks.get(DB, b"foo", now()).unwrap();
        assert_eq!(ttl, NO_TTL);
        assert_eq!(value, b"bar");
        assert_eq!(ks.db_size(DB), 1);
        assert_eq!(ks.pending_expirations(), 0);
    }

    #[test]
    fn test_ttl_registers_exactly_once() {
        let mut ks = keyspace();
        ks.put(DB, b"tmp", b"x".to_vec(), 10);
        assert!(ks.has_expiration(DB, b"tmp"));
        assert_eq!(ks.pending_expirations(), 1);

        // Replacing with a fresh ttl keeps a single record.
        ks.put(DB, b"tmp", b"y".to_vec(), 20);
        assert_eq!(ks.pending_expirations(), 1);

        // Replacing without a ttl clears the record.
        ks.put(DB, b"tmp", b"z".to_vec(), NO_TTL);
        assert_eq!(ks.pending_expirations(), 0);
    }

    #[test]
    fn test_lazy_eviction_on_get() {
        let mut ks = keyspace();
        ks.put(DB, b"tmp", b"x".to_vec(), 1);
        let later = now() + 5;
        assert!(ks.get(DB, b"tmp", later).is_none());
        assert_eq!(ks.db_size(DB), 0);
        assert_eq!(ks.pending_expirations(), 0);
    }

    #[test]
    fn test_sweep_evicts_due_entries() {
        let mut ks = keyspace();
        ks.put(DB, b"a", b"1".to_vec(), 1);
        ks.put(DB, b"b", b"2".to_vec(), 1);
        ks.put(DB, b"keep", b"3".to_vec(), NO_TTL);

        let swept = ks.sweep(now() + 5);
        assert_eq!(swept, 2);
        assert_eq!(ks.db_size(DB), 1);
        assert!(ks.get(DB, b"keep", now()).is_some());
        assert_eq!(ks.pending_expirations(), 0);
    }

    #[test]
    fn test_sweep_skips_refreshed_entries() {
        let mut ks = keyspace();
        ks.put(DB, b"k", b"1".to_vec(), 1);
        // Refresh with a much longer ttl before the sweep fires.
        assert!(ks.set_ttl(DB, b"k", 1000, now()));
        assert_eq!(ks.sweep(now() + 5), 0);
        assert!(ks.get(DB, b"k", now()).is_some());
    }

    #[test]
    fn test_set_ttl_missing_key() {
        let mut ks = keyspace();
        assert!(!ks.set_ttl(DB, b"ghost", 10, now()));
    }

    #[test]
    fn test_shift_numeric_and_not() {
        let mut ks = keyspace();
        ks.put(DB, b"n", b"9".to_vec(), NO_TTL);
        assert!(ks.shift(DB, b"n", 1, now()));
        assert_eq!(ks.get(DB, b"n", now()).unwrap().1, b"10");

        ks.put(DB, b"n", b"abc".to_vec(), NO_TTL);
        assert!(!ks.shift(DB, b"n", 1, now()));
        assert_eq!(ks.get(DB, b"n", now()).unwrap().1, b"abc");

        assert!(!ks.shift(DB, b"missing", 1, now()));
    }

    #[test]
    fn test_prefix_shift_skips_non_numeric() {
        let mut ks = keyspace();
        ks.put(DB, b"num1", b"1".to_vec(), NO_TTL);
        ks.put(DB, b"num2", b"41".to_vec(), NO_TTL);
        ks.put(DB, b"numx", b"abc".to_vec(), NO_TTL);

        assert_eq!(ks.shift_prefix(DB, b"num", 1, now()), 2);
        assert_eq!(ks.get(DB, b"num1", now()).unwrap().1, b"2");
        assert_eq!(ks.get(DB, b"num2", now()).unwrap().1, b"42");
        assert_eq!(ks.get(DB, b"numx", now()).unwrap().1, b"abc");
    }

    #[test]
    fn test_prefix_set_refreshes_expirations() {
        let mut ks = keyspace();
        ks.put(DB, b"alpha", b"1".to_vec(), NO_TTL);
        ks.put(DB, b"alphax", b"2".to_vec(), NO_TTL);

        assert_eq!(ks.set_prefix(DB, b"alpha", b"v", 60), 2);
        assert_eq!(ks.pending_expirations(), 2);
        for key in [&b"alpha"[..], b"alphax"] {
            let (ttl, value) = ks.get(DB, key, now()).unwrap();
            assert_eq!(ttl, 60);
            assert_eq!(value, b"v");
        }

        // Clearing the ttl in bulk drops the records again.
        assert_eq!(ks.set_prefix(DB, b"alpha", b"w", NO_TTL), 2);
        assert_eq!(ks.pending_expirations(), 0);
    }

    #[test]
    fn test_prefix_delete_and_count() {
        let mut ks = keyspace();
        ks.put(DB, b"alpha", b"1".to_vec(), NO_TTL);
        ks.put(DB, b"alphax", b"2".to_vec(), 30);
        ks.put(DB, b"beta", b"3".to_vec(), NO_TTL);

        assert_eq!(ks.count_prefix(DB, b"alpha", now()), 2);
        assert_eq!(ks.delete_prefix(DB, b"alpha"), 2);
        assert_eq!(ks.count_prefix(DB, b"alpha", now()), 0);
        assert_eq!(ks.db_size(DB), 1);
        assert_eq!(ks.pending_expirations(), 0);
    }

    #[test]
    fn test_prefix_get_order_and_eviction() {
        let mut ks = keyspace();
        ks.put(DB, b"alphax", b"2".to_vec(), NO_TTL);
        ks.put(DB, b"alpha", b"1".to_vec(), NO_TTL);
        ks.put(DB, b"alphaz", b"3".to_vec(), 1);

        let later = now() + 5;
        let result = ks.get_prefix(DB, b"alpha", later);
        let keys: Vec<_> = result.iter().map(|(_, k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"alpha".to_vec(), b"alphax".to_vec()]);
        // The expired entry was evicted by the scan.
        assert_eq!(ks.db_size(DB), 2);
    }

    #[test]
    fn test_keys_reports_empty_values() {
        let mut ks = keyspace();
        ks.put(DB, b"alpha", b"1".to_vec(), NO_TTL);
        ks.put(DB, b"alphax", b"2".to_vec(), NO_TTL);
        ks.put(DB, b"beta", b"3".to_vec(), NO_TTL);

        let listed = ks.keys(DB, b"a", now());
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|(_, _, v)| v.is_empty()));
        assert_eq!(listed[0].1, b"alpha");
        assert_eq!(listed[1].1, b"alphax");
    }

    #[test]
    fn test_flush() {
        let mut ks = keyspace();
        ks.put(DB, b"a", b"1".to_vec(), 30);
        ks.put(DB, b"b", b"2".to_vec(), NO_TTL);
        ks.flush(DB);
        assert_eq!(ks.db_size(DB), 0);
        assert_eq!(ks.pending_expirations(), 0);
    }

    #[test]
    fn test_databases_are_isolated() {
        let mut ks = keyspace();
        ks.ensure_db("scratch");
        ks.put("scratch", b"x", b"1".to_vec(), NO_TTL);

        assert!(ks.get(DB, b"x", now()).is_none());
        assert!(ks.get("scratch", b"x", now()).is_some());
        assert_eq!(ks.total_keys(), 1);
        assert_eq!(ks.db_count(), 2);
    }
}
