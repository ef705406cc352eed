//! In-memory storage: trie keyspace, databases, TTL expiry.

pub mod expire;
pub mod keyspace;
pub mod trie;

pub use expire::{ExpireIndex, ExpireRecord};
pub use keyspace::{KeyValue, Keyspace};
pub use trie::{shift_numeric, Entry, Trie};
