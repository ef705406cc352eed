pub mod config;
pub mod net;
pub mod stats;
pub mod store;
pub mod types;

pub use config::{Config, ConfigError, LogLevel, Mode};
pub use net::{Request, Response, Server, ServerError, Tuple};
pub use stats::ServerStats;
pub use store::{Entry, Keyspace, Trie};
pub use types::{now, BUS_PORT_OFFSET, DEFAULT_DB, DEFAULT_PORT, NO_TTL};
