//! Shared constants and clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 8998;

/// Offset added to the listening port to derive the UDP bus port.
pub const BUS_PORT_OFFSET: u16 = 10000;

/// Database every new session starts on.
pub const DEFAULT_DB: &str = "db0";

/// TTL sentinel meaning "never expires".
pub const NO_TTL: i32 = -1;

/// Seconds since the Unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
