//! Server configuration: defaults, config file parsing, CLI overrides.
//!
//! The config file is a plain text format: one `key value` pair per line,
//! `#` starts a comment. Unknown keys are logged and skipped so old config
//! files keep working across versions.

use crate::types::DEFAULT_PORT;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Hard cap on decoded request bodies when the config does not set one (2 MB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 2 * 1024 * 1024;

/// Default soft cap on process RSS (1 GB, advisory only).
pub const DEFAULT_MAX_MEMORY: u64 = 1024 * 1024 * 1024;

/// Default period between expiration sweeps (milliseconds).
pub const DEFAULT_SWEEP_TIME_MS: u64 = 300;

/// Default period between stats log lines (seconds).
pub const DEFAULT_STATS_TIME_SECS: u64 = 30;

/// Default period between memory checks (seconds).
pub const DEFAULT_MEM_RECLAIM_TIME_SECS: u64 = 60;

/// Default TCP listen backlog.
pub const DEFAULT_TCP_BACKLOG: i32 = 128;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("line {line}: invalid value for {key}: {value}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
}

/// Operating mode: single node or loose cluster membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Standalone,
    Cluster,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STANDALONE" => Some(Mode::Standalone),
            "CLUSTER" => Some(Mode::Cluster),
            _ => None,
        }
    }
}

/// Log verbosity. `INFORMATION` is accepted as an alias for `INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" | "INFORMATION" => Some(LogLevel::Info),
            "WARNING" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// Directive suffix understood by the tracing env filter.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    pub log_path: Option<PathBuf>,
    /// When set, listen on a UNIX-domain socket at this path instead of TCP.
    pub unix_socket: Option<PathBuf>,
    pub ip_address: String,
    pub ip_port: u16,
    /// Soft cap on process RSS in bytes. Advisory: exceeding it only warns.
    pub max_memory: u64,
    /// Seconds between memory checks.
    pub mem_reclaim_time: u64,
    /// Hard cap on decoded body length; frames above it are rejected.
    pub max_request_size: usize,
    /// Listen queue depth, clamped to the system maximum at bind time.
    pub tcp_backlog: i32,
    pub mode: Mode,
    /// Milliseconds between expiration sweeps.
    pub sweep_time_ms: u64,
    /// Seconds between stats log lines.
    pub stats_time_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_path: None,
            unix_socket: None,
            ip_address: "127.0.0.1".to_string(),
            ip_port: DEFAULT_PORT,
            max_memory: DEFAULT_MAX_MEMORY,
            mem_reclaim_time: DEFAULT_MEM_RECLAIM_TIME_SECS,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            tcp_backlog: DEFAULT_TCP_BACKLOG,
            mode: Mode::Standalone,
            sweep_time_ms: DEFAULT_SWEEP_TIME_MS,
            stats_time_secs: DEFAULT_STATS_TIME_SECS,
        }
    }
}

impl Config {
    /// Load a config file on top of the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Config::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };
            config.apply(idx + 1, key, value)?;
        }
        Ok(config)
    }

    fn apply(&mut self, line: usize, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: &str| ConfigError::InvalidValue {
            line,
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "log_level" => {
                self.log_level = LogLevel::parse(value).ok_or_else(|| invalid(key, value))?;
            }
            "log_path" => self.log_path = Some(PathBuf::from(value)),
            "unix_socket" => self.unix_socket = Some(PathBuf::from(value)),
            "ip_address" => self.ip_address = value.to_string(),
            "ip_port" => {
                self.ip_port = value.parse().map_err(|_| invalid(key, value))?;
            }
            "max_memory" => {
                self.max_memory = parse_size(value).ok_or_else(|| invalid(key, value))?;
            }
            "mem_reclaim_time" => {
                self.mem_reclaim_time = value.parse().map_err(|_| invalid(key, value))?;
            }
            "max_request_size" => {
                let size = parse_size(value).ok_or_else(|| invalid(key, value))?;
                self.max_request_size = size as usize;
            }
            "tcp_backlog" => {
                self.tcp_backlog = value.parse().map_err(|_| invalid(key, value))?;
            }
            "mode" => {
                self.mode = Mode::parse(value).ok_or_else(|| invalid(key, value))?;
            }
            "sweep_time" => {
                self.sweep_time_ms = value.parse().map_err(|_| invalid(key, value))?;
            }
            "stats_time" => {
                self.stats_time_secs = value.parse().map_err(|_| invalid(key, value))?;
            }
            _ => warn!("config line {}: unknown key {:?}, skipped", line, key),
        }
        Ok(())
    }
}

/// Parse a byte size with an optional kb/mb/gb suffix (case-insensitive).
fn parse_size(s: &str) -> Option<u64> {
    let lower = s.to_ascii_lowercase();
    let (digits, multiplier) = if let Some(d) = lower.strip_suffix("kb") {
        (d, 1024)
    } else if let Some(d) = lower.strip_suffix("mb") {
        (d, 1024 * 1024)
    } else if let Some(d) = lower.strip_suffix("gb") {
        (d, 1024 * 1024 * 1024)
    } else if let Some(d) = lower.strip_suffix('b') {
        (d, 1)
    } else {
        (lower.as_str(), 1)
    };
    let n: u64 = digits.trim().parse().ok()?;
    n.checked_mul(multiplier)
}
