//! Runtime configuration structs.
//!
//! Small, in-code-defaulted configuration: Redis connection parameters for
//! the remote-handoff stages, the reporter endpoint and push interval, and
//! the fallback persistence directory.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection parameters for the Redis sink/source/ack stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form the `redis` crate accepts.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Where the reporter pushes status snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    pub host: String,
    pub port: u16,
    /// Push interval. Also the accrual quantum for per-stage elapsed time.
    pub interval: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            interval: Duration::from_secs(5),
        }
    }
}

impl ReporterConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Fallback persistence for failure records and leftover tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Root directory; per-run files land under `<dir>/YYYY-MM-DD/`.
    pub dir: String,
    /// Drain unconsumed envelopes at shutdown into `leftover_tasks(...)`
    /// files. Off by default; drain semantics are unaffected because the
    /// drain runs after every stage has stopped.
    pub persist_leftover_tasks: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            dir: "./fallback".to_string(),
            persist_leftover_tasks: false,
        }
    }
}
