//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file may be partial: missing fields take their compiled default.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 4000 },
///   "realtime": { "maxQueueSize": 5000, "batchSize": 100 },
///   "logging": { "level": "debug", "format": "json" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LumenSettings {
    /// HTTP / WebSocket listener settings.
    pub server: ServerSettings,
    /// Connection and broadcast manager tuning.
    pub realtime: RealtimeSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl LumenSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.realtime.validate()?;
        if self.server.send_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendBuffer must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Server network settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (`0` picks a free port).
    pub port: u16,
    /// Capacity of each connection's outbound frame channel.
    pub send_buffer: usize,
    /// How long a single socket write may wait for channel space, in milliseconds.
    pub write_timeout_ms: u64,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            send_buffer: 256,
            write_timeout_ms: 5_000,
            max_message_size: 1024 * 1024,
        }
    }
}

/// Connection and broadcast manager settings.
///
/// All durations are in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeSettings {
    /// How often every connection is pinged.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is marked stale.
    pub connection_timeout_ms: u64,
    /// How often the outbound queue is drained.
    pub queue_process_interval_ms: u64,
    /// Queue capacity; the oldest messages are dropped beyond it.
    pub max_queue_size: usize,
    /// Maximum messages delivered per drain tick.
    pub batch_size: usize,
    /// How often stale and closed connections are swept.
    pub cleanup_interval_ms: u64,
    /// How long a connection may stay stale before it is swept.
    pub stale_grace_period_ms: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            connection_timeout_ms: 60_000,
            queue_process_interval_ms: 100,
            max_queue_size: 1000,
            batch_size: 50,
            cleanup_interval_ms: 60_000,
            stale_grace_period_ms: 30_000,
        }
    }
}

impl RealtimeSettings {
    fn validate(&self) -> Result<()> {
        let checks = [
            ("realtime.heartbeatIntervalMs", self.heartbeat_interval_ms == 0),
            ("realtime.connectionTimeoutMs", self.connection_timeout_ms == 0),
            (
                "realtime.queueProcessIntervalMs",
                self.queue_process_interval_ms == 0,
            ),
            ("realtime.maxQueueSize", self.max_queue_size == 0),
            ("realtime.batchSize", self.batch_size == 0),
            ("realtime.cleanupIntervalMs", self.cleanup_interval_ms == 0),
        ];
        match checks.iter().find(|(_, bad)| *bad) {
            Some((name, _)) => Err(SettingsError::InvalidValue(format!("{name} must be > 0"))),
            None => Ok(()),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
