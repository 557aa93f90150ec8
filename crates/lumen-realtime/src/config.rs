//! Manager tuning knobs.

use std::time::Duration;

use lumen_settings::RealtimeSettings;

use crate::errors::{RealtimeError, Result};

/// Timing and capacity configuration for [`RealtimeManager`](crate::RealtimeManager).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// How often every connection is pinged and checked for silence.
    pub heartbeat_interval: Duration,
    /// Silence after which an active connection becomes stale.
    pub connection_timeout: Duration,
    /// How often the outbound queue is drained.
    pub queue_process_interval: Duration,
    /// Queue capacity; older messages are dropped beyond it.
    pub max_queue_size: usize,
    /// Maximum messages delivered per drain tick.
    pub batch_size: usize,
    /// How often stale and closed connections are swept.
    pub cleanup_interval: Duration,
    /// How long a connection may stay stale before the sweeper removes it.
    pub stale_grace_period: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self::from(&RealtimeSettings::default())
    }
}

impl From<&RealtimeSettings> for RealtimeConfig {
    fn from(settings: &RealtimeSettings) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
            queue_process_interval: Duration::from_millis(settings.queue_process_interval_ms),
            max_queue_size: settings.max_queue_size,
            batch_size: settings.batch_size,
            cleanup_interval: Duration::from_millis(settings.cleanup_interval_ms),
            stale_grace_period: Duration::from_millis(settings.stale_grace_period_ms),
        }
    }
}

impl RealtimeConfig {
    /// Reject zero sizes and zero timer periods (`tokio::time::interval`
    /// panics on a zero period).
    pub fn validate(&self) -> Result<()> {
        let zero_periods = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("connection_timeout", self.connection_timeout),
            ("queue_process_interval", self.queue_process_interval),
            ("cleanup_interval", self.cleanup_interval),
        ];
        if let Some((name, _)) = zero_periods.iter().find(|(_, d)| d.is_zero()) {
            return Err(RealtimeError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.max_queue_size == 0 {
            return Err(RealtimeError::InvalidConfig("max_queue_size must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(RealtimeError::InvalidConfig("batch_size must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_settings_defaults() {
        let cfg = RealtimeConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.connection_timeout, Duration::from_secs(60));
        assert_eq!(cfg.queue_process_interval, Duration::from_millis(100));
        assert_eq!(cfg.max_queue_size, 1000);
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.cleanup_interval, Duration::from_secs(60));
        assert_eq!(cfg.stale_grace_period, Duration::from_secs(30));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn converts_millis_from_settings() {
        let settings = RealtimeSettings {
            heartbeat_interval_ms: 1500,
            queue_process_interval_ms: 5,
            ..RealtimeSettings::default()
        };
        let cfg = RealtimeConfig::from(&settings);
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(cfg.queue_process_interval, Duration::from_millis(5));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let cfg = RealtimeConfig {
            queue_process_interval: Duration::ZERO,
            ..RealtimeConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("queue_process_interval"));
    }

    #[test]
    fn zero_batch_is_rejected() {
        let cfg = RealtimeConfig {
            batch_size: 0,
            ..RealtimeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(RealtimeError::InvalidConfig(_))));
    }

    #[test]
    fn zero_grace_period_is_allowed() {
        let cfg = RealtimeConfig {
            stale_grace_period: Duration::ZERO,
            ..RealtimeConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
