//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LumenSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `LUMEN_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{LogFormat, LumenSettings};

/// Resolve the settings file path.
///
/// `$LUMEN_SETTINGS` wins when set; otherwise `~/.lumen/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(path) = read_env_string("LUMEN_SETTINGS") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".lumen").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LumenSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or the merged values fail validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<LumenSettings> {
    let defaults = serde_json::to_value(LumenSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LumenSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall within the given range. Invalid values are
/// logged and ignored (falling back to file/default).
pub fn apply_env_overrides(settings: &mut LumenSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("LUMEN_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("LUMEN_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u64("LUMEN_WRITE_TIMEOUT_MS", 10, 600_000) {
        settings.server.write_timeout_ms = v;
    }

    // ── Realtime ────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("LUMEN_HEARTBEAT_INTERVAL_MS", 100, 3_600_000) {
        settings.realtime.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_u64("LUMEN_CONNECTION_TIMEOUT_MS", 100, 3_600_000) {
        settings.realtime.connection_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("LUMEN_QUEUE_PROCESS_INTERVAL_MS", 1, 60_000) {
        settings.realtime.queue_process_interval_ms = v;
    }
    if let Some(v) = read_env_usize("LUMEN_MAX_QUEUE_SIZE", 1, 10_000_000) {
        settings.realtime.max_queue_size = v;
    }
    if let Some(v) = read_env_usize("LUMEN_BATCH_SIZE", 1, 100_000) {
        settings.realtime.batch_size = v;
    }
    if let Some(v) = read_env_u64("LUMEN_CLEANUP_INTERVAL_MS", 100, 3_600_000) {
        settings.realtime.cleanup_interval_ms = v;
    }
    if let Some(v) = read_env_u64("LUMEN_STALE_GRACE_PERIOD_MS", 0, 3_600_000) {
        settings.realtime.stale_grace_period_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("LUMEN_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_string("LUMEN_LOG_FORMAT") {
        match parse_log_format(&v) {
            Some(format) => settings.logging.format = format,
            None => tracing::warn!(key = "LUMEN_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a log format name (case-insensitive).
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_lowercase().as_str() {
        "compact" | "text" => Some(LogFormat::Compact),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
