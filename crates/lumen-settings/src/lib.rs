//! # lumen-settings
//!
//! Configuration management with layered sources for the Lumen server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`LumenSettings::default()`]
//! 2. **Settings file**: `$LUMEN_SETTINGS` or `~/.lumen/settings.json`
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `LUMEN_*` overrides (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use lumen_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("max queue size: {}", settings.realtime.max_queue_size);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
