//! `tracing` subscriber setup.

use lumen_settings::{LogFormat, LoggingSettings};
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber writing to stderr.
///
/// `RUST_LOG` wins over `settings.level`. Subsequent calls are no-ops.
pub fn init_subscriber(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails if a global subscriber is already set
    let _ = match settings.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        let settings = LoggingSettings::default();
        init_subscriber(&settings);
        init_subscriber(&LoggingSettings {
            format: LogFormat::Json,
            ..settings
        });
        tracing::info!("still logging");
    }
}
