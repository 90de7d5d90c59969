//! Tracing subscriber setup for processes embedding the Tern session stack.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;
use crate::error::TernError;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice
/// returns [`TernError::Telemetry`] instead of panicking, so tests and
/// embedders that already installed a subscriber can ignore the error.
pub fn init(config: &LoggingConfig) -> Result<(), TernError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TernError::Telemetry(e.to_string()))?;

    tracing::info!(level = %config.level, "Telemetry initialized");

    Ok(())
}

fn default_directives(level: &str) -> String {
    format!("{level},tern_xmpp={level},tern_mam={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_cover_workspace_crates() {
        let directives = default_directives("debug");
        assert!(directives.starts_with("debug"));
        assert!(directives.contains("tern_xmpp=debug"));
        assert!(directives.contains("tern_mam=debug"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn second_init_reports_error() {
        let config = LoggingConfig::default();
        let _ = init(&config);
        assert!(matches!(init(&config), Err(TernError::Telemetry(_))));
    }
}
