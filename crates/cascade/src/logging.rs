//! Tracing subscriber setup.
//!
//! Library code logs through the `log` facade; the subscriber's log bridge
//! forwards those records so they share filtering and formatting with
//! tracing spans.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::LoggingConfig;

/// Builds the filter: `RUST_LOG` if set and valid, otherwise the
/// configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Installs the global subscriber. Returns false if one was already
/// installed (e.g. by a test harness).
pub fn init(config: &LoggingConfig) -> bool {
    let registry = tracing_subscriber::registry().with(env_filter(config));
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_filter_falls_back_to_config_level() {
        std::env::remove_var("RUST_LOG");
        let filter = env_filter(&LoggingConfig {
            level: "warn".to_string(),
            json: false,
        });
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    #[serial]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
    }
}
