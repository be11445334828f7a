use std::path::Path;

use crate::config::schema::{Config, ContinuationMode};
use crate::error::ConfigError;

/// Supported config file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Guesses the format from the file extension; anything that is not
    /// `.yaml`/`.yml` is treated as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut config = load_config_from_str(&content, ConfigFormat::from_path(path))?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_config_from_str(content: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    let config: Config = match format {
        ConfigFormat::Json => serde_json::from_str(content)?,
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
    };

    validate_config(&config)?;

    Ok(config)
}

/// Applies `CASCADE_DATABASE_PATH`, `CASCADE_HOST` and `CASCADE_PORT`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("CASCADE_DATABASE_PATH").filter(|v| !v.is_empty()) {
        config.database.path = Some(path);
    }
    if let Some(host) = lookup("CASCADE_HOST").filter(|v| !v.is_empty()) {
        config.server.host = host;
    }
    if let Some(port) = lookup("CASCADE_PORT").filter(|v| !v.is_empty()) {
        config.server.port = port.parse().map_err(|e| ConfigError::InvalidOverride {
            name: "CASCADE_PORT".to_string(),
            reason: format!("{}", e),
        })?;
    }
    Ok(())
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let fail = |message: String| Err(ConfigError::Validation { message });

    if config.version != "1.0" {
        return fail(format!("Unsupported config version: {}", config.version));
    }

    if config.worker_count == 0 {
        return fail("worker_count must be at least 1".to_string());
    }

    let orch = &config.orchestrator;
    if orch.time_budget_secs == 0 {
        return fail("orchestrator.time_budget_secs must be at least 1".to_string());
    }
    // A live invocation must never look abandoned.
    if orch.time_budget_secs >= orch.staleness_threshold_secs {
        return fail(format!(
            "orchestrator.time_budget_secs ({}) must be below staleness_threshold_secs ({})",
            orch.time_budget_secs, orch.staleness_threshold_secs
        ));
    }
    if orch.max_units_per_invocation == 0 {
        return fail("orchestrator.max_units_per_invocation must be at least 1".to_string());
    }
    if orch.max_dimensions_per_invocation == 0 {
        return fail("orchestrator.max_dimensions_per_invocation must be at least 1".to_string());
    }
    if orch.max_unit_failures == 0 {
        return fail("orchestrator.max_unit_failures must be at least 1".to_string());
    }
    if orch.continuation == ContinuationMode::Http && config.server.public_url.is_none() {
        return fail("orchestrator.continuation = http requires server.public_url".to_string());
    }

    let retry = &config.retry;
    if !(2..=4).contains(&retry.max_attempts) {
        return fail(format!(
            "retry.max_attempts must be between 2 and 4, got {}",
            retry.max_attempts
        ));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        return fail("retry.base_delay_ms must not exceed retry.max_delay_ms".to_string());
    }
    if retry.request_timeout_secs == 0 {
        return fail("retry.request_timeout_secs must be at least 1".to_string());
    }

    if config.queue.claim_ttl_secs < orch.time_budget_secs {
        return fail("queue.claim_ttl_secs must cover orchestrator.time_budget_secs".to_string());
    }

    for (pipeline, steps) in &config.collaborator.pipelines {
        if steps.is_empty() {
            return fail(format!("collaborator pipeline '{}' has no steps", pipeline));
        }
        let mut names = std::collections::HashSet::new();
        for step in steps {
            if !names.insert(step.name.as_str()) {
                return fail(format!(
                    "collaborator pipeline '{}' repeats step '{}'",
                    pipeline, step.name
                ));
            }
        }
    }

    Ok(())
}
