use std::time::Duration;

use crate::config::schema::Config;
use crate::retry::RetryPolicy;

/// Runtime knobs of the orchestrator, resolved from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub time_budget: Duration,
    /// Also the lease TTL.
    pub staleness_threshold: Duration,
    pub max_units: usize,
    pub max_dimensions: usize,
    pub unit_delay: Duration,
    pub max_unit_failures: u32,
    pub auto_continue: bool,
    pub rephrase_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let o = &config.orchestrator;
        Self {
            time_budget: Duration::from_secs(o.time_budget_secs),
            staleness_threshold: Duration::from_secs(o.staleness_threshold_secs),
            max_units: o.max_units_per_invocation.max(1),
            max_dimensions: o.max_dimensions_per_invocation.max(1),
            unit_delay: Duration::from_millis(o.unit_delay_ms),
            max_unit_failures: o.max_unit_failures.max(1),
            auto_continue: o.auto_continue,
            rephrase_attempts: config.retry.rephrase_attempts,
            retry: RetryPolicy::from_config(&config.retry),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.staleness_threshold
    }
}
