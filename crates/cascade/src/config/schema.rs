use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub collaborator: CollaboratorConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database: DatabaseConfig::default(),
            server: ServerConfig::default(),
            worker_count: default_worker_count(),
            orchestrator: OrchestratorConfig::default(),
            retry: RetryConfig::default(),
            collaborator: CollaboratorConfig::default(),
            poller: PollerConfig::default(),
            queue: QueueConfig::default(),
            sweeper: SweeperConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `~/.cascade/data/cascade.db`.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable base URL, used for HTTP handoffs and polling.
    #[serde(default)]
    pub public_url: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
        }
    }
}

/// How continuations are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContinuationMode {
    /// Durable queue drained by the worker pool.
    Queue,
    /// Fire-and-forget POST to `server.public_url`.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Wall-clock budget of one invocation, kept below the hard ceiling.
    #[serde(default = "default_time_budget")]
    pub time_budget_secs: u64,
    /// After this long without renewal a `running` job is considered
    /// abandoned. Also the lease TTL.
    #[serde(default = "default_staleness")]
    pub staleness_threshold_secs: u64,
    #[serde(default = "default_max_units")]
    pub max_units_per_invocation: usize,
    #[serde(default = "default_max_dimensions")]
    pub max_dimensions_per_invocation: usize,
    /// Pause between units, to stay under collaborator rate limits.
    #[serde(default = "default_unit_delay")]
    pub unit_delay_ms: u64,
    /// A unit that failed this many times is no longer planned.
    #[serde(default = "default_max_unit_failures")]
    pub max_unit_failures: u32,
    #[serde(default = "default_true")]
    pub auto_continue: bool,
    #[serde(default = "default_continuation_mode")]
    pub continuation: ContinuationMode,
}

fn default_time_budget() -> u64 {
    270
}

fn default_staleness() -> u64 {
    600
}

fn default_max_units() -> usize {
    6
}

fn default_max_dimensions() -> usize {
    2
}

fn default_unit_delay() -> u64 {
    1500
}

fn default_max_unit_failures() -> u32 {
    2
}

fn default_continuation_mode() -> ContinuationMode {
    ContinuationMode::Queue
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            time_budget_secs: default_time_budget(),
            staleness_threshold_secs: default_staleness(),
            max_units_per_invocation: default_max_units(),
            max_dimensions_per_invocation: default_max_dimensions(),
            unit_delay_ms: default_unit_delay(),
            max_unit_failures: default_max_unit_failures(),
            auto_continue: true,
            continuation: default_continuation_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per external call, 2 to 4.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Rephrase requests before falling back to a suffix.
    #[serde(default = "default_rephrase_attempts")]
    pub rephrase_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    2000
}

fn default_max_delay() -> u64 {
    10_000
}

fn default_request_timeout() -> u64 {
    60
}

fn default_rephrase_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            request_timeout_secs: default_request_timeout(),
            rephrase_attempts: default_rephrase_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// OpenAI-compatible chat completions URL.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// API key given inline. Prefer `api_key_file` or `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Sub-steps per pipeline, in execution order.
    #[serde(default)]
    pub pipelines: HashMap<String, Vec<StepConfig>>,
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> Option<String> {
    Some("CASCADE_API_KEY".to_string())
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key: None,
            api_key_file: None,
            api_key_env: default_api_key_env(),
            system_prompt: None,
            pipelines: HashMap::new(),
        }
    }
}

/// One generation sub-step. `prompt` may reference `{title}`, `{body}`,
/// `{dimension}`, `{source_dimension}`, `{sub_type}` and the output of
/// earlier steps as `{step.<name>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_fast_interval")]
    pub fast_interval_ms: u64,
    /// How long the fast interval applies after polling starts.
    #[serde(default = "default_fast_window")]
    pub fast_window_secs: u64,
    #[serde(default = "default_slow_interval")]
    pub slow_interval_ms: u64,
    #[serde(default = "default_max_poll_errors")]
    pub max_consecutive_errors: u32,
}

fn default_fast_interval() -> u64 {
    3000
}

fn default_fast_window() -> u64 {
    120
}

fn default_slow_interval() -> u64 {
    10_000
}

fn default_max_poll_errors() -> u32 {
    5
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            fast_interval_ms: default_fast_interval(),
            fast_window_secs: default_fast_window(),
            slow_interval_ms: default_slow_interval(),
            max_consecutive_errors: default_max_poll_errors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a claimed continuation stays invisible to other workers.
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_secs: u64,
    /// Idle workers re-check the queue at this interval.
    #[serde(default = "default_queue_poll")]
    pub poll_interval_ms: u64,
}

fn default_claim_ttl() -> u64 {
    600
}

fn default_queue_poll() -> u64 {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            claim_ttl_secs: default_claim_ttl(),
            poll_interval_ms: default_queue_poll(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
