use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use zora_providers::ProviderConfig;
use zora_types::RoutingMode;

/// Engine configuration, parsed from `config.toml` in the state directory.
/// Invalid configuration is fatal at boot and never recoverable mid-run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    #[serde(default)]
    pub mode: RoutingMode,
    #[serde(default = "default_handoff_tokens")]
    pub max_handoff_context_tokens: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: RoutingMode::default(),
            max_handoff_context_tokens: default_handoff_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base")]
    pub base_delay_secs: u64,
    #[serde(default = "default_retry_cap")]
    pub max_delay_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_retry_base(),
            max_delay_secs: default_retry_cap(),
            max_attempts: default_retry_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_retry_poll")]
    pub retry_poll_secs: u64,
    #[serde(default = "default_auth_check")]
    pub auth_check_secs: u64,
    #[serde(default = "default_consolidation_initial")]
    pub consolidation_initial_secs: u64,
    #[serde(default = "default_consolidation_interval")]
    pub consolidation_interval_secs: u64,
    /// 0 disables the heartbeat.
    #[serde(default)]
    pub heartbeat_minutes: u64,
    #[serde(default = "default_routine_poll")]
    pub routine_poll_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_poll_secs: default_retry_poll(),
            auth_check_secs: default_auth_check(),
            consolidation_initial_secs: default_consolidation_initial(),
            consolidation_interval_secs: default_consolidation_interval(),
            heartbeat_minutes: 0,
            routine_poll_secs: default_routine_poll(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemorySettings {
    #[serde(default = "default_consolidation_days")]
    pub consolidation_days: i64,
    #[serde(default = "default_true")]
    pub extraction_enabled: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            consolidation_days: default_consolidation_days(),
            extraction_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    #[serde(default = "default_auth_warn")]
    pub warn_before_expiry_minutes: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            warn_before_expiry_minutes: default_auth_warn(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    /// 0 disables the default task timeout.
    #[serde(default)]
    pub default_timeout_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitConfig {
    #[serde(default = "default_circuit_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_circuit_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_circuit_threshold(),
            cooldown_secs: default_circuit_cooldown(),
        }
    }
}

impl CircuitConfig {
    pub fn breaker(&self) -> zora_providers::CircuitBreakerConfig {
        zora_providers::CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).map_err(|err| anyhow::anyhow!("invalid config.toml: {err}"))
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_handoff_tokens() -> usize {
    2_000
}

fn default_retry_base() -> u64 {
    30
}

fn default_retry_cap() -> u64 {
    3_600
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_poll() -> u64 {
    30
}

fn default_auth_check() -> u64 {
    300
}

fn default_consolidation_initial() -> u64 {
    30
}

fn default_consolidation_interval() -> u64 {
    86_400
}

fn default_routine_poll() -> u64 {
    60
}

fn default_consolidation_days() -> i64 {
    7
}

fn default_auth_warn() -> i64 {
    60
}

fn default_circuit_threshold() -> u32 {
    5
}

fn default_circuit_cooldown() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let config = EngineConfig::from_toml_str("").expect("parse");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.scheduler.retry_poll_secs, 30);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn serialize_parse_serialize_is_a_fixed_point() {
        let raw = r#"
[routing]
mode = "optimize_cost"

[retry]
max_attempts = 3

[[providers]]
name = "local"
rank = 1
cost_tier = "free"
capabilities = ["coding", "reasoning"]

[providers.adapter]
kind = "scripted"
"#;
        let config = EngineConfig::from_toml_str(raw).expect("parse");
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.retry.max_attempts, 3);

        let first = config.to_toml_string().expect("serialize");
        let reparsed = EngineConfig::from_toml_str(&first).expect("reparse");
        let second = reparsed.to_toml_string().expect("serialize again");
        assert_eq!(first, second);
        assert_eq!(config, reparsed);
    }
}
