use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Capability, CapabilitySet, CostTier};

/// Stable provider attributes, loaded at boot and immutable for the process
/// lifetime. Evolving state (auth, quota, circuit breaker, usage) lives with
/// the adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderSpec {
    pub name: String,
    /// Lower is preferred.
    pub rank: u32,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    pub cost_tier: CostTier,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProviderSpec {
    pub fn new(name: impl Into<String>, rank: u32, cost_tier: CostTier) -> Self {
        Self {
            name: name.into(),
            rank,
            capabilities: CapabilitySet::new(),
            cost_tier,
            enabled: true,
        }
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(caps);
        self
    }

    pub fn has_all(&self, required: &CapabilitySet) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub can_auto_refresh: bool,
    #[serde(default)]
    pub requires_interaction: bool,
}

impl AuthStatus {
    pub fn valid() -> Self {
        Self {
            valid: true,
            expires_at: None,
            can_auto_refresh: false,
            requires_interaction: false,
        }
    }

    pub fn invalid() -> Self {
        Self {
            valid: false,
            expires_at: None,
            can_auto_refresh: false,
            requires_interaction: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub is_exhausted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Derived from the circuit breaker; 1.0 is fully healthy.
    pub health_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub total_cost_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub request_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_all_checks_capability_subset() {
        let spec = ProviderSpec::new("a", 1, CostTier::Included)
            .with_capabilities([Capability::Coding, Capability::Reasoning]);
        let mut required = CapabilitySet::new();
        required.insert(Capability::Coding);
        assert!(spec.has_all(&required));
        required.insert(Capability::Search);
        assert!(!spec.has_all(&required));
    }

    #[test]
    fn provider_spec_defaults_enabled() {
        let raw = r#"{"name":"a","rank":1,"cost_tier":"free"}"#;
        let spec: ProviderSpec = serde_json::from_str(raw).expect("parse");
        assert!(spec.enabled);
        assert!(spec.capabilities.is_empty());
    }
}
