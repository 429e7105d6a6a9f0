use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Reasoning,
    Coding,
    Data,
    Creative,
    Search,
    Mixed,
}

/// Coarse expense classification. Ordering is by expense: free < included
/// < metered < premium.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Free,
    Included,
    Metered,
    Premium,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Reasoning,
    Coding,
    Creative,
    StructuredData,
    LargeContext,
    Search,
    Fast,
}

impl ResourceType {
    /// The capability a task of this resource type requires of a provider.
    pub fn required_capability(self) -> Capability {
        match self {
            ResourceType::Reasoning | ResourceType::Mixed => Capability::Reasoning,
            ResourceType::Coding => Capability::Coding,
            ResourceType::Data => Capability::StructuredData,
            ResourceType::Creative => Capability::Creative,
            ResourceType::Search => Capability::Search,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskClassification {
    pub complexity: Complexity,
    pub resource_type: ResourceType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum RoutingMode {
    RespectRanking,
    OptimizeCost,
    RoundRobin,
    ProviderOnly { provider: String },
}

impl Default for RoutingMode {
    fn default() -> Self {
        RoutingMode::RespectRanking
    }
}

/// The durable description of a unit of work. Runtime handles (authorizer,
/// cancellation, accumulated history) live on the execution side; this is
/// what survives in the retry queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub job_id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<TaskClassification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_preference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost_tier: Option<CostTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

impl TaskSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            job_id: format!("job-{}", Uuid::new_v4()),
            prompt: prompt.into(),
            classification: None,
            model_preference: None,
            max_cost_tier: None,
            max_turns: None,
        }
    }

    pub fn with_preference(mut self, provider: impl Into<String>) -> Self {
        self.model_preference = Some(provider.into());
        self
    }

    pub fn with_cost_ceiling(mut self, tier: CostTier) -> Self {
        self.max_cost_tier = Some(tier);
        self
    }
}

pub type CapabilitySet = BTreeSet<Capability>;
