mod event;
mod provider;
mod task;
mod wire;

pub use event::{Event, EventKind};
pub use provider::{AuthStatus, ProviderSpec, QuotaStatus, UsageTotals};
pub use task::{
    Capability, CapabilitySet, Complexity, CostTier, ResourceType, RoutingMode, TaskClassification,
    TaskSpec,
};
pub use wire::Envelope;
