mod audit;
mod auth_monitor;
mod config;
mod event_bus;
mod failover;
mod leak;
mod pipeline;
mod retry;
mod router;
mod routines;
mod sanitize;
mod scheduler;
mod session_store;
mod steering;

pub mod orchestrator;

pub use audit::{verify_chain, AuditEntry, AuditLogger};
pub use auth_monitor::{AuthMonitor, AuthReport};
pub use config::{
    AuthConfig, CircuitConfig, EngineConfig, MemorySettings, RetryConfig, RoutingConfig,
    SchedulerConfig, TaskConfig,
};
pub use event_bus::EventBus;
pub use failover::{ErrorInfo, FailoverController, HandoffBundle, MAX_FAILOVER_DEPTH};
pub use leak::{scan as scan_for_leaks, LeakMatch, LeakSeverity};
pub use orchestrator::{Orchestrator, TaskEndHook};
pub use pipeline::{ExecutionPipeline, PipelineError, PipelineState, TaskOutcome};
pub use retry::{RetryDisposition, RetryEntry, RetryQueue};
pub use router::{classify, required_capabilities, Router, SelectionPrefs};
pub use routines::{load_routines, CronExpr, RoutineFireGuard, RoutineSpec};
pub use sanitize::{sanitize_prompt, SanitizedPrompt};
pub use scheduler::{Scheduler, TaskSubmitter};
pub use session_store::{BufferedJobWriter, SessionStore, SessionSummary};
pub use steering::{SteeringInbox, SteeringMessage};
