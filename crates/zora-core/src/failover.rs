use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use zora_providers::{Provider, ProviderRegistry};
use zora_types::{Event, EventKind, TaskClassification, TaskSpec};

use crate::router::{Router, SelectionPrefs};

/// Bounded failover recursion: a task hops providers at most this many
/// times before it is retry-queued or failed.
pub const MAX_FAILOVER_DEPTH: u8 = 3;

const QUOTA_COOLDOWN_MINUTES: i64 = 15;

/// Classified view of a provider failure, extracted from an error event or a
/// thrown stream error.
#[derive(Debug, Clone, Default)]
pub struct ErrorInfo {
    pub message: String,
    pub is_auth_error: bool,
    pub is_quota_error: bool,
    pub is_circuit_open: bool,
}

impl ErrorInfo {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn from_event(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Error {
                message,
                is_auth_error,
                is_quota_error,
                is_circuit_open,
            } => Some(Self {
                message: message.clone(),
                is_auth_error: *is_auth_error,
                is_quota_error: *is_quota_error,
                is_circuit_open: *is_circuit_open,
            }),
            _ => None,
        }
    }
}

/// The compressed state payload that lets a substitute provider continue a
/// task mid-flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffBundle {
    pub job_id: String,
    pub from_provider: String,
    pub to_provider: String,
    pub created_at: DateTime<Utc>,
    pub task: TaskSpec,
    pub context_summary: String,
    pub progress_markers: Vec<String>,
    pub artifact_refs: Vec<String>,
    pub tool_history: Vec<Event>,
}

/// On provider failure: mark the breaker, poison auth or quota state as the
/// error dictates, and ask the router for a substitute.
pub struct FailoverController {
    registry: ProviderRegistry,
    router: Arc<Router>,
    max_context_chars: usize,
}

impl FailoverController {
    pub fn new(registry: ProviderRegistry, router: Arc<Router>, max_handoff_context_tokens: usize) -> Self {
        Self {
            registry,
            router,
            // Rough token-to-char expansion for the summary budget.
            max_context_chars: max_handoff_context_tokens.saturating_mul(4),
        }
    }

    /// Returns the substitute provider and the handoff bundle, or `None`
    /// when no alternative exists (the caller enqueues the task for retry).
    pub async fn plan(
        &self,
        task: &TaskSpec,
        classification: &TaskClassification,
        history: &[Event],
        failing: &Arc<dyn Provider>,
        error: &ErrorInfo,
        exclude: &[String],
    ) -> Option<(Arc<dyn Provider>, HandoffBundle)> {
        let failing_name = failing.spec().name.clone();
        failing.state().circuit().record_failure();
        if error.is_auth_error {
            failing.state().poison_auth();
        }
        if error.is_quota_error {
            failing
                .state()
                .set_quota_cooldown(Utc::now() + Duration::minutes(QUOTA_COOLDOWN_MINUTES))
                .await;
        }

        let mut exclusions = exclude.to_vec();
        if !exclusions.contains(&failing_name) {
            exclusions.push(failing_name.clone());
        }
        let prefs = SelectionPrefs {
            // The failed preference must not route the task straight back.
            model_preference: task
                .model_preference
                .clone()
                .filter(|name| !exclusions.contains(name)),
            max_cost_tier: task.max_cost_tier,
        };
        let next = self
            .router
            .select(&self.registry, classification, &prefs, &exclusions)
            .await?;

        let bundle = self.build_bundle(task, history, &failing_name, &next.spec().name, error);
        Some((next, bundle))
    }

    fn build_bundle(
        &self,
        task: &TaskSpec,
        history: &[Event],
        from: &str,
        to: &str,
        error: &ErrorInfo,
    ) -> HandoffBundle {
        let mut progress_markers = Vec::new();
        let mut artifact_refs = Vec::new();
        let mut tool_history = Vec::new();
        let mut summary = format!(
            "Task handed off from {from} after: {}. Completed progress follows.\n",
            error.message
        );

        for event in history {
            match &event.kind {
                EventKind::Text { text } => {
                    let marker = first_line(text, 200);
                    if !marker.is_empty() {
                        progress_markers.push(marker);
                    }
                }
                EventKind::ToolCall { arguments, .. } => {
                    if let Some(path) = arguments.get("file_path").and_then(|v| v.as_str()) {
                        if !artifact_refs.iter().any(|p| p == path) {
                            artifact_refs.push(path.to_string());
                        }
                    }
                    tool_history.push(event.clone());
                }
                EventKind::ToolResult { .. } => tool_history.push(event.clone()),
                _ => {}
            }
        }
        for marker in progress_markers.iter().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
            summary.push_str("- ");
            summary.push_str(marker);
            summary.push('\n');
        }
        summary.truncate_to_boundary(self.max_context_chars);

        HandoffBundle {
            job_id: task.job_id.clone(),
            from_provider: from.to_string(),
            to_provider: to.to_string(),
            created_at: Utc::now(),
            task: task.clone(),
            context_summary: summary,
            progress_markers,
            artifact_refs,
            tool_history,
        }
    }
}

fn first_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    let mut cut = max.min(line.len());
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    line[..cut].to_string()
}

trait TruncateToBoundary {
    fn truncate_to_boundary(&mut self, max: usize);
}

impl TruncateToBoundary for String {
    fn truncate_to_boundary(&mut self, max: usize) {
        if self.len() <= max {
            return;
        }
        let mut cut = max;
        while !self.is_char_boundary(cut) {
            cut -= 1;
        }
        self.truncate(cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use zora_providers::{CircuitBreakerConfig, ScriptedProvider};
    use zora_types::{Capability, Complexity, CostTier, ProviderSpec, ResourceType, RoutingMode};

    fn provider(name: &str, rank: u32) -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new(
            ProviderSpec::new(name, rank, CostTier::Included)
                .with_capabilities([Capability::Coding]),
            CircuitBreakerConfig::default(),
        ))
    }

    fn classification() -> TaskClassification {
        TaskClassification {
            complexity: Complexity::Simple,
            resource_type: ResourceType::Coding,
        }
    }

    fn history() -> Vec<Event> {
        vec![
            Event::text("provider-a", "wrote the outline"),
            Event::now(
                "provider-a",
                EventKind::ToolCall {
                    tool_call_id: "call-1".to_string(),
                    tool: "Write".to_string(),
                    arguments: json!({"file_path": "/tmp/z/a.txt", "content": "hello"}),
                },
            ),
            Event::now(
                "provider-a",
                EventKind::ToolResult {
                    tool_call_id: "call-1".to_string(),
                    tool: "Write".to_string(),
                    output: "wrote 5 bytes".to_string(),
                    is_error: false,
                },
            ),
        ]
    }

    #[tokio::test]
    async fn failover_picks_a_substitute_and_builds_the_bundle() {
        let a = provider("provider-a", 1);
        let b = provider("provider-b", 2);
        let registry = ProviderRegistry::new(vec![a.clone(), b.clone()]);
        let router = Arc::new(Router::new(RoutingMode::RespectRanking));
        let controller = FailoverController::new(registry, router, 2_000);

        let task = TaskSpec::new("write hello");
        let failing: Arc<dyn Provider> = a;
        let error = ErrorInfo {
            message: "quota exhausted".to_string(),
            is_quota_error: true,
            ..ErrorInfo::default()
        };
        let (next, bundle) = controller
            .plan(&task, &classification(), &history(), &failing, &error, &[])
            .await
            .expect("failover target");

        assert_eq!(next.spec().name, "provider-b");
        assert_eq!(bundle.from_provider, "provider-a");
        assert_eq!(bundle.to_provider, "provider-b");
        assert_eq!(bundle.tool_history.len(), 2);
        assert_eq!(bundle.artifact_refs, vec!["/tmp/z/a.txt"]);
        assert!(bundle.context_summary.contains("quota exhausted"));
        assert!(bundle.progress_markers.iter().any(|m| m.contains("outline")));

        // The quota error put the failing provider on cooldown.
        assert!(failing.get_quota_status().await.is_exhausted);
    }

    #[tokio::test]
    async fn no_alternative_returns_none() {
        let a = provider("provider-a", 1);
        let registry = ProviderRegistry::new(vec![a.clone()]);
        let router = Arc::new(Router::new(RoutingMode::RespectRanking));
        let controller = FailoverController::new(registry, router, 2_000);

        let failing: Arc<dyn Provider> = a;
        let planned = controller
            .plan(
                &TaskSpec::new("anything"),
                &classification(),
                &[],
                &failing,
                &ErrorInfo::transient("boom"),
                &[],
            )
            .await;
        assert!(planned.is_none());
    }

    #[tokio::test]
    async fn auth_errors_poison_the_failing_provider_auth_cache() {
        let a = provider("provider-a", 1);
        let b = provider("provider-b", 2);
        // Make the failing provider's next probe return invalid.
        a.set_auth(zora_types::AuthStatus::invalid()).await;
        let registry = ProviderRegistry::new(vec![a.clone(), b]);
        let router = Arc::new(Router::new(RoutingMode::RespectRanking));
        let controller = FailoverController::new(registry, router, 2_000);

        // Warm the cache with the old (valid) status first.
        // (The cache was never populated, so poisoning simply forces the
        // fresh probe on the next availability check.)
        let failing: Arc<dyn Provider> = a.clone();
        let error = ErrorInfo {
            message: "401 unauthorized".to_string(),
            is_auth_error: true,
            ..ErrorInfo::default()
        };
        controller
            .plan(
                &TaskSpec::new("anything"),
                &classification(),
                &[],
                &failing,
                &error,
                &[],
            )
            .await
            .expect("substitute");
        assert!(!failing.is_available().await);
    }
}
