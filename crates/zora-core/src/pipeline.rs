use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use zora_memory::{ContextMode, MemoryManager};
use zora_policy::{PolicyEngine, Verdict};
use zora_providers::{Provider, ProviderRegistry, TaskContext, ToolAuthorizer, ToolDecision};
use zora_types::{Envelope, Event, EventKind, TaskClassification, TaskSpec};

use crate::audit::AuditLogger;
use crate::event_bus::EventBus;
use crate::failover::{ErrorInfo, FailoverController, HandoffBundle, MAX_FAILOVER_DEPTH};
use crate::leak::{self, LeakSeverity};
use crate::retry::RetryQueue;
use crate::router::{classify, Router, SelectionPrefs};
use crate::sanitize::sanitize_prompt;
use crate::session_store::{BufferedJobWriter, SessionStore};
use crate::steering::SteeringInbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    New,
    Routing,
    Executing,
    SteeringCheck,
    FailingOver,
    Retrying,
    Done,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no provider available")]
    NoProviderAvailable,

    #[error("task cancelled")]
    Cancelled,

    #[error("provider failure: {}", info.message)]
    ProviderFailure {
        info: ErrorInfo,
        /// Set once this error has been through the failover/retry path, so
        /// an outer catch never double-handles it.
        handled: bool,
        retry_queued: bool,
    },
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub job_id: String,
    pub provider: String,
    pub result_text: String,
    pub event_count: usize,
    /// Text and done payloads, kept for post-task memory extraction.
    pub collected_texts: Vec<String>,
}

/// Per-task state machine: owns event streaming from a provider, durable
/// persistence, steering injection, leak scanning, and bounded failover.
pub struct ExecutionPipeline {
    registry: ProviderRegistry,
    router: Arc<Router>,
    failover: Arc<FailoverController>,
    policy: Arc<PolicyEngine>,
    memory: Arc<MemoryManager>,
    sessions: Arc<SessionStore>,
    steering: Arc<SteeringInbox>,
    retry: Arc<RetryQueue>,
    bus: EventBus,
    audit: AuditLogger,
    identity: String,
}

/// Binds the policy engine to one job as the authorizer handle carried on
/// the task context.
struct TaskAuthorizer {
    policy: Arc<PolicyEngine>,
    job_id: String,
}

#[async_trait]
impl ToolAuthorizer for TaskAuthorizer {
    async fn authorize(&self, tool: &str, input: &Value) -> ToolDecision {
        match self.policy.authorize(&self.job_id, tool, input).await {
            Verdict::Allow { updated_input } => ToolDecision::Allow { updated_input },
            Verdict::Deny { reason } => ToolDecision::Deny { reason },
        }
    }
}

#[allow(clippy::too_many_arguments)]
impl ExecutionPipeline {
    pub fn new(
        registry: ProviderRegistry,
        router: Arc<Router>,
        failover: Arc<FailoverController>,
        policy: Arc<PolicyEngine>,
        memory: Arc<MemoryManager>,
        sessions: Arc<SessionStore>,
        steering: Arc<SteeringInbox>,
        retry: Arc<RetryQueue>,
        bus: EventBus,
        audit: AuditLogger,
        identity: String,
    ) -> Self {
        Self {
            registry,
            router,
            failover,
            policy,
            memory,
            sessions,
            steering,
            retry,
            bus,
            audit,
            identity,
        }
    }

    /// Drive one task from prompt to terminal state.
    pub async fn run(
        &self,
        task: TaskSpec,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, PipelineError> {
        let job_id = task.job_id.clone();
        self.publish_state(&job_id, PipelineState::Routing);

        let mut task = task;
        let sanitized = sanitize_prompt(&task.prompt);
        if !sanitized.findings.is_empty() {
            self.audit.append(
                "prompt_sanitized",
                json!({"job_id": job_id, "patterns": sanitized.findings}),
            );
        }
        task.prompt = sanitized.text;

        let memory_context = match self.memory.load_context(ContextMode::Progressive).await {
            Ok(context) => context,
            Err(err) => {
                tracing::warn!(%job_id, %err, "memory context unavailable; continuing without");
                String::new()
            }
        };
        let system_prompt = self.build_system_prompt(&memory_context);

        self.policy.start_session(&job_id).await;
        self.policy
            .create_capsule(&job_id, &task.prompt, None, None)
            .await;

        let classification = task
            .classification
            .unwrap_or_else(|| classify(&task.prompt));
        task.classification = Some(classification);

        let prefs = SelectionPrefs {
            model_preference: task.model_preference.clone(),
            max_cost_tier: task.max_cost_tier,
        };
        let Some(provider) = self
            .router
            .select(&self.registry, &classification, &prefs, &[])
            .await
        else {
            self.publish_state(&job_id, PipelineState::Failed);
            let event = Event::error("system", "no provider available");
            let _ = self.sessions.append(&job_id, &event).await;
            self.emit(&job_id, &event);
            self.policy.end_session(&job_id).await;
            return Err(PipelineError::NoProviderAvailable);
        };

        let result = self
            .run_on_provider(
                provider,
                task,
                system_prompt,
                classification,
                None,
                cancel,
                0,
                Vec::new(),
                Vec::new(),
            )
            .await;

        match &result {
            Ok(outcome) => {
                if let Err(err) = self
                    .memory
                    .note_task_completion(&job_id, &outcome.result_text)
                    .await
                {
                    tracing::warn!(%job_id, %err, "daily-note completion line failed");
                }
                if self.memory.extraction_enabled() {
                    let memory = self.memory.clone();
                    let texts = outcome.collected_texts.clone();
                    let extraction_job = job_id.clone();
                    tokio::spawn(async move {
                        if let Err(err) = memory.extract_after_task(&extraction_job, texts).await {
                            tracing::warn!(job_id = %extraction_job, %err, "post-task extraction failed");
                        }
                    });
                }
            }
            Err(err) => {
                tracing::warn!(%job_id, %err, "task ended without success");
            }
        }
        self.policy.end_session(&job_id).await;
        result
    }

    /// One attempt on one provider. Failover recurses here with depth + 1.
    #[allow(clippy::too_many_arguments)]
    fn run_on_provider(
        &self,
        provider: Arc<dyn Provider>,
        task: TaskSpec,
        system_prompt: String,
        classification: TaskClassification,
        handoff: Option<HandoffBundle>,
        cancel: CancellationToken,
        depth: u8,
        exclude: Vec<String>,
        mut history: Vec<Event>,
    ) -> BoxFuture<'_, Result<TaskOutcome, PipelineError>> {
        async move {
            let job_id = task.job_id.clone();
            let provider_name = provider.spec().name.clone();
            self.publish_state(&job_id, PipelineState::Executing);

            let attempt_system_prompt = match &handoff {
                None => system_prompt.clone(),
                Some(bundle) => format!(
                    "{system_prompt}\n\n## Handoff context\n{}",
                    bundle.context_summary
                ),
            };
            let ctx = TaskContext {
                job_id: job_id.clone(),
                prompt: task.prompt.clone(),
                system_prompt: attempt_system_prompt,
                history: history.clone(),
                max_turns: task.max_turns,
                authorizer: Arc::new(TaskAuthorizer {
                    policy: self.policy.clone(),
                    job_id: job_id.clone(),
                }),
                cancel: cancel.clone(),
            };

            let writer = self.sessions.open_writer(&job_id);
            let stream = match provider.execute(ctx).await {
                Ok(stream) => stream,
                Err(err) => {
                    let info = ErrorInfo::transient(err.to_string());
                    let event = Event::error(&provider_name, err.to_string());
                    writer.append(&event).await;
                    self.emit(&job_id, &event);
                    history.push(event);
                    writer.close().await;
                    return self
                        .handle_failure(
                            provider, task, system_prompt, classification, info, cancel,
                            depth, exclude, history,
                        )
                        .await;
                }
            };

            let mut result_text: Option<String> = None;
            let mut collected_texts: Vec<String> = Vec::new();
            let mut failure: Option<ErrorInfo> = None;
            futures::pin_mut!(stream);

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => {
                        provider.abort(&job_id).await;
                        writer.close().await;
                        self.bus.publish(Envelope::new(
                            "task.cancelled",
                            "pipeline",
                            json!({"jobId": job_id}),
                        ));
                        return Err(PipelineError::Cancelled);
                    }
                    item = stream.next() => item,
                };
                let Some(item) = item else {
                    break;
                };
                let event = match item {
                    Ok(event) => event,
                    Err(err) => {
                        let info = ErrorInfo::transient(err.to_string());
                        let event = Event::error(&provider_name, err.to_string());
                        writer.append(&event).await;
                        self.emit(&job_id, &event);
                        history.push(event);
                        failure = Some(info);
                        break;
                    }
                };

                // Persist before any other observable side effect.
                writer.append(&event).await;
                self.scan_for_leaks(&job_id, &event);
                self.audit_tool_traffic(&job_id, &event);
                self.emit(&job_id, &event);
                history.push(event.clone());

                // Steering rides behind text and tool_result events, persisted
                // and emitted in the same relative order on both channels.
                if matches!(
                    event.kind,
                    EventKind::Text { .. } | EventKind::ToolResult { .. }
                ) {
                    self.inject_steering(&job_id, &writer, &mut history).await;
                }

                match &event.kind {
                    EventKind::Done {
                        text, total_tokens, ..
                    } => {
                        if let Some(tokens) = total_tokens {
                            self.policy.record_token_usage(&job_id, *tokens).await;
                        }
                        if !text.is_empty() {
                            collected_texts.push(text.clone());
                        }
                        result_text = Some(text.clone());
                    }
                    EventKind::Text { text } => {
                        collected_texts.push(text.clone());
                    }
                    EventKind::Error { .. } => {
                        failure = ErrorInfo::from_event(&event.kind);
                        break;
                    }
                    _ => {}
                }
            }

            if let Some(info) = failure {
                writer.close().await;
                return self
                    .handle_failure(
                        provider, task, system_prompt, classification, info, cancel, depth,
                        exclude, history,
                    )
                    .await;
            }

            // Stream finished without a terminal done: synthesize a neutral
            // one so the log always closes a task.
            if result_text.is_none() {
                let done = Event::done("system", "");
                writer.append(&done).await;
                self.emit(&job_id, &done);
                history.push(done);
                result_text = Some(String::new());
            }
            writer.close().await;

            provider.state().circuit().record_success();
            self.publish_state(&job_id, PipelineState::Done);
            self.bus.publish(Envelope::new(
                "task.completed",
                "pipeline",
                json!({"jobId": job_id, "provider": provider_name}),
            ));
            Ok(TaskOutcome {
                job_id,
                provider: provider_name,
                result_text: result_text.unwrap_or_default(),
                event_count: history.len(),
                collected_texts,
            })
        }
        .boxed()
    }

    /// Shared failover/retry tail for error events and thrown stream errors.
    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        provider: Arc<dyn Provider>,
        task: TaskSpec,
        system_prompt: String,
        classification: TaskClassification,
        info: ErrorInfo,
        cancel: CancellationToken,
        depth: u8,
        mut exclude: Vec<String>,
        history: Vec<Event>,
    ) -> Result<TaskOutcome, PipelineError> {
        let job_id = task.job_id.clone();
        let failed_name = provider.spec().name.clone();

        if depth < MAX_FAILOVER_DEPTH {
            self.publish_state(&job_id, PipelineState::FailingOver);
            if let Some((next, bundle)) = self
                .failover
                .plan(&task, &classification, &history, &provider, &info, &exclude)
                .await
            {
                exclude.push(failed_name.clone());
                self.audit.append(
                    "failover",
                    json!({
                        "job_id": job_id,
                        "from": bundle.from_provider,
                        "to": bundle.to_provider,
                        "depth": depth + 1,
                        "error": info.message,
                    }),
                );
                self.bus.publish(Envelope::new(
                    "task.failover",
                    "pipeline",
                    json!({
                        "jobId": job_id,
                        "from": bundle.from_provider,
                        "to": bundle.to_provider,
                    }),
                ));
                return self
                    .run_on_provider(
                        next,
                        task,
                        system_prompt,
                        classification,
                        Some(bundle),
                        cancel,
                        depth + 1,
                        exclude,
                        history,
                    )
                    .await;
            }
        } else {
            // Depth exhausted: still record the failure against the breaker.
            provider.state().circuit().record_failure();
        }

        self.publish_state(&job_id, PipelineState::Retrying);
        let retry_queued = match self.retry.enqueue(task, &info.message).await {
            Ok(disposition) => {
                self.bus.publish(Envelope::new(
                    "task.retry_enqueued",
                    "pipeline",
                    json!({"jobId": job_id, "disposition": format!("{disposition:?}")}),
                ));
                true
            }
            Err(err) => {
                tracing::error!(%job_id, %err, "retry enqueue failed");
                false
            }
        };
        self.publish_state(&job_id, PipelineState::Failed);
        Err(PipelineError::ProviderFailure {
            info,
            handled: true,
            retry_queued,
        })
    }

    async fn inject_steering(
        &self,
        job_id: &str,
        writer: &BufferedJobWriter,
        history: &mut Vec<Event>,
    ) {
        let messages = match self.steering.poll(job_id).await {
            Ok(messages) => messages,
            Err(err) => {
                tracing::warn!(job_id, %err, "steering poll failed");
                return;
            }
        };
        if messages.is_empty() {
            return;
        }
        self.publish_state(job_id, PipelineState::SteeringCheck);
        for message in messages {
            let event = Event::now(
                "user",
                EventKind::Steering {
                    message: message.message,
                    author: message.author,
                    channel: message.channel,
                },
            );
            writer.append(&event).await;
            self.emit(job_id, &event);
            history.push(event);
        }
        self.publish_state(job_id, PipelineState::Executing);
    }

    fn scan_for_leaks(&self, job_id: &str, event: &Event) {
        let text = match &event.kind {
            EventKind::ToolCall { arguments, .. } => arguments.to_string(),
            EventKind::ToolResult { output, .. } => output.clone(),
            _ => return,
        };
        for hit in leak::scan(&text) {
            if hit.severity == LeakSeverity::High {
                tracing::warn!(job_id, pattern = hit.pattern, "possible credential in tool traffic");
                self.audit.append(
                    "leak_detected",
                    json!({"job_id": job_id, "pattern": hit.pattern, "preview": hit.preview}),
                );
            } else {
                tracing::debug!(job_id, pattern = hit.pattern, "low-confidence leak pattern");
            }
        }
    }

    fn audit_tool_traffic(&self, job_id: &str, event: &Event) {
        match &event.kind {
            EventKind::ToolCall {
                tool, tool_call_id, ..
            } => {
                self.audit.append(
                    "tool_invocation",
                    json!({"job_id": job_id, "tool": tool, "tool_call_id": tool_call_id}),
                );
            }
            EventKind::ToolResult {
                tool,
                tool_call_id,
                is_error,
                ..
            } => {
                self.audit.append(
                    "tool_result",
                    json!({
                        "job_id": job_id,
                        "tool": tool,
                        "tool_call_id": tool_call_id,
                        "is_error": is_error,
                    }),
                );
            }
            _ => {}
        }
    }

    fn emit(&self, job_id: &str, event: &Event) {
        self.bus.publish(Envelope::new(
            "task.event",
            event.source.clone(),
            json!({"jobId": job_id, "event": event}),
        ));
    }

    fn publish_state(&self, job_id: &str, state: PipelineState) {
        self.bus.publish(Envelope::new(
            "task.state",
            "pipeline",
            json!({"jobId": job_id, "state": state}),
        ));
    }

    fn build_system_prompt(&self, memory_context: &str) -> String {
        let mut prompt = self.identity.trim_end().to_string();
        prompt.push_str(
            "\n\nTool use is governed by a policy engine. A denied tool call returns an \
             error result; adapt your approach instead of retrying the same call.",
        );
        if !memory_context.trim().is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(memory_context.trim_end());
        }
        prompt
    }
}
