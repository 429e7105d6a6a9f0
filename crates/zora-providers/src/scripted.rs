use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use zora_types::{AuthStatus, Event, EventKind, ProviderSpec};

use crate::{
    CircuitBreakerConfig, EventStream, Provider, ProviderState, TaskContext, ToolDecision,
};

/// One step of a scripted run.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Thinking(String),
    Text(String),
    /// Emits a tool_call, consults the authorizer, runs the tool on allow,
    /// then emits the matching tool_result.
    ToolCall { tool: String, arguments: Value },
    Error {
        message: String,
        is_auth_error: bool,
        is_quota_error: bool,
    },
    Done(String),
}

/// Executes an allowed tool call locally. The reference runner handles the
/// file tools; anything else reports unsupported.
pub trait ToolRunner: Send + Sync {
    fn run(&self, tool: &str, arguments: &Value) -> anyhow::Result<String>;
}

/// Local filesystem tool runner backing the scripted provider and the
/// heartbeat self-check.
pub struct FsToolRunner;

impl ToolRunner for FsToolRunner {
    fn run(&self, tool: &str, arguments: &Value) -> anyhow::Result<String> {
        match tool {
            "Write" => {
                let path = arguments
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("Write requires file_path"))?;
                let content = arguments
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if let Some(parent) = Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, content)?;
                Ok(format!("wrote {} bytes to {path}", content.len()))
            }
            "Read" => {
                let path = arguments
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("Read requires file_path"))?;
                Ok(std::fs::read_to_string(path)?)
            }
            other => Err(anyhow::anyhow!("tool `{other}` is not supported locally")),
        }
    }
}

/// In-process provider driven by queued scripts. One script is consumed per
/// `execute`; with the queue empty it echoes the prompt and finishes. Tests
/// and the heartbeat routine run on it.
pub struct ScriptedProvider {
    spec: ProviderSpec,
    state: Arc<ProviderState>,
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    auth: RwLock<AuthStatus>,
    runner: Option<Arc<dyn ToolRunner>>,
}

impl ScriptedProvider {
    pub fn new(spec: ProviderSpec, breaker: CircuitBreakerConfig) -> Self {
        Self {
            spec,
            state: Arc::new(ProviderState::new(breaker)),
            scripts: Mutex::new(VecDeque::new()),
            auth: RwLock::new(AuthStatus::valid()),
            runner: None,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub async fn push_script(&self, steps: Vec<ScriptStep>) {
        self.scripts.lock().await.push_back(steps);
    }

    pub async fn set_auth(&self, status: AuthStatus) {
        *self.auth.write().await = status;
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    fn state(&self) -> &Arc<ProviderState> {
        &self.state
    }

    async fn probe_auth(&self) -> AuthStatus {
        self.auth.read().await.clone()
    }

    async fn open_stream(&self, ctx: TaskContext) -> anyhow::Result<EventStream> {
        let steps = self.scripts.lock().await.pop_front().unwrap_or_else(|| {
            vec![
                ScriptStep::Text(format!("ack: {}", ctx.prompt)),
                ScriptStep::Done(format!("ack: {}", ctx.prompt)),
            ]
        });
        let source = self.spec.name.clone();
        let runner = self.runner.clone();
        let state = self.state.clone();

        let stream = try_stream! {
            let mut turns = 0u32;
            for step in steps {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                match step {
                    ScriptStep::Thinking(text) => {
                        yield Event::now(&source, EventKind::Thinking { text });
                    }
                    ScriptStep::Text(text) => {
                        yield Event::now(&source, EventKind::Text { text });
                    }
                    ScriptStep::ToolCall { tool, arguments } => {
                        turns += 1;
                        let tool_call_id = format!("call-{}", Uuid::new_v4());
                        yield Event::now(&source, EventKind::ToolCall {
                            tool_call_id: tool_call_id.clone(),
                            tool: tool.clone(),
                            arguments: arguments.clone(),
                        });
                        let decision = ctx.authorizer.authorize(&tool, &arguments).await;
                        let (output, is_error) = match decision {
                            ToolDecision::Deny { reason } => (reason, true),
                            ToolDecision::Allow { updated_input } => {
                                let effective = updated_input.unwrap_or(arguments);
                                match &runner {
                                    None => ("ok".to_string(), false),
                                    Some(runner) => match runner.run(&tool, &effective) {
                                        Ok(output) => (output, false),
                                        Err(err) => (err.to_string(), true),
                                    },
                                }
                            }
                        };
                        yield Event::now(&source, EventKind::ToolResult {
                            tool_call_id,
                            tool,
                            output,
                            is_error,
                        });
                    }
                    ScriptStep::Error { message, is_auth_error, is_quota_error } => {
                        yield Event::now(&source, EventKind::Error {
                            message,
                            is_auth_error,
                            is_quota_error,
                            is_circuit_open: false,
                        });
                        return;
                    }
                    ScriptStep::Done(text) => {
                        state.record_request(0.0, 0, 0).await;
                        yield Event::now(&source, EventKind::Done {
                            text,
                            total_cost_usd: Some(0.0),
                            num_turns: Some(turns.max(1)),
                            total_tokens: None,
                        });
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use zora_types::CostTier;

    struct DenyWrites;

    #[async_trait]
    impl crate::ToolAuthorizer for DenyWrites {
        async fn authorize(&self, tool: &str, _input: &Value) -> ToolDecision {
            if tool == "Write" {
                ToolDecision::Deny {
                    reason: "writes are off".to_string(),
                }
            } else {
                ToolDecision::Allow {
                    updated_input: None,
                }
            }
        }
    }

    fn provider() -> ScriptedProvider {
        ScriptedProvider::new(
            ProviderSpec::new("scripted", 1, CostTier::Free),
            CircuitBreakerConfig::default(),
        )
        .with_runner(Arc::new(FsToolRunner))
    }

    async fn collect(stream: EventStream) -> Vec<Event> {
        stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|e| e.expect("event"))
            .collect()
    }

    #[tokio::test]
    async fn scripted_tool_call_executes_after_authorization() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("a.txt");
        let provider = provider();
        provider
            .push_script(vec![
                ScriptStep::ToolCall {
                    tool: "Write".to_string(),
                    arguments: json!({"file_path": target.to_str().unwrap(), "content": "hello"}),
                },
                ScriptStep::Done("written".to_string()),
            ])
            .await;

        let events = collect(
            provider
                .execute(TaskContext::new("job-1", "write hello"))
                .await
                .expect("execute"),
        )
        .await;

        assert_eq!(std::fs::read_to_string(&target).expect("file"), "hello");
        let kinds: Vec<_> = events.iter().map(|e| e.kind_label()).collect();
        assert_eq!(kinds, vec!["tool_call", "tool_result", "done"]);
    }

    #[tokio::test]
    async fn denied_tool_call_becomes_an_error_result_not_an_execution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("a.txt");
        let provider = provider();
        provider
            .push_script(vec![
                ScriptStep::ToolCall {
                    tool: "Write".to_string(),
                    arguments: json!({"file_path": target.to_str().unwrap(), "content": "hello"}),
                },
                ScriptStep::Done("finished without writing".to_string()),
            ])
            .await;

        let mut ctx = TaskContext::new("job-1", "write hello");
        ctx.authorizer = Arc::new(DenyWrites);
        let events = collect(provider.execute(ctx).await.expect("execute")).await;

        assert!(!target.exists());
        let result = events
            .iter()
            .find(|e| e.kind_label() == "tool_result")
            .expect("tool_result");
        match &result.kind {
            EventKind::ToolResult { is_error, output, .. } => {
                assert!(is_error);
                assert!(output.contains("writes are off"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(events.last().expect("last").kind_label(), "done");
    }

    #[tokio::test]
    async fn cancellation_stops_the_script_short() {
        let provider = provider();
        provider
            .push_script(vec![
                ScriptStep::Text("first".to_string()),
                ScriptStep::Done("never reached".to_string()),
            ])
            .await;
        let ctx = TaskContext::new("job-1", "hello");
        ctx.cancel.cancel();
        let events = collect(provider.execute(ctx).await.expect("execute")).await;
        assert!(events.is_empty());
    }
}
