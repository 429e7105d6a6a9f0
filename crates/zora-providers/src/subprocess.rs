use std::process::Stdio;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use zora_types::{AuthStatus, Event, EventKind, ProviderSpec};

use crate::{
    CircuitBreakerConfig, EventStream, Provider, ProviderState, TaskContext, ToolDecision,
};

/// Hard cap on accumulated stdout parsing. A runaway child cannot grow the
/// engine's memory without bound; truncation surfaces as a warning event.
pub const STDOUT_BUFFER_CAP: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CliAdapterConfig {
    pub command: String,
    pub args: Vec<String>,
}

/// Adapter for CLI agent backends. The child receives one JSON request line
/// on stdin and emits newline-delimited Event records on stdout. Tool calls
/// it initiates are routed through the authorizer; the verdict goes back to
/// the child as a JSON line before it may proceed.
pub struct CliProvider {
    spec: ProviderSpec,
    config: CliAdapterConfig,
    state: Arc<ProviderState>,
}

impl CliProvider {
    pub fn new(spec: ProviderSpec, config: CliAdapterConfig, breaker: CircuitBreakerConfig) -> Self {
        Self {
            spec,
            config,
            state: Arc::new(ProviderState::new(breaker)),
        }
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    fn state(&self) -> &Arc<ProviderState> {
        &self.state
    }

    async fn probe_auth(&self) -> AuthStatus {
        // The binary being present is the best local signal; a missing or
        // broken install needs the user.
        match which(&self.config.command) {
            true => AuthStatus::valid(),
            false => AuthStatus::invalid(),
        }
    }

    async fn open_stream(&self, ctx: TaskContext) -> anyhow::Result<EventStream> {
        let source = self.spec.name.clone();
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdout unavailable"))?;

        let request = json!({
            "job_id": ctx.job_id,
            "prompt": ctx.prompt,
            "system_prompt": ctx.system_prompt,
            "max_turns": ctx.max_turns,
        });
        stdin
            .write_all(format!("{request}\n").as_bytes())
            .await?;
        stdin.flush().await?;

        let stream = try_stream! {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            let mut consumed = 0usize;

            loop {
                line.clear();
                let read_result = tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        let _ = child.start_kill();
                        None
                    }
                    read = reader.read_line(&mut line) => Some(read),
                };
                let read = match read_result {
                    None => break,
                    Some(r) => r?,
                };
                if read == 0 {
                    break;
                }
                consumed += read;
                if consumed > STDOUT_BUFFER_CAP {
                    let _ = child.start_kill();
                    yield Event::now(&source, EventKind::Text {
                        text: format!(
                            "[warning] provider output truncated at {} bytes",
                            STDOUT_BUFFER_CAP
                        ),
                    });
                    yield Event::now(&source, EventKind::Done {
                        text: String::new(),
                        total_cost_usd: None,
                        num_turns: None,
                        total_tokens: None,
                    });
                    break;
                }

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let event = match serde_json::from_str::<Event>(trimmed) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(provider = %source, %err, "unparsable event line from child");
                        continue;
                    }
                };

                if let EventKind::ToolCall { tool_call_id, tool, arguments } = &event.kind {
                    let decision = ctx.authorizer.authorize(tool, arguments).await;
                    let verdict = match &decision {
                        ToolDecision::Allow { updated_input } => json!({
                            "type": "authorization",
                            "tool_call_id": tool_call_id,
                            "allow": true,
                            "updated_input": updated_input,
                        }),
                        ToolDecision::Deny { reason } => json!({
                            "type": "authorization",
                            "tool_call_id": tool_call_id,
                            "allow": false,
                            "reason": reason,
                        }),
                    };
                    stdin.write_all(format!("{verdict}\n").as_bytes()).await?;
                    stdin.flush().await?;
                }

                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
            let _ = child.wait().await;
        };
        Ok(Box::pin(stream))
    }
}

fn which(command: &str) -> bool {
    if command.contains('/') {
        return std::path::Path::new(command).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(command).exists())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_finds_absolute_paths_and_misses_garbage() {
        assert!(which("/"));
        assert!(!which("definitely-not-a-real-binary-zora"));
    }

    #[test]
    fn stdout_cap_is_fifty_mebibytes() {
        assert_eq!(STDOUT_BUFFER_CAP, 52_428_800);
    }
}
