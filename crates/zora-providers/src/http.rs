use std::str;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use zora_types::{AuthStatus, Event, EventKind, ProviderSpec};

use crate::{CircuitBreakerConfig, EventStream, Provider, ProviderState, TaskContext};

#[derive(Debug, Clone)]
pub struct HttpAdapterConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

/// Adapter for OpenAI-compatible chat-completions backends, streamed over
/// SSE. Tool calls the model emits surface as events; executing them is the
/// caller's concern.
pub struct HttpProvider {
    spec: ProviderSpec,
    config: HttpAdapterConfig,
    state: Arc<ProviderState>,
    client: Client,
}

impl HttpProvider {
    pub fn new(spec: ProviderSpec, config: HttpAdapterConfig, breaker: CircuitBreakerConfig) -> Self {
        Self {
            spec,
            config: HttpAdapterConfig {
                base_url: normalize_base(&config.base_url),
                ..config
            },
            state: Arc::new(ProviderState::new(breaker)),
            client: Client::new(),
        }
    }

    fn wire_messages(&self, ctx: &TaskContext) -> Vec<Value> {
        let mut messages = Vec::new();
        if !ctx.system_prompt.trim().is_empty() {
            messages.push(json!({"role": "system", "content": ctx.system_prompt}));
        }
        for event in &ctx.history {
            match &event.kind {
                EventKind::Text { text } => {
                    messages.push(json!({"role": "assistant", "content": text}));
                }
                EventKind::Steering { message, author, .. } => {
                    messages.push(json!({
                        "role": "user",
                        "content": format!("[steering from {author}] {message}"),
                    }));
                }
                _ => {}
            }
        }
        messages.push(json!({"role": "user", "content": ctx.prompt}));
        messages
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    fn state(&self) -> &Arc<ProviderState> {
        &self.state
    }

    async fn probe_auth(&self) -> AuthStatus {
        if self.config.api_key.is_none() {
            return AuthStatus::invalid();
        }
        let url = format!("{}/models", self.config.base_url);
        let mut req = self.client.get(url);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => AuthStatus::valid(),
            Ok(resp)
                if resp.status() == reqwest::StatusCode::UNAUTHORIZED
                    || resp.status() == reqwest::StatusCode::FORBIDDEN =>
            {
                AuthStatus::invalid()
            }
            // The endpoint exists but answered oddly; the key itself may be
            // fine, so do not lock the provider out.
            Ok(_) => AuthStatus::valid(),
            Err(_) => AuthStatus {
                valid: false,
                expires_at: None,
                can_auto_refresh: true,
                requires_interaction: false,
            },
        }
    }

    async fn open_stream(&self, ctx: TaskContext) -> anyhow::Result<EventStream> {
        let source = self.spec.name.clone();
        let state = self.state.clone();
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = json!({
            "model": self.config.model,
            "messages": self.wire_messages(&ctx),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        let mut req = self.client.post(url).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let event = Event::now(
                &source,
                EventKind::Error {
                    message: format!(
                        "provider request failed with status {status}: {}",
                        truncate(&text, 500)
                    ),
                    is_auth_error: status == reqwest::StatusCode::UNAUTHORIZED
                        || status == reqwest::StatusCode::FORBIDDEN,
                    is_quota_error: status == reqwest::StatusCode::TOO_MANY_REQUESTS,
                    is_circuit_open: false,
                },
            );
            return Ok(Box::pin(futures::stream::iter(vec![Ok(event)])));
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            let mut full_text = String::new();
            let mut tool_calls: std::collections::HashMap<String, (String, String)> =
                std::collections::HashMap::new();
            let mut usage_tokens: Option<u64> = None;

            'outer: while let Some(chunk) = bytes.next().await {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        let Some(payload) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let payload = payload.trim();
                        if payload == "[DONE]" {
                            break 'outer;
                        }
                        let Ok(value) = serde_json::from_str::<Value>(payload) else {
                            continue;
                        };
                        if let Some(tokens) = value
                            .get("usage")
                            .and_then(|u| u.get("total_tokens"))
                            .and_then(|v| v.as_u64())
                        {
                            usage_tokens = Some(tokens);
                        }
                        let choices = value
                            .get("choices")
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default();
                        for choice in choices {
                            let delta = choice.get("delta").cloned().unwrap_or_default();
                            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                                if !text.is_empty() {
                                    full_text.push_str(text);
                                    yield Event::now(&source, EventKind::Text {
                                        text: text.to_string(),
                                    });
                                }
                            }
                            if let Some(reasoning) =
                                delta.get("reasoning_content").and_then(|v| v.as_str())
                            {
                                if !reasoning.is_empty() {
                                    yield Event::now(&source, EventKind::Thinking {
                                        text: reasoning.to_string(),
                                    });
                                }
                            }
                            if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                                for call in calls {
                                    let id = call
                                        .get("id")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string();
                                    if id.is_empty() {
                                        continue;
                                    }
                                    let function =
                                        call.get("function").cloned().unwrap_or_default();
                                    let entry = tool_calls.entry(id).or_default();
                                    if let Some(name) =
                                        function.get("name").and_then(|v| v.as_str())
                                    {
                                        entry.0 = name.to_string();
                                    }
                                    if let Some(args) =
                                        function.get("arguments").and_then(|v| v.as_str())
                                    {
                                        entry.1.push_str(args);
                                    }
                                }
                            }
                            if let Some(reason) =
                                choice.get("finish_reason").and_then(|v| v.as_str())
                            {
                                if reason == "tool_calls" {
                                    for (id, (name, args)) in tool_calls.drain() {
                                        let arguments = serde_json::from_str::<Value>(&args)
                                            .unwrap_or(Value::String(args));
                                        yield Event::now(&source, EventKind::ToolCall {
                                            tool_call_id: id,
                                            tool: name,
                                            arguments,
                                        });
                                    }
                                }
                            }
                        }
                    }
                }
            }

            if !ctx.cancel.is_cancelled() {
                state
                    .record_request(0.0, 0, usage_tokens.unwrap_or(0))
                    .await;
                yield Event::now(&source, EventKind::Done {
                    text: full_text,
                    total_cost_usd: None,
                    num_turns: Some(1),
                    total_tokens: usage_tokens,
                });
            }
        };
        Ok(Box::pin(stream))
    }
}

fn normalize_base(input: &str) -> String {
    let trimmed = input.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

fn truncate(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut cut = max_len;
        while !input.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &input[..cut])
    }
}
