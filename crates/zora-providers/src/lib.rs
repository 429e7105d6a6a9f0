use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use zora_types::{AuthStatus, Event, EventKind, ProviderSpec, QuotaStatus, UsageTotals};

mod circuit;
mod http;
mod scripted;
mod subprocess;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use http::{HttpAdapterConfig, HttpProvider};
pub use scripted::{FsToolRunner, ScriptStep, ScriptedProvider, ToolRunner};
pub use subprocess::{CliAdapterConfig, CliProvider, STDOUT_BUFFER_CAP};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<Event>> + Send>>;

const AUTH_CACHE_TTL: Duration = Duration::from_secs(60);

/// Verdict handed back through the authorizer seam before a provider runs a
/// tool it initiated.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDecision {
    Allow { updated_input: Option<Value> },
    Deny { reason: String },
}

/// The policy check travels as an explicit handle on the task context;
/// providers invoke it through this trait before every tool call.
#[async_trait]
pub trait ToolAuthorizer: Send + Sync {
    async fn authorize(&self, tool: &str, input: &Value) -> ToolDecision;
}

/// Authorizer that lets everything through; test scaffolding and the
/// heartbeat self-check use it.
pub struct AllowAll;

#[async_trait]
impl ToolAuthorizer for AllowAll {
    async fn authorize(&self, _tool: &str, _input: &Value) -> ToolDecision {
        ToolDecision::Allow {
            updated_input: None,
        }
    }
}

/// Everything a provider needs to run one task.
#[derive(Clone)]
pub struct TaskContext {
    pub job_id: String,
    pub prompt: String,
    pub system_prompt: String,
    pub history: Vec<Event>,
    pub max_turns: Option<u32>,
    pub authorizer: Arc<dyn ToolAuthorizer>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(job_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            prompt: prompt.into(),
            system_prompt: String::new(),
            history: Vec::new(),
            max_turns: None,
            authorizer: Arc::new(AllowAll),
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Default)]
struct QuotaInner {
    cooldown_until: Option<DateTime<Utc>>,
    remaining_requests: Option<u64>,
}

/// Evolving per-provider state shared by every adapter: circuit breaker,
/// cached auth, quota cooldowns, usage counters and the active-jobs map that
/// backs `abort`.
pub struct ProviderState {
    circuit: CircuitBreaker,
    auth_cache: RwLock<Option<(Instant, AuthStatus)>>,
    auth_poisoned: AtomicBool,
    quota: RwLock<QuotaInner>,
    usage: RwLock<UsageTotals>,
    active_jobs: RwLock<HashMap<String, CancellationToken>>,
}

impl ProviderState {
    pub fn new(breaker: CircuitBreakerConfig) -> Self {
        Self {
            circuit: CircuitBreaker::new(breaker),
            auth_cache: RwLock::new(None),
            auth_poisoned: AtomicBool::new(false),
            quota: RwLock::new(QuotaInner::default()),
            usage: RwLock::new(UsageTotals::default()),
            active_jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Drop the cached auth status so the next check re-probes.
    pub fn poison_auth(&self) {
        self.auth_poisoned.store(true, Ordering::SeqCst);
    }

    pub async fn set_quota_cooldown(&self, until: DateTime<Utc>) {
        self.quota.write().await.cooldown_until = Some(until);
    }

    pub async fn set_remaining_requests(&self, remaining: Option<u64>) {
        self.quota.write().await.remaining_requests = remaining;
    }

    pub async fn quota_status(&self) -> QuotaStatus {
        let quota = self.quota.read().await;
        let exhausted = quota
            .cooldown_until
            .map(|until| Utc::now() < until)
            .unwrap_or(false);
        QuotaStatus {
            is_exhausted: exhausted,
            remaining_requests: quota.remaining_requests,
            cooldown_until: quota.cooldown_until,
            health_score: self.circuit.health_score(),
        }
    }

    pub async fn usage(&self) -> UsageTotals {
        self.usage.read().await.clone()
    }

    pub async fn record_request(&self, cost_usd: f64, input_tokens: u64, output_tokens: u64) {
        let mut usage = self.usage.write().await;
        usage.total_cost_usd += cost_usd;
        usage.total_input_tokens += input_tokens;
        usage.total_output_tokens += output_tokens;
        usage.request_count += 1;
        usage.last_request_at = Some(Utc::now());
    }

    pub async fn register_job(&self, job_id: &str, token: CancellationToken) {
        self.active_jobs
            .write()
            .await
            .insert(job_id.to_string(), token);
    }

    pub async fn finish_job(&self, job_id: &str) {
        self.active_jobs.write().await.remove(job_id);
    }

    /// Idempotent; a no-op for unknown jobs.
    pub async fn abort_job(&self, job_id: &str) {
        if let Some(token) = self.active_jobs.write().await.remove(job_id) {
            token.cancel();
        }
    }

    async fn cached_auth(&self) -> Option<AuthStatus> {
        if self.auth_poisoned.swap(false, Ordering::SeqCst) {
            *self.auth_cache.write().await = None;
            return None;
        }
        let cache = self.auth_cache.read().await;
        cache.as_ref().and_then(|(at, status)| {
            (at.elapsed() < AUTH_CACHE_TTL).then(|| status.clone())
        })
    }

    async fn store_auth(&self, status: AuthStatus) {
        *self.auth_cache.write().await = Some((Instant::now(), status));
    }
}

/// Adapter to one LLM backend. Adapters implement `probe_auth` and
/// `open_stream`; availability, auth caching, quota, usage and abort share
/// the provided implementations over `ProviderState`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn spec(&self) -> &ProviderSpec;
    fn state(&self) -> &Arc<ProviderState>;

    /// Uncached auth check against the backend.
    async fn probe_auth(&self) -> AuthStatus;

    /// Open the raw event stream for a task. The default `execute` wraps
    /// this with circuit-breaker short-circuiting and abort registration.
    async fn open_stream(&self, ctx: TaskContext) -> anyhow::Result<EventStream>;

    /// Enabled, circuit not open, last known auth valid.
    async fn is_available(&self) -> bool {
        if !self.spec().enabled || self.state().circuit.is_open() {
            return false;
        }
        self.check_auth().await.valid
    }

    /// Auth status, cached for up to 60 seconds.
    async fn check_auth(&self) -> AuthStatus {
        if let Some(cached) = self.state().cached_auth().await {
            return cached;
        }
        let status = self.probe_auth().await;
        self.state().store_auth(status.clone()).await;
        status
    }

    async fn get_quota_status(&self) -> QuotaStatus {
        self.state().quota_status().await
    }

    async fn get_usage(&self) -> UsageTotals {
        self.state().usage().await
    }

    /// Produce the finite, single-use event stream for a task. A provider
    /// with an open circuit short-circuits with a terminal error event
    /// carrying `is_circuit_open`.
    async fn execute(&self, mut ctx: TaskContext) -> anyhow::Result<EventStream> {
        let name = self.spec().name.clone();
        let state = self.state().clone();
        if state.circuit.is_open() {
            let event = Event::now(
                name,
                EventKind::Error {
                    message: "circuit breaker open".to_string(),
                    is_auth_error: false,
                    is_quota_error: false,
                    is_circuit_open: true,
                },
            );
            return Ok(Box::pin(futures::stream::iter(vec![Ok(event)])));
        }

        let job_id = ctx.job_id.clone();
        let job_token = ctx.cancel.child_token();
        state.register_job(&job_id, job_token.clone()).await;
        ctx.cancel = job_token;

        let inner = match self.open_stream(ctx).await {
            Ok(inner) => inner,
            Err(err) => {
                state.finish_job(&job_id).await;
                return Err(err);
            }
        };

        let wrapped = stream! {
            futures::pin_mut!(inner);
            while let Some(event) = inner.next().await {
                yield event;
            }
            state.finish_job(&job_id).await;
        };
        Ok(Box::pin(wrapped))
    }

    /// Idempotent abort of a running job; no-op when unknown.
    async fn abort(&self, job_id: &str) {
        self.state().abort_job(job_id).await;
    }
}

/// Immutable set of configured providers, sorted by rank at boot.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new(mut providers: Vec<Arc<dyn Provider>>) -> Self {
        providers.sort_by_key(|p| p.spec().rank);
        Self { providers }
    }

    pub fn all(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.spec().name == name)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Declarative provider configuration, one entry per backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    #[serde(flatten)]
    pub spec: ProviderSpec,
    pub adapter: AdapterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    OpenaiCompatible {
        base_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key_env: Option<String>,
        model: String,
    },
    Cli {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Scripted,
}

pub fn build_providers(
    configs: &[ProviderConfig],
    breaker: CircuitBreakerConfig,
) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    for config in configs {
        match &config.adapter {
            AdapterConfig::OpenaiCompatible {
                base_url,
                api_key,
                api_key_env,
                model,
            } => {
                let key = api_key
                    .clone()
                    .filter(|k| !is_placeholder_api_key(k))
                    .or_else(|| {
                        api_key_env.as_deref().and_then(|name| {
                            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
                        })
                    });
                providers.push(Arc::new(HttpProvider::new(
                    config.spec.clone(),
                    HttpAdapterConfig {
                        base_url: base_url.clone(),
                        api_key: key,
                        model: model.clone(),
                    },
                    breaker,
                )));
            }
            AdapterConfig::Cli { command, args } => {
                providers.push(Arc::new(CliProvider::new(
                    config.spec.clone(),
                    CliAdapterConfig {
                        command: command.clone(),
                        args: args.clone(),
                    },
                    breaker,
                )));
            }
            AdapterConfig::Scripted => {
                providers.push(Arc::new(ScriptedProvider::new(config.spec.clone(), breaker)));
            }
        }
    }
    providers
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}
