use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use zora_memory::{MemoryConfig, MemoryManager};
use zora_policy::PolicyEngine;
use zora_providers::{
    build_providers, FsToolRunner, Provider, ProviderRegistry, ScriptedProvider,
};
use zora_types::{Capability, CostTier, Envelope, ProviderSpec, TaskSpec};

use crate::audit::AuditLogger;
use crate::auth_monitor::AuthMonitor;
use crate::config::EngineConfig;
use crate::event_bus::EventBus;
use crate::failover::FailoverController;
use crate::pipeline::{ExecutionPipeline, TaskOutcome};
use crate::retry::RetryQueue;
use crate::router::Router;
use crate::routines::load_routines;
use crate::scheduler::{Scheduler, TaskSubmitter};
use crate::session_store::SessionStore;
use crate::steering::SteeringInbox;

const DEFAULT_IDENTITY: &str = "You are Zora, an autonomous personal AI agent. You complete \
tasks carefully, keep the user informed, and stop when a task is done.";

/// A hook invoked after a task ends; returning a spec submits a follow-up.
pub type TaskEndHook = Arc<dyn Fn(&TaskOutcome) -> Option<TaskSpec> + Send + Sync>;

/// Root owner of the engine: boots and wires every component, exposes
/// `submit_task`, and shuts the process down cleanly.
pub struct Orchestrator {
    base_dir: PathBuf,
    config: EngineConfig,
    registry: ProviderRegistry,
    policy: Arc<PolicyEngine>,
    memory: Arc<MemoryManager>,
    sessions: Arc<SessionStore>,
    steering: Arc<SteeringInbox>,
    retry: Arc<RetryQueue>,
    bus: EventBus,
    audit: AuditLogger,
    pipeline: Arc<ExecutionPipeline>,
    auth_monitor: Arc<AuthMonitor>,
    scheduler: tokio::sync::Mutex<Option<Scheduler>>,
    root_cancel: CancellationToken,
    started_at: DateTime<Utc>,
    tasks: Arc<tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>>,
    shutting_down: AtomicBool,
    hooks: std::sync::RwLock<Vec<TaskEndHook>>,
}

impl Orchestrator {
    pub async fn boot(base_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&base_dir).await?;

        let policy = Arc::new(PolicyEngine::load(base_dir.join("policy.toml"))?);
        let audit = AuditLogger::open(base_dir.join("audit.jsonl")).await?;
        policy.set_audit_sink(Arc::new(audit.clone())).await;

        let memory = Arc::new(
            MemoryManager::new(
                base_dir.join("memory"),
                MemoryConfig {
                    consolidation_days: config.memory.consolidation_days,
                    extraction_enabled: config.memory.extraction_enabled,
                    ..MemoryConfig::default()
                },
            )
            .await?,
        );

        let mut providers = build_providers(&config.providers, config.circuit.breaker());
        if providers.is_empty() {
            tracing::warn!("no providers configured; falling back to the local scripted provider");
            providers.push(Arc::new(
                ScriptedProvider::new(
                    ProviderSpec::new("local", 99, CostTier::Free).with_capabilities([
                        Capability::Reasoning,
                        Capability::Coding,
                        Capability::Creative,
                        Capability::StructuredData,
                        Capability::Search,
                        Capability::Fast,
                    ]),
                    config.circuit.breaker(),
                )
                .with_runner(Arc::new(FsToolRunner)),
            ));
        }
        let registry = ProviderRegistry::new(providers);

        let router = Arc::new(Router::new(config.routing.mode.clone()));
        let failover = Arc::new(FailoverController::new(
            registry.clone(),
            router.clone(),
            config.routing.max_handoff_context_tokens,
        ));

        let sessions = Arc::new(SessionStore::new(&base_dir).await?);
        let steering = Arc::new(SteeringInbox::new(&base_dir).await?);
        let retry = Arc::new(RetryQueue::open(&base_dir, config.retry.clone()).await?);
        let bus = EventBus::new();
        let auth_monitor = Arc::new(AuthMonitor::new(
            registry.clone(),
            bus.clone(),
            config.auth.warn_before_expiry_minutes,
        ));

        let identity = load_identity(&base_dir).await;
        let pipeline = Arc::new(ExecutionPipeline::new(
            registry.clone(),
            router,
            failover,
            policy.clone(),
            memory.clone(),
            sessions.clone(),
            steering.clone(),
            retry.clone(),
            bus.clone(),
            audit.clone(),
            identity,
        ));

        Ok(Arc::new(Self {
            base_dir,
            config,
            registry,
            policy,
            memory,
            sessions,
            steering,
            retry,
            bus,
            audit,
            pipeline,
            auth_monitor,
            scheduler: tokio::sync::Mutex::new(None),
            root_cancel: CancellationToken::new(),
            started_at: Utc::now(),
            tasks: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
            hooks: std::sync::RwLock::new(Vec::new()),
        }))
    }

    /// Accept a task and run it on its own logical task. Returns the job id
    /// immediately; progress streams over the event bus.
    pub async fn submit_task(self: &Arc<Self>, task: TaskSpec) -> anyhow::Result<String> {
        if self.shutting_down.load(Ordering::SeqCst) {
            anyhow::bail!("engine is shutting down");
        }
        if task.prompt.trim().is_empty() {
            anyhow::bail!("empty prompt");
        }
        let job_id = task.job_id.clone();
        self.bus.publish(Envelope::new(
            "task.submitted",
            "orchestrator",
            json!({"jobId": job_id, "prompt_chars": task.prompt.len()}),
        ));

        let cancel = self.root_cancel.child_token();
        if self.config.task.default_timeout_secs > 0 {
            let watchdog = cancel.clone();
            let timeout = Duration::from_secs(self.config.task.default_timeout_secs);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                watchdog.cancel();
            });
        }

        let this = self.clone();
        let spawned_job = job_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = this.pipeline.run(task, cancel).await;
            if let Ok(outcome) = &outcome {
                let follow_ups: Vec<TaskSpec> = {
                    let hooks = this.hooks.read().expect("hooks lock");
                    hooks.iter().filter_map(|hook| hook(outcome)).collect()
                };
                for follow_up in follow_ups {
                    if let Err(err) = this.clone().submit_task_boxed(follow_up).await {
                        tracing::warn!(%err, "follow-up submission failed");
                    }
                }
            }
            this.tasks.lock().await.remove(&spawned_job);
        });
        self.tasks.lock().await.insert(job_id.clone(), handle);
        Ok(job_id)
    }

    /// Type-erased submit used where the future must not name its own type
    /// (follow-up submission from inside a running task).
    fn submit_task_boxed(
        self: Arc<Self>,
        task: TaskSpec,
    ) -> futures::future::BoxFuture<'static, anyhow::Result<String>> {
        async move { self.submit_task(task).await }.boxed()
    }

    pub fn add_task_end_hook(&self, hook: TaskEndHook) {
        self.hooks.write().expect("hooks lock").push(hook);
    }

    /// Wire up and start the background sweeps. The scheduler receives a
    /// task-submitter function value, never an orchestrator reference.
    pub async fn start_scheduler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let submitter: TaskSubmitter = Arc::new(move |task: TaskSpec| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(orchestrator) => orchestrator.submit_task(task).await,
                    None => anyhow::bail!("engine stopped"),
                }
            }
            .boxed()
        });

        let routines = load_routines(&self.base_dir.join("routines"));
        if !routines.is_empty() {
            tracing::info!(count = routines.len(), "routines loaded");
        }
        let scheduler = Scheduler::new(
            submitter,
            self.retry.clone(),
            self.auth_monitor.clone(),
            self.memory.clone(),
            routines,
            self.config.scheduler.clone(),
            self.root_cancel.child_token(),
        );
        scheduler.start();
        *self.scheduler.lock().await = Some(scheduler);
    }

    /// Stop accepting work, cancel all timers, and let in-flight tasks
    /// complete or abort through the root cancellation signal.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("engine shutting down");
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop().await;
        }
        self.root_cancel.cancel();
        let handles = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().collect::<Vec<_>>()
        };
        for (job_id, handle) in handles {
            if let Err(err) = handle.await {
                tracing::warn!(%job_id, %err, "task join failed during shutdown");
            }
        }
        self.audit.flush().await;
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        self.registry.all()
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn steering(&self) -> &Arc<SteeringInbox> {
        &self.steering
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Wait for a specific job's task to finish; tests and the one-shot CLI
    /// path use this.
    pub async fn wait_for(&self, job_id: &str) {
        let handle = self.tasks.lock().await.remove(job_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn load_identity(base_dir: &Path) -> String {
    match tokio::fs::read_to_string(base_dir.join("SOUL.md")).await {
        Ok(content) if !content.trim().is_empty() => content,
        _ => DEFAULT_IDENTITY.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zora_providers::{AdapterConfig, ProviderConfig};
    use zora_types::EventKind;

    async fn scripted_orchestrator(dir: &Path) -> Arc<Orchestrator> {
        let config = EngineConfig {
            providers: vec![ProviderConfig {
                spec: ProviderSpec::new("provider-a", 1, CostTier::Free).with_capabilities([
                    Capability::Coding,
                    Capability::Reasoning,
                ]),
                adapter: AdapterConfig::Scripted,
            }],
            ..EngineConfig::default()
        };
        Orchestrator::boot(dir.to_path_buf(), config)
            .await
            .expect("boot")
    }

    #[tokio::test]
    async fn submit_task_runs_to_done_and_persists_the_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orchestrator = scripted_orchestrator(dir.path()).await;
        let job_id = orchestrator
            .submit_task(TaskSpec::new("say hello"))
            .await
            .expect("submit");
        orchestrator.wait_for(&job_id).await;

        let events = orchestrator.sessions().read(&job_id).await.expect("read");
        assert!(!events.is_empty());
        assert!(matches!(
            events.last().expect("last").kind,
            EventKind::Done { .. }
        ));
    }

    #[tokio::test]
    async fn emitted_event_sequence_matches_the_persisted_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orchestrator = scripted_orchestrator(dir.path()).await;
        let mut rx = orchestrator.event_bus().subscribe();

        let job_id = orchestrator
            .submit_task(TaskSpec::new("say hello"))
            .await
            .expect("submit");
        orchestrator.wait_for(&job_id).await;

        let mut emitted = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if envelope.event_type == "task.event" {
                let event: zora_types::Event =
                    serde_json::from_value(envelope.data["event"].clone()).expect("event");
                emitted.push(event);
            }
        }
        let persisted = orchestrator.sessions().read(&job_id).await.expect("read");
        assert_eq!(emitted.len(), persisted.len());
        for (a, b) in emitted.iter().zip(persisted.iter()) {
            assert_eq!(a.kind, b.kind);
        }
    }

    #[tokio::test]
    async fn shutdown_rejects_new_tasks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orchestrator = scripted_orchestrator(dir.path()).await;
        orchestrator.shutdown().await;
        let result = orchestrator.submit_task(TaskSpec::new("too late")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn task_end_hooks_submit_follow_ups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orchestrator = scripted_orchestrator(dir.path()).await;
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let hook_fired = fired.clone();
        orchestrator.add_task_end_hook(Arc::new(move |outcome: &TaskOutcome| {
            if !hook_fired.swap(true, Ordering::SeqCst) && outcome.result_text.contains("hello") {
                Some(TaskSpec::new("follow-up task"))
            } else {
                None
            }
        }));

        let job_id = orchestrator
            .submit_task(TaskSpec::new("hello"))
            .await
            .expect("submit");
        orchestrator.wait_for(&job_id).await;
        // Give the follow-up a moment to register and run.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(fired.load(Ordering::SeqCst));
        let sessions = orchestrator.sessions().list().await.expect("list");
        assert!(sessions.len() >= 2);
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orchestrator = scripted_orchestrator(dir.path()).await;
        assert!(orchestrator.submit_task(TaskSpec::new("   ")).await.is_err());
    }

    #[tokio::test]
    async fn soul_file_overrides_the_default_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("SOUL.md"), "You are Test Zora.").expect("write");
        let identity = load_identity(dir.path()).await;
        assert_eq!(identity, "You are Test Zora.");
        let missing = load_identity(&dir.path().join("nope")).await;
        assert!(missing.contains("autonomous personal AI agent"));
    }
}
