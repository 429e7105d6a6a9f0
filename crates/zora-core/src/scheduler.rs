use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use zora_memory::MemoryManager;
use zora_types::TaskSpec;

use crate::auth_monitor::AuthMonitor;
use crate::config::SchedulerConfig;
use crate::retry::RetryQueue;
use crate::routines::{RoutineFireGuard, RoutineSpec};

/// Function value injected at construction; the scheduler never owns the
/// orchestrator that implements it.
pub type TaskSubmitter =
    Arc<dyn Fn(TaskSpec) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// Background sweeps on self-rescheduling timers: each iteration finishes
/// before the next tick is armed, so slow sweeps never overlap themselves.
pub struct Scheduler {
    submitter: TaskSubmitter,
    retry: Arc<RetryQueue>,
    auth_monitor: Arc<AuthMonitor>,
    memory: Arc<MemoryManager>,
    routines: Vec<RoutineSpec>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        submitter: TaskSubmitter,
        retry: Arc<RetryQueue>,
        auth_monitor: Arc<AuthMonitor>,
        memory: Arc<MemoryManager>,
        routines: Vec<RoutineSpec>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            submitter,
            retry,
            auth_monitor,
            memory,
            routines,
            config,
            cancel,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let mut handles = self.handles.lock().expect("scheduler handles");

        handles.push(self.spawn_sweep(
            "retry-poll",
            Duration::ZERO,
            Duration::from_secs(self.config.retry_poll_secs.max(1)),
            {
                let retry = self.retry.clone();
                let submitter = self.submitter.clone();
                move || {
                    let retry = retry.clone();
                    let submitter = submitter.clone();
                    async move {
                        run_retry_poll(&retry, &submitter).await;
                    }
                    .boxed()
                }
            },
        ));

        handles.push(self.spawn_sweep(
            "auth-check",
            Duration::ZERO,
            Duration::from_secs(self.config.auth_check_secs.max(1)),
            {
                let monitor = self.auth_monitor.clone();
                move || {
                    let monitor = monitor.clone();
                    async move {
                        let _ = monitor.check_all().await;
                    }
                    .boxed()
                }
            },
        ));

        handles.push(self.spawn_sweep(
            "consolidation",
            Duration::from_secs(self.config.consolidation_initial_secs),
            Duration::from_secs(self.config.consolidation_interval_secs.max(1)),
            {
                let memory = self.memory.clone();
                move || {
                    let memory = memory.clone();
                    async move {
                        match memory.consolidate().await {
                            Ok(report) if report.notes_archived > 0 => {
                                tracing::info!(
                                    notes = report.notes_archived,
                                    items = report.items_created,
                                    "daily notes consolidated"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => tracing::warn!(%err, "consolidation sweep failed"),
                        }
                    }
                    .boxed()
                }
            },
        ));

        if self.config.heartbeat_minutes > 0 {
            handles.push(self.spawn_sweep(
                "heartbeat",
                Duration::from_secs(self.config.heartbeat_minutes * 60),
                Duration::from_secs(self.config.heartbeat_minutes * 60),
                {
                    let submitter = self.submitter.clone();
                    move || {
                        let submitter = submitter.clone();
                        async move {
                            let task = TaskSpec::new(
                                "Run a brief self-check: confirm providers respond and report \
                                 anything that needs attention.",
                            );
                            if let Err(err) = submitter(task).await {
                                tracing::warn!(%err, "heartbeat submission failed");
                            }
                        }
                        .boxed()
                    }
                },
            ));
        }

        if !self.routines.is_empty() {
            let routines = self.routines.clone();
            let submitter = self.submitter.clone();
            let guard = Arc::new(tokio::sync::Mutex::new(RoutineFireGuard::default()));
            handles.push(self.spawn_sweep(
                "routines",
                Duration::ZERO,
                Duration::from_secs(self.config.routine_poll_secs.max(1)),
                move || {
                    let routines = routines.clone();
                    let submitter = submitter.clone();
                    let guard = guard.clone();
                    async move {
                        let now = Utc::now();
                        let mut guard = guard.lock().await;
                        for routine in &routines {
                            if !guard.should_fire(routine, now) {
                                continue;
                            }
                            let mut task = TaskSpec::new(routine.prompt.clone());
                            task.model_preference = routine.model_preference.clone();
                            task.max_cost_tier = routine.max_cost_tier;
                            tracing::info!(routine = %routine.name, job_id = %task.job_id, "routine fired");
                            if let Err(err) = submitter(task).await {
                                tracing::warn!(routine = %routine.name, %err, "routine submission failed");
                            }
                        }
                    }
                    .boxed()
                },
            ));
        }
    }

    fn spawn_sweep<F>(
        &self,
        name: &'static str,
        initial_delay: Duration,
        interval: Duration,
        mut iteration: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if !initial_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(initial_delay) => {}
                }
            }
            loop {
                iteration().await;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(sweep = name, "sweep stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }

    /// Cancel all timers and wait for in-flight iterations to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles = {
            let mut guard = self.handles.lock().expect("scheduler handles");
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_retry_poll(retry: &Arc<RetryQueue>, submitter: &TaskSubmitter) {
    let due = retry.due(Utc::now()).await;
    for entry in due {
        match submitter(entry.task.clone()).await {
            Ok(_) => {
                // Removed only on successful re-submission.
                if let Err(err) = retry.remove(&entry.job_id).await {
                    tracing::warn!(job_id = %entry.job_id, %err, "retry removal failed");
                }
            }
            Err(err) => {
                tracing::warn!(job_id = %entry.job_id, %err, "retry re-submission failed");
                if let Err(err) = retry.enqueue(entry.task, &err.to_string()).await {
                    tracing::error!(job_id = %entry.job_id, %err, "retry backoff update failed");
                }
            }
        }
    }
}
