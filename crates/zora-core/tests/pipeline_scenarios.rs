use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use zora_core::{
    verify_chain, AuditLogger, EngineConfig, EventBus, ExecutionPipeline, FailoverController,
    PipelineError, RetryConfig, RetryQueue, Router, SessionStore, SteeringInbox, SteeringMessage,
};
use zora_memory::{MemoryConfig, MemoryManager};
use zora_policy::{FilesystemPolicy, PolicyConfig, PolicyEngine};
use zora_providers::{
    CircuitBreakerConfig, FsToolRunner, Provider, ProviderRegistry, ScriptStep, ScriptedProvider,
};
use zora_types::{
    Capability, CostTier, EventKind, ProviderSpec, RoutingMode, TaskSpec,
};

struct Harness {
    pipeline: ExecutionPipeline,
    sessions: Arc<SessionStore>,
    steering: Arc<SteeringInbox>,
    retry: Arc<RetryQueue>,
    audit: AuditLogger,
    audit_path: std::path::PathBuf,
    memory_dir: std::path::PathBuf,
}

async fn harness(
    dir: &Path,
    policy_config: PolicyConfig,
    providers: Vec<Arc<ScriptedProvider>>,
) -> Harness {
    let registry = ProviderRegistry::new(
        providers
            .into_iter()
            .map(|p| p as Arc<dyn zora_providers::Provider>)
            .collect(),
    );
    let policy = Arc::new(PolicyEngine::new(policy_config));
    let audit_path = dir.join("audit.jsonl");
    let audit = AuditLogger::open(&audit_path).await.expect("audit");
    policy.set_audit_sink(Arc::new(audit.clone())).await;

    let memory_dir = dir.join("memory");
    let memory = Arc::new(
        MemoryManager::new(&memory_dir, MemoryConfig::default())
            .await
            .expect("memory"),
    );
    let sessions = Arc::new(SessionStore::new(dir).await.expect("sessions"));
    let steering = Arc::new(SteeringInbox::new(dir).await.expect("steering"));
    let retry = Arc::new(
        RetryQueue::open(dir, RetryConfig::default())
            .await
            .expect("retry"),
    );
    let bus = EventBus::new();
    let router = Arc::new(Router::new(RoutingMode::RespectRanking));
    let failover = Arc::new(FailoverController::new(
        registry.clone(),
        router.clone(),
        EngineConfig::default().routing.max_handoff_context_tokens,
    ));

    let pipeline = ExecutionPipeline::new(
        registry,
        router,
        failover,
        policy,
        memory,
        sessions.clone(),
        steering.clone(),
        retry.clone(),
        bus,
        audit.clone(),
        "You are Zora under test.".to_string(),
    );

    Harness {
        pipeline,
        sessions,
        steering,
        retry,
        audit,
        audit_path,
        memory_dir,
    }
}

fn coding_provider(name: &str, rank: u32) -> Arc<ScriptedProvider> {
    Arc::new(
        ScriptedProvider::new(
            ProviderSpec::new(name, rank, CostTier::Included)
                .with_capabilities([Capability::Coding, Capability::Reasoning]),
            CircuitBreakerConfig::default(),
        )
        .with_runner(Arc::new(FsToolRunner)),
    )
}

fn permissive_policy(allowed: &Path) -> PolicyConfig {
    PolicyConfig {
        filesystem: FilesystemPolicy {
            allowed_paths: vec![allowed.to_string_lossy().to_string()],
            denied_paths: vec!["~/.ssh".to_string(), "/etc".to_string()],
            follow_symlinks: false,
        },
        ..PolicyConfig::default()
    }
}

#[tokio::test]
async fn happy_path_writes_the_file_and_audits_the_tool_call() {
    let dir = tempfile::tempdir().expect("tempdir");
    let workspace = dir.path().join("work");
    std::fs::create_dir_all(&workspace).expect("workspace");
    let target = workspace.join("a.txt");

    let provider = coding_provider("provider-a", 1);
    provider
        .push_script(vec![
            ScriptStep::ToolCall {
                tool: "Write".to_string(),
                arguments: json!({"file_path": target.to_str().unwrap(), "content": "hello"}),
            },
            ScriptStep::Done("wrote the file".to_string()),
        ])
        .await;

    let harness = harness(dir.path(), permissive_policy(&workspace), vec![provider]).await;
    let task = TaskSpec::new(format!("write hello to {}", target.display()));
    let job_id = task.job_id.clone();

    let outcome = harness
        .pipeline
        .run(task, CancellationToken::new())
        .await
        .expect("task succeeds");
    assert_eq!(outcome.result_text, "wrote the file");

    // The tool ran for real.
    assert_eq!(std::fs::read_to_string(&target).expect("file"), "hello");

    // The session log ends in done.
    let events = harness.sessions.read(&job_id).await.expect("read");
    assert!(matches!(
        events.last().expect("last").kind,
        EventKind::Done { .. }
    ));

    // A daily-note completion line was appended.
    let daily_dir = harness.memory_dir.join("daily");
    let notes = std::fs::read_dir(&daily_dir)
        .expect("daily dir")
        .flatten()
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("md"))
        .count();
    assert!(notes >= 1);

    // Audit captured the invocation and its result, chained from genesis.
    harness.audit.flush().await;
    let raw = std::fs::read_to_string(&harness.audit_path).expect("audit");
    assert!(raw.contains("tool_invocation"));
    assert!(raw.contains("tool_result"));
    assert!(verify_chain(&harness.audit_path).await.expect("verify") >= 2);
}

#[tokio::test]
async fn quota_failover_continues_on_the_second_provider() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider_a = coding_provider("provider-a", 1);
    provider_a
        .push_script(vec![
            ScriptStep::Text("starting the draft".to_string()),
            ScriptStep::Text("halfway".to_string()),
            ScriptStep::Error {
                message: "monthly quota exhausted".to_string(),
                is_auth_error: false,
                is_quota_error: true,
            },
        ])
        .await;
    let provider_b = coding_provider("provider-b", 2);
    provider_b
        .push_script(vec![
            ScriptStep::Text("resuming from handoff".to_string()),
            ScriptStep::Done("finished on the substitute".to_string()),
        ])
        .await;

    let harness = harness(
        dir.path(),
        permissive_policy(dir.path()),
        vec![provider_a.clone(), provider_b],
    )
    .await;
    let task = TaskSpec::new("write the weekly report code");
    let job_id = task.job_id.clone();

    let outcome = harness
        .pipeline
        .run(task, CancellationToken::new())
        .await
        .expect("failover succeeds");
    assert_eq!(outcome.provider, "provider-b");
    assert_eq!(outcome.result_text, "finished on the substitute");

    let events = harness.sessions.read(&job_id).await.expect("read");
    assert!(events.len() >= 5);
    let sources: std::collections::BTreeSet<_> =
        events.iter().map(|e| e.source.clone()).collect();
    assert!(sources.contains("provider-a"));
    assert!(sources.contains("provider-b"));
    assert!(matches!(
        events.last().expect("last").kind,
        EventKind::Done { .. }
    ));

    // The quota error put provider A on cooldown.
    assert!(provider_a.get_quota_status().await.is_exhausted);
}

#[tokio::test]
async fn denied_shell_call_becomes_a_tool_error_without_execution() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = coding_provider("provider-a", 1);
    provider
        .push_script(vec![
            ScriptStep::ToolCall {
                tool: "Bash".to_string(),
                arguments: json!({"command": "rm -rf ~/.ssh"}),
            },
            ScriptStep::Done("declined to delete credentials".to_string()),
        ])
        .await;

    let harness = harness(dir.path(), permissive_policy(dir.path()), vec![provider]).await;
    let task = TaskSpec::new("clean up my old ssh keys");
    let job_id = task.job_id.clone();

    let outcome = harness
        .pipeline
        .run(task, CancellationToken::new())
        .await
        .expect("task completes");
    assert_eq!(outcome.result_text, "declined to delete credentials");

    let events = harness.sessions.read(&job_id).await.expect("read");
    let result = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::ToolResult {
                is_error, output, ..
            } => Some((*is_error, output.clone())),
            _ => None,
        })
        .expect("tool result present");
    assert!(result.0, "deny must surface as an error result");
    assert!(result.1.contains(".ssh"), "reason names the denied path: {}", result.1);
}

#[tokio::test]
async fn budget_block_denies_the_third_write() {
    let dir = tempfile::tempdir().expect("tempdir");
    let workspace = dir.path().join("work");
    std::fs::create_dir_all(&workspace).expect("workspace");

    let mut policy = permissive_policy(&workspace);
    policy.budget.max_actions_per_session = 2;

    let provider = coding_provider("provider-a", 1);
    let script: Vec<ScriptStep> = (0..3)
        .map(|i| ScriptStep::ToolCall {
            tool: "Write".to_string(),
            arguments: json!({
                "file_path": workspace.join(format!("f{i}.txt")).to_str().unwrap(),
                "content": "x",
            }),
        })
        .chain([ScriptStep::Done("stopped at the budget".to_string())])
        .collect();
    provider.push_script(script).await;

    let harness = harness(dir.path(), policy, vec![provider]).await;
    let task = TaskSpec::new("write three files");
    let job_id = task.job_id.clone();
    harness
        .pipeline
        .run(task, CancellationToken::new())
        .await
        .expect("task completes");

    let events = harness.sessions.read(&job_id).await.expect("read");
    let results: Vec<(bool, String)> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ToolResult {
                is_error, output, ..
            } => Some((*is_error, output.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 3);
    assert!(!results[0].0);
    assert!(!results[1].0);
    assert!(results[2].0);
    assert!(
        results[2].1.contains("Session action budget exceeded: 3/2"),
        "got: {}",
        results[2].1
    );
    assert!(workspace.join("f0.txt").exists());
    assert!(workspace.join("f1.txt").exists());
    assert!(!workspace.join("f2.txt").exists());
}

#[tokio::test]
async fn steering_lands_in_stream_and_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = coding_provider("provider-a", 1);
    provider
        .push_script(vec![
            ScriptStep::Text("working on it".to_string()),
            ScriptStep::Done("done".to_string()),
        ])
        .await;

    let harness = harness(dir.path(), permissive_policy(dir.path()), vec![provider]).await;
    let task = TaskSpec::new("long running analysis of the code");
    let job_id = task.job_id.clone();

    // The steer arrives before the first poll window opens.
    harness
        .steering
        .push(&job_id, SteeringMessage::new("focus on chapter 2", "sam", "dashboard"))
        .await
        .expect("push");

    harness
        .pipeline
        .run(task, CancellationToken::new())
        .await
        .expect("task completes");

    let events = harness.sessions.read(&job_id).await.expect("read");
    let steering_index = events
        .iter()
        .position(|e| matches!(e.kind, EventKind::Steering { .. }))
        .expect("steering event persisted");
    let text_index = events
        .iter()
        .position(|e| matches!(e.kind, EventKind::Text { .. }))
        .expect("text event");
    assert!(steering_index > text_index);
    match &events[steering_index].kind {
        EventKind::Steering { message, author, .. } => {
            assert_eq!(message, "focus on chapter 2");
            assert_eq!(author, "sam");
        }
        other => panic!("unexpected kind: {other:?}"),
    }
}

#[tokio::test]
async fn exhausted_failover_enqueues_a_durable_retry_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = coding_provider("provider-a", 1);
    provider
        .push_script(vec![ScriptStep::Error {
            message: "connection reset".to_string(),
            is_auth_error: false,
            is_quota_error: false,
        }])
        .await;

    let harness = harness(dir.path(), permissive_policy(dir.path()), vec![provider]).await;
    let task = TaskSpec::new("flaky network job code");
    let job_id = task.job_id.clone();

    let result = harness.pipeline.run(task, CancellationToken::new()).await;
    match result {
        Err(PipelineError::ProviderFailure {
            handled,
            retry_queued,
            ..
        }) => {
            assert!(handled);
            assert!(retry_queued);
        }
        other => panic!("expected provider failure, got {other:?}"),
    }

    // Simulated restart: a fresh queue instance sees the same entry.
    drop(harness);
    let reopened = RetryQueue::open(dir.path(), RetryConfig::default())
        .await
        .expect("reopen");
    let entries = reopened.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job_id, job_id);
    assert_eq!(entries[0].last_error, "connection reset");

    // The poll cycle re-submits and removes on success.
    let due = reopened
        .due(chrono::Utc::now() + chrono::Duration::seconds(120))
        .await;
    assert_eq!(due.len(), 1);
    assert!(reopened.remove(&due[0].job_id).await.expect("remove"));
    assert!(reopened.entries().await.is_empty());
}

#[tokio::test]
async fn failover_depth_is_bounded_at_three_hops() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut providers = Vec::new();
    for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        let provider = coding_provider(&format!("provider-{name}"), i as u32 + 1);
        provider
            .push_script(vec![ScriptStep::Error {
                message: format!("provider {name} down"),
                is_auth_error: false,
                is_quota_error: false,
            }])
            .await;
        providers.push(provider);
    }

    let harness = harness(dir.path(), permissive_policy(dir.path()), providers).await;
    let task = TaskSpec::new("doomed job code");
    let job_id = task.job_id.clone();

    let result = harness.pipeline.run(task, CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(PipelineError::ProviderFailure { .. })
    ));

    // Initial attempt plus exactly three failover hops.
    let events = harness.sessions.read(&job_id).await.expect("read");
    let error_count = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Error { .. }))
        .count();
    assert_eq!(error_count, 4);
    assert_eq!(harness.retry.entries().await.len(), 1);
}
