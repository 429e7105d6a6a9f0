use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use crate::budget::{BudgetCheck, BudgetStatus, SessionBudget};
use crate::capsule::{CapsuleSigner, IntentCapsule};
use crate::config::{OnExceed, PolicyConfig, ShellMode};
use crate::error::PolicyError;
use crate::paths::{expand_home, is_within, normalize_lexically, PathRules};
use crate::shell::{is_read_only_command, CommandRules};

const WRITE_TOOLS: &[&str] = &["Write", "Edit", "Bash"];
const DEFAULT_DRIFT_THRESHOLD: f64 = 0.1;

/// Outcome of an authorize call. A deny is not fatal to the task: the caller
/// turns it into a tool_result error payload the provider can recover from.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow { updated_input: Option<Value> },
    Deny { reason: String },
}

impl Verdict {
    pub fn allow() -> Self {
        Verdict::Allow {
            updated_input: None,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FlagRequest {
    pub session_id: String,
    pub tool: String,
    pub category: String,
    pub reason: String,
    pub input: Value,
}

/// Seam for human approval of flagged actions. Absent callback means flags
/// are parsed but not enforced.
#[async_trait]
pub trait FlagCallback: Send + Sync {
    async fn request_approval(&self, request: FlagRequest) -> bool;
}

/// Sink for authorization audit records; the hash-chained audit log
/// implements this.
pub trait AuditSink: Send + Sync {
    fn record(&self, kind: &str, details: Value);
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub tool: String,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExpandRequest {
    pub paths: Vec<String>,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpandReport {
    pub added_paths: Vec<String>,
    pub added_commands: Vec<String>,
    pub rejected: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessReport {
    pub paths: Vec<(String, bool, Option<String>)>,
    pub commands: Vec<(String, bool, Option<String>)>,
}

/// Synchronous pre-tool-call authorization: precondition checks, budgeting,
/// always-flag categories, intent drift, dry-run interception — short-circuit
/// on the first deny.
pub struct PolicyEngine {
    config: RwLock<PolicyConfig>,
    policy_path: Option<PathBuf>,
    budgets: Mutex<HashMap<String, SessionBudget>>,
    capsules: RwLock<HashMap<String, IntentCapsule>>,
    signer: CapsuleSigner,
    flag: RwLock<Option<Arc<dyn FlagCallback>>>,
    audit: RwLock<Option<Arc<dyn AuditSink>>>,
    dry_runs: Mutex<Vec<DryRunRecord>>,
    drift_threshold: f64,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config: RwLock::new(config),
            policy_path: None,
            budgets: Mutex::new(HashMap::new()),
            capsules: RwLock::new(HashMap::new()),
            signer: CapsuleSigner::new_random(),
            flag: RwLock::new(None),
            audit: RwLock::new(None),
            dry_runs: Mutex::new(Vec::new()),
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
        }
    }

    pub fn load(policy_path: PathBuf) -> Result<Self, PolicyError> {
        let config = PolicyConfig::load(&policy_path)?;
        let mut engine = Self::new(config);
        engine.policy_path = Some(policy_path);
        Ok(engine)
    }

    pub async fn set_flag_callback(&self, callback: Arc<dyn FlagCallback>) {
        *self.flag.write().await = Some(callback);
    }

    pub async fn set_audit_sink(&self, sink: Arc<dyn AuditSink>) {
        *self.audit.write().await = Some(sink);
    }

    /// Reset the per-task budget. A session belongs to exactly one task.
    pub async fn start_session(&self, session_id: &str) {
        self.budgets
            .lock()
            .await
            .insert(session_id.to_string(), SessionBudget::default());
    }

    pub async fn end_session(&self, session_id: &str) {
        self.budgets.lock().await.remove(session_id);
        self.capsules.write().await.remove(session_id);
    }

    pub async fn create_capsule(
        &self,
        session_id: &str,
        mandate: &str,
        allowed_action_categories: Option<Vec<String>>,
        ttl: Option<chrono::Duration>,
    ) -> IntentCapsule {
        let capsule = self.signer.create(mandate, allowed_action_categories, ttl);
        self.capsules
            .write()
            .await
            .insert(session_id.to_string(), capsule.clone());
        capsule
    }

    pub async fn clear_capsule(&self, session_id: &str) {
        self.capsules.write().await.remove(session_id);
    }

    pub fn verify_capsule(&self, capsule: &IntentCapsule) -> bool {
        self.signer.verify(capsule)
    }

    pub async fn record_token_usage(&self, session_id: &str, tokens: u64) {
        if let Some(budget) = self.budgets.lock().await.get_mut(session_id) {
            budget.record_tokens(tokens);
        }
    }

    pub async fn get_budget_status(&self, session_id: &str) -> Option<BudgetStatus> {
        let config = self.config.read().await;
        self.budgets
            .lock()
            .await
            .get(session_id)
            .map(|b| b.status(&config.budget))
    }

    pub async fn validate_path(&self, raw: &str) -> Result<PathBuf, String> {
        let config = self.config.read().await;
        PathRules::from_policy(&config.filesystem).validate(raw)
    }

    pub async fn validate_command(&self, command: &str) -> Result<(), String> {
        let config = self.config.read().await;
        let path_rules = PathRules::from_policy(&config.filesystem);
        CommandRules::from_policy(&config.shell).validate(command, &path_rules)
    }

    /// Batch pre-check used by planners: per-item allow/deny with reasons,
    /// no budget or flag side effects.
    pub async fn check_access(&self, paths: &[String], commands: &[String]) -> AccessReport {
        let config = self.config.read().await;
        let path_rules = PathRules::from_policy(&config.filesystem);
        let command_rules = CommandRules::from_policy(&config.shell);
        AccessReport {
            paths: paths
                .iter()
                .map(|p| match path_rules.validate(p) {
                    Ok(_) => (p.clone(), true, None),
                    Err(reason) => (p.clone(), false, Some(reason)),
                })
                .collect(),
            commands: commands
                .iter()
                .map(|c| match command_rules.validate(c, &path_rules) {
                    Ok(()) => (c.clone(), true, None),
                    Err(reason) => (c.clone(), false, Some(reason)),
                })
                .collect(),
        }
    }

    /// Grant additional paths/commands at runtime. Entries on the permanent
    /// deny-lists are refused, as are paths resolving under a denied root.
    /// Persists the policy file when one is registered and anything changed.
    pub async fn expand_policy(&self, request: ExpandRequest) -> Result<ExpandReport, PolicyError> {
        let mut report = ExpandReport::default();
        let mut config = self.config.write().await;
        let denied_roots: Vec<PathBuf> = config
            .filesystem
            .denied_paths
            .iter()
            .map(|p| normalize_lexically(&expand_home(p)))
            .collect();

        for raw in request.paths {
            let resolved = normalize_lexically(&expand_home(&raw));
            if config.filesystem.denied_paths.iter().any(|d| *d == raw) {
                report
                    .rejected
                    .push((raw, "entry is on the permanent deny-list".to_string()));
                continue;
            }
            if let Some(root) = denied_roots.iter().find(|root| is_within(&resolved, root)) {
                report.rejected.push((
                    raw,
                    format!("resolves inside denied path {}", root.display()),
                ));
                continue;
            }
            if config.filesystem.allowed_paths.iter().any(|p| *p == raw) {
                continue;
            }
            config.filesystem.allowed_paths.push(raw.clone());
            report.added_paths.push(raw);
        }

        let mut promoted = false;
        for cmd in request.commands {
            if config.shell.denied_commands.iter().any(|d| *d == cmd) {
                report
                    .rejected
                    .push((cmd, "command is on the permanent deny-list".to_string()));
                continue;
            }
            if config.shell.allowed_commands.iter().any(|c| *c == cmd) {
                continue;
            }
            if config.shell.mode == ShellMode::DenyAll && config.shell.allowed_commands.is_empty() {
                promoted = true;
            }
            config.shell.allowed_commands.push(cmd.clone());
            report.added_commands.push(cmd);
        }
        if promoted {
            config.shell.mode = ShellMode::Allowlist;
        }

        let changed = !report.added_paths.is_empty() || !report.added_commands.is_empty();
        if changed {
            if let Some(path) = &self.policy_path {
                config.save(path)?;
            }
        }
        if let Some(audit) = self.audit.read().await.as_ref() {
            audit.record(
                "policy_expansion",
                serde_json::to_value(&report).unwrap_or_default(),
            );
        }
        Ok(report)
    }

    pub async fn drain_dry_runs(&self) -> Vec<DryRunRecord> {
        std::mem::take(&mut *self.dry_runs.lock().await)
    }

    /// The pre-tool-call gate. Ordering is fixed and short-circuits on the
    /// first deny: precondition, budget, always-flag, intent drift, dry-run.
    pub async fn authorize(&self, session_id: &str, tool: &str, input: &Value) -> Verdict {
        let config = self.config.read().await.clone();
        let path_rules = PathRules::from_policy(&config.filesystem);
        let category = classify_action(tool, input);

        // 1. Tool-specific precondition.
        if tool == "Bash" {
            let Some(command) = input.get("command").and_then(|v| v.as_str()) else {
                return self
                    .deny(session_id, tool, "Bash call missing `command` argument")
                    .await;
            };
            let command_rules = CommandRules::from_policy(&config.shell);
            if let Err(reason) = command_rules.validate(command, &path_rules) {
                return self.deny(session_id, tool, &reason).await;
            }
        } else if let Some(arg) = primary_path_argument(tool) {
            let Some(raw) = input.get(arg).and_then(|v| v.as_str()) else {
                return self
                    .deny(
                        session_id,
                        tool,
                        &format!("{tool} call missing `{arg}` argument"),
                    )
                    .await;
            };
            if let Err(reason) = path_rules.validate(raw) {
                return self.deny(session_id, tool, &reason).await;
            }
        }

        // 2. Budget. Counters move exactly once per call, before comparison.
        let budget_check = {
            let mut budgets = self.budgets.lock().await;
            let budget = budgets.entry(session_id.to_string()).or_default();
            let check = budget.record_action(&category, &config.budget);
            if matches!(check, BudgetCheck::Within) && budget.tokens_exceeded(&config.budget) {
                BudgetCheck::Exceeded {
                    reason: format!(
                        "Session token budget exceeded: {} tokens used over a budget of {}",
                        budget.status(&config.budget).tokens_used,
                        config.budget.token_budget
                    ),
                }
            } else {
                check
            }
        };
        if let BudgetCheck::Exceeded { reason } = budget_check {
            match config.budget.on_exceed {
                OnExceed::Block => return self.deny(session_id, tool, &reason).await,
                OnExceed::Flag => {
                    if !self
                        .request_approval(session_id, tool, &category, &reason, input)
                        .await
                        .unwrap_or(true)
                    {
                        return self.deny(session_id, tool, &reason).await;
                    }
                }
            }
        }

        // 3. Always-flag action categories.
        let flagged = config
            .actions
            .always_flag
            .iter()
            .any(|f| f == "*" || f == &category);
        if flagged {
            let reason = format!("action category `{category}` is configured always_flag");
            match self
                .request_approval(session_id, tool, &category, &reason, input)
                .await
            {
                // Absent callback: parsed but not enforced.
                None => {}
                Some(true) => {}
                Some(false) => {
                    return self
                        .deny(session_id, tool, &format!("flagged action not approved: {reason}"))
                        .await;
                }
            }
        }

        // 4. Intent drift against the signed capsule.
        let capsule = self.capsules.read().await.get(session_id).cloned();
        if let Some(capsule) = capsule {
            if !capsule.is_expired(Utc::now()) {
                let drift = if !self.signer.verify(&capsule) {
                    Some("intent capsule signature verification failed".to_string())
                } else {
                    let detail = format!("{tool} {}", action_detail(input));
                    capsule
                        .check_drift(&category, &detail, self.drift_threshold)
                        .reason
                };
                if let Some(reason) = drift {
                    match self
                        .request_approval(session_id, tool, &category, &reason, input)
                        .await
                    {
                        None => {
                            tracing::warn!(
                                session_id,
                                tool,
                                %reason,
                                "intent drift detected; no flag callback, allowing with warning"
                            );
                        }
                        Some(true) => {}
                        Some(false) => {
                            return self
                                .deny(session_id, tool, &format!("intent drift: {reason}"))
                                .await;
                        }
                    }
                }
            }
        }

        // 5. Dry-run interception.
        if config.dry_run.enabled && dry_run_applies(&config.dry_run.tools, tool, input) {
            let description = describe_dry_run(tool, input);
            let record = DryRunRecord {
                timestamp: Utc::now(),
                session_id: session_id.to_string(),
                tool: tool.to_string(),
                description: description.clone(),
            };
            if config.dry_run.audit_dry_runs {
                if let Some(audit) = self.audit.read().await.as_ref() {
                    audit.record("dry_run", serde_json::to_value(&record).unwrap_or_default());
                }
            }
            self.dry_runs.lock().await.push(record);
            return Verdict::Deny {
                reason: description,
            };
        }

        Verdict::allow()
    }

    async fn request_approval(
        &self,
        session_id: &str,
        tool: &str,
        category: &str,
        reason: &str,
        input: &Value,
    ) -> Option<bool> {
        let callback = self.flag.read().await.clone()?;
        Some(
            callback
                .request_approval(FlagRequest {
                    session_id: session_id.to_string(),
                    tool: tool.to_string(),
                    category: category.to_string(),
                    reason: reason.to_string(),
                    input: input.clone(),
                })
                .await,
        )
    }

    async fn deny(&self, session_id: &str, tool: &str, reason: &str) -> Verdict {
        tracing::info!(session_id, tool, %reason, "tool call denied");
        if let Some(audit) = self.audit.read().await.as_ref() {
            audit.record(
                "policy_denial",
                json!({"session_id": session_id, "tool": tool, "reason": reason}),
            );
        }
        Verdict::Deny {
            reason: reason.to_string(),
        }
    }
}

fn primary_path_argument(tool: &str) -> Option<&'static str> {
    match tool {
        "Write" | "Edit" | "Read" => Some("file_path"),
        "Glob" | "Grep" => Some("path"),
        _ => None,
    }
}

/// Classify the action for budgeting, flagging and drift checks.
pub fn classify_action(tool: &str, input: &Value) -> String {
    match tool {
        "Write" => "write_file".to_string(),
        "Edit" => "edit_file".to_string(),
        "Read" | "Glob" | "Grep" => "read_file".to_string(),
        "WebFetch" | "WebSearch" => "network_request".to_string(),
        "Bash" => {
            let command = input
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if command.contains("git push") {
                "git_push".to_string()
            } else if is_destructive_command(command) {
                "shell_exec_destructive".to_string()
            } else {
                "shell_exec".to_string()
            }
        }
        other => other.to_lowercase(),
    }
}

fn is_destructive_command(command: &str) -> bool {
    const DESTRUCTIVE: &[&str] = &["rm", "rmdir", "mkfs", "dd", "truncate", "shred"];
    crate::shell::split_chained(command).iter().any(|part| {
        let tokens = crate::shell::tokenize(part);
        crate::shell::base_command(&tokens)
            .map(|c| DESTRUCTIVE.contains(&c.as_str()))
            .unwrap_or(false)
    })
}

fn action_detail(input: &Value) -> String {
    match input {
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some(format!("{k} {s}")),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

fn dry_run_applies(tools: &[String], tool: &str, input: &Value) -> bool {
    let targeted = if tools.is_empty() {
        WRITE_TOOLS.contains(&tool)
    } else {
        tools.iter().any(|t| t == tool)
    };
    if !targeted {
        return false;
    }
    if tool == "Bash" {
        let command = input
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        return !is_read_only_command(command);
    }
    true
}

fn describe_dry_run(tool: &str, input: &Value) -> String {
    let what = match tool {
        "Write" => format!(
            "write {} bytes to {}",
            input
                .get("content")
                .and_then(|v| v.as_str())
                .map(str::len)
                .unwrap_or(0),
            input
                .get("file_path")
                .and_then(|v| v.as_str())
                .unwrap_or("<missing path>")
        ),
        "Edit" => format!(
            "edit {}",
            input
                .get("file_path")
                .and_then(|v| v.as_str())
                .unwrap_or("<missing path>")
        ),
        "Bash" => format!(
            "run `{}`",
            input
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or("<missing command>")
        ),
        other => format!("invoke {other}"),
    };
    format!("Dry run: would {what}")
}
