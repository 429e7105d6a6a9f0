mod budget;
mod capsule;
mod config;
mod engine;
mod error;
mod paths;
mod shell;

pub use budget::{BudgetStatus, SessionBudget};
pub use capsule::{
    extract_keywords, jaccard, CapsuleSigner, DriftCheck, IntentCapsule,
};
pub use config::{
    ActionPolicy, BudgetPolicy, DryRunPolicy, FilesystemPolicy, NetworkPolicy, OnExceed,
    PolicyConfig, ShellMode, ShellPolicy,
};
pub use engine::{
    classify_action, AccessReport, AuditSink, DryRunRecord, ExpandReport, ExpandRequest,
    FlagCallback, FlagRequest, PolicyEngine, Verdict,
};
pub use error::PolicyError;
pub use paths::{expand_home, is_within, normalize_lexically, PathRules};
pub use shell::{base_command, split_chained, tokenize, CommandRules};
