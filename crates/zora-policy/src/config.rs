use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Static-at-load policy rules, parsed from `policy.toml`. The engine may
/// rewrite the file on runtime expansion; serialize → parse → serialize is a
/// fixed point.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default)]
    pub filesystem: FilesystemPolicy,
    #[serde(default)]
    pub shell: ShellPolicy,
    #[serde(default)]
    pub actions: ActionPolicy,
    #[serde(default)]
    pub network: NetworkPolicy,
    #[serde(default)]
    pub budget: BudgetPolicy,
    #[serde(default)]
    pub dry_run: DryRunPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilesystemPolicy {
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Permanent deny-list: runtime expansion cannot override these.
    #[serde(default)]
    pub denied_paths: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for FilesystemPolicy {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            denied_paths: vec![
                "~/.ssh".to_string(),
                "~/.gnupg".to_string(),
                "~/.aws".to_string(),
                "/etc".to_string(),
            ],
            follow_symlinks: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShellMode {
    Allowlist,
    Denylist,
    DenyAll,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ShellPolicy {
    pub mode: ShellMode,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Permanent deny-list, same contract as `denied_paths`.
    #[serde(default)]
    pub denied_commands: Vec<String>,
    #[serde(default = "default_true")]
    pub split_chained_commands: bool,
}

impl Default for ShellPolicy {
    fn default() -> Self {
        Self {
            mode: ShellMode::Denylist,
            allowed_commands: Vec::new(),
            denied_commands: vec![
                "mkfs".to_string(),
                "shutdown".to_string(),
                "reboot".to_string(),
            ],
            split_chained_commands: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActionPolicy {
    /// Action categories that always go through the flag callback.
    #[serde(default)]
    pub always_flag: Vec<String>,
    #[serde(default)]
    pub irreversible: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NetworkPolicy {
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub denied_hosts: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnExceed {
    Block,
    Flag,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BudgetPolicy {
    #[serde(default = "default_max_actions")]
    pub max_actions_per_session: u32,
    #[serde(default)]
    pub max_actions_per_type: BTreeMap<String, u32>,
    /// 0 disables token budgeting.
    #[serde(default)]
    pub token_budget: u64,
    #[serde(default = "default_on_exceed")]
    pub on_exceed: OnExceed,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            max_actions_per_session: default_max_actions(),
            max_actions_per_type: BTreeMap::new(),
            token_budget: 0,
            on_exceed: default_on_exceed(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DryRunPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Empty means the built-in write tools (Write, Edit, Bash).
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_true")]
    pub audit_dry_runs: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_actions() -> u32 {
    200
}

fn default_on_exceed() -> OnExceed {
    OnExceed::Block
}

impl PolicyConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, PolicyError> {
        toml::from_str(raw).map_err(|err| PolicyError::InvalidConfig(err.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, PolicyError> {
        toml::to_string_pretty(self).map_err(|err| PolicyError::InvalidConfig(err.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn save(&self, path: &Path) -> Result<(), PolicyError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_parse_serialize_is_a_fixed_point() {
        let mut config = PolicyConfig::default();
        config
            .filesystem
            .allowed_paths
            .push("/tmp/work".to_string());
        config.shell.allowed_commands.push("cargo".to_string());
        config
            .budget
            .max_actions_per_type
            .insert("write_file".to_string(), 10);

        let first = config.to_toml_string().expect("serialize");
        let parsed = PolicyConfig::from_toml_str(&first).expect("parse");
        let second = parsed.to_toml_string().expect("serialize again");
        assert_eq!(first, second);
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let raw = r#"
[shell]
mode = "allowlist"
allowed_commands = ["ls", "cat"]
"#;
        let config = PolicyConfig::from_toml_str(raw).expect("parse");
        assert_eq!(config.shell.mode, ShellMode::Allowlist);
        assert!(config.shell.split_chained_commands);
        assert_eq!(config.budget.max_actions_per_session, 200);
        assert!(!config.filesystem.denied_paths.is_empty());
    }

    #[test]
    fn unknown_sections_are_rejected_at_boot() {
        let raw = "[telemetry]\nendpoint = \"x\"\n";
        assert!(PolicyConfig::from_toml_str(raw).is_err());
    }
}
