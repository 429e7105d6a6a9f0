use std::path::{Component, Path, PathBuf};

use crate::config::FilesystemPolicy;

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Resolve `.` and `..` components without touching the filesystem. `..` at
/// the root is dropped rather than kept.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Component-wise prefix containment: `/tmp/zed` is not within `/tmp/z`.
pub fn is_within(candidate: &Path, root: &Path) -> bool {
    candidate.starts_with(root)
}

#[derive(Debug, Clone)]
pub struct PathRules {
    allowed: Vec<PathBuf>,
    denied: Vec<PathBuf>,
    follow_symlinks: bool,
}

impl PathRules {
    pub fn from_policy(policy: &FilesystemPolicy) -> Self {
        Self {
            allowed: policy
                .allowed_paths
                .iter()
                .map(|p| normalize_lexically(&absolutize(&expand_home(p))))
                .collect(),
            denied: policy
                .denied_paths
                .iter()
                .map(|p| normalize_lexically(&absolutize(&expand_home(p))))
                .collect(),
            follow_symlinks: policy.follow_symlinks,
        }
    }

    /// Resolve the raw path and decide access. Deny beats allow: a path under
    /// any denied root is rejected even when an allowed root also contains
    /// it, and a symlink is judged by its real target as well as its declared
    /// location when `follow_symlinks` is off.
    pub fn validate(&self, raw: &str) -> Result<PathBuf, String> {
        let declared = normalize_lexically(&absolutize(&expand_home(raw)));

        let mut judged = vec![declared.clone()];
        if !self.follow_symlinks {
            if let Some(real) = resolve_real_target(&declared) {
                if real != declared {
                    judged.push(real);
                }
            }
        }

        for path in &judged {
            if let Some(root) = self.denied.iter().find(|root| is_within(path, root)) {
                return Err(format!(
                    "path {} is inside denied path {}",
                    path.display(),
                    root.display()
                ));
            }
        }

        if self.allowed.is_empty() {
            return Err(format!(
                "path {} is outside every allowed path (none configured)",
                declared.display()
            ));
        }
        if self.allowed.iter().any(|root| is_within(&declared, root)) {
            Ok(declared)
        } else {
            Err(format!(
                "path {} is outside every allowed path",
                declared.display()
            ))
        }
    }

    /// True when the path (or its real target) falls under a denied root.
    pub fn hits_denied(&self, raw: &str) -> Option<String> {
        match self.validate(raw) {
            Err(reason) if reason.contains("denied path") => Some(reason),
            _ => None,
        }
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Follow the symlink chain of the deepest existing ancestor. Missing files
/// resolve through their existing parent so a link to a denied directory
/// cannot be dodged by naming a not-yet-created child.
fn resolve_real_target(path: &Path) -> Option<PathBuf> {
    if path.exists() {
        return std::fs::canonicalize(path).ok();
    }
    let parent = path.parent()?;
    let file_name = path.file_name()?;
    if parent.exists() {
        return std::fs::canonicalize(parent).ok().map(|p| p.join(file_name));
    }
    None
}
