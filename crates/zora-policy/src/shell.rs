use crate::config::{ShellMode, ShellPolicy};
use crate::paths::PathRules;

/// Shell-aware tokenizer. Double quotes honor the `\"`, `\\`, `\$` and
/// `` \` `` escapes; single quotes are literal; a backslash outside quotes
/// escapes the next character.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_chars = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if in_single {
            if c == '\'' {
                in_single = false;
            } else {
                current.push(c);
            }
            continue;
        }
        if in_double {
            match c {
                '"' => in_double = false,
                '\\' => match chars.peek() {
                    Some(&next @ ('"' | '\\' | '$' | '`')) => {
                        current.push(next);
                        chars.next();
                    }
                    _ => current.push('\\'),
                },
                _ => current.push(c),
            }
            continue;
        }
        match c {
            '\'' => {
                in_single = true;
                has_chars = true;
            }
            '"' => {
                in_double = true;
                has_chars = true;
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_chars = true;
                }
            }
            c if c.is_whitespace() => {
                if has_chars {
                    tokens.push(std::mem::take(&mut current));
                    has_chars = false;
                }
            }
            _ => {
                current.push(c);
                has_chars = true;
            }
        }
    }
    if has_chars {
        tokens.push(current);
    }
    tokens
}

/// Split a command line on `;`, `&&`, `||` and `|` outside quotes and outside
/// `$(...)`/backtick substitutions.
pub fn split_chained(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_backtick = false;
    let mut paren_depth = 0usize;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if in_single {
            current.push(c);
            if c == '\'' {
                in_single = false;
            }
            continue;
        }
        if in_double {
            current.push(c);
            match c {
                '"' => in_double = false,
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                _ => {}
            }
            continue;
        }
        match c {
            '\'' => {
                in_single = true;
                current.push(c);
            }
            '"' => {
                in_double = true;
                current.push(c);
            }
            '`' => {
                in_backtick = !in_backtick;
                current.push(c);
            }
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '$' if chars.peek() == Some(&'(') => {
                current.push(c);
                current.push('(');
                chars.next();
                paren_depth += 1;
            }
            ')' if paren_depth > 0 => {
                current.push(c);
                paren_depth -= 1;
            }
            ';' if !in_backtick && paren_depth == 0 => {
                push_part(&mut parts, &mut current);
            }
            '|' if !in_backtick && paren_depth == 0 => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                push_part(&mut parts, &mut current);
            }
            '&' if !in_backtick && paren_depth == 0 && chars.peek() == Some(&'&') => {
                chars.next();
                push_part(&mut parts, &mut current);
            }
            _ => current.push(c),
        }
    }
    push_part(&mut parts, &mut current);
    parts
}

fn push_part(parts: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_string());
    }
    current.clear();
}

/// The command being run: basename of the first token that is not a
/// `FOO=bar` variable-assignment prefix.
pub fn base_command(tokens: &[String]) -> Option<String> {
    let first = tokens.iter().find(|t| !is_assignment(t))?;
    let name = first.rsplit('/').next().unwrap_or(first);
    Some(name.to_string())
}

fn is_assignment(token: &str) -> bool {
    let Some(eq) = token.find('=') else {
        return false;
    };
    let name = &token[..eq];
    !name.is_empty()
        && name
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
}

#[derive(Debug, Clone)]
pub struct CommandRules {
    mode: ShellMode,
    allowed: Vec<String>,
    denied: Vec<String>,
    split_chained: bool,
}

impl CommandRules {
    pub fn from_policy(policy: &ShellPolicy) -> Self {
        Self {
            mode: policy.mode,
            allowed: policy.allowed_commands.clone(),
            denied: policy.denied_commands.clone(),
            split_chained: policy.split_chained_commands,
        }
    }

    /// Validate every sub-command of a shell line, then scan its path-like
    /// arguments against the denied path roots.
    pub fn validate(&self, input: &str, path_rules: &PathRules) -> Result<(), String> {
        let parts = if self.split_chained {
            split_chained(input)
        } else {
            vec![input.trim().to_string()]
        };
        if parts.is_empty() {
            return Err("empty command".to_string());
        }

        for part in &parts {
            let tokens = tokenize(part);
            let Some(cmd) = base_command(&tokens) else {
                return Err(format!("no command found in `{part}`"));
            };
            if self.denied.iter().any(|d| d == &cmd) {
                return Err(format!("command `{cmd}` is denied"));
            }
            match self.mode {
                ShellMode::DenyAll => {
                    return Err(format!("shell commands are disabled (`{cmd}`)"));
                }
                ShellMode::Allowlist => {
                    if !self.allowed.iter().any(|a| a == &cmd) {
                        return Err(format!("command `{cmd}` is not on the allowlist"));
                    }
                }
                ShellMode::Denylist => {}
            }

            for arg in tokens.iter().skip(1) {
                if !looks_like_path(arg) {
                    continue;
                }
                if let Some(reason) = path_rules.hits_denied(arg) {
                    return Err(format!("argument `{arg}` rejected: {reason}"));
                }
            }
        }
        Ok(())
    }
}

fn looks_like_path(arg: &str) -> bool {
    arg.starts_with('/')
        || arg.starts_with('~')
        || arg.starts_with("./")
        || arg.starts_with("../")
}

/// Commands a dry run lets through: they observe, never mutate.
pub fn is_read_only_command(input: &str) -> bool {
    const READ_ONLY: &[&str] = &[
        "ls", "cat", "pwd", "echo", "head", "tail", "wc", "which", "env", "date", "grep", "find",
        "stat", "file", "du", "df",
    ];
    const GIT_READ_ONLY: &[&str] = &[
        "status", "log", "diff", "show", "branch", "remote", "tag",
    ];

    for part in split_chained(input) {
        let tokens = tokenize(&part);
        let Some(cmd) = base_command(&tokens) else {
            return false;
        };
        if cmd == "git" {
            let sub = tokens
                .iter()
                .filter(|t| !is_assignment(t))
                .nth(1)
                .map(String::as_str)
                .unwrap_or("");
            if !GIT_READ_ONLY.contains(&sub) {
                return false;
            }
            continue;
        }
        if !READ_ONLY.contains(&cmd.as_str()) {
            return false;
        }
    }
    true
}
