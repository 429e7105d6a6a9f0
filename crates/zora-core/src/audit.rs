use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub details: Value,
    pub previous_hash: String,
    pub hash: String,
}

enum AuditMessage {
    Append { kind: String, details: Value },
    Flush(oneshot::Sender<()>),
}

/// Append-only, hash-chained audit log. A single writer task serializes
/// appends so the chain is never torn; `append` is non-blocking from any
/// context.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::UnboundedSender<AuditMessage>,
}

impl AuditLogger {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let previous_hash = last_hash(&path).await.unwrap_or_else(|| "genesis".to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(path, previous_hash, rx));
        Ok(Self { tx })
    }

    pub fn append(&self, kind: &str, details: Value) {
        let _ = self.tx.send(AuditMessage::Append {
            kind: kind.to_string(),
            details,
        });
    }

    /// Wait until everything appended so far has hit the disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(AuditMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl zora_policy::AuditSink for AuditLogger {
    fn record(&self, kind: &str, details: Value) {
        self.append(kind, details);
    }
}

async fn writer_loop(
    path: PathBuf,
    mut previous_hash: String,
    mut rx: mpsc::UnboundedReceiver<AuditMessage>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            AuditMessage::Append { kind, details } => {
                let entry = chain_entry(&previous_hash, &kind, details);
                previous_hash = entry.hash.clone();
                if let Err(err) = write_entry(&path, &entry).await {
                    tracing::error!(%err, path = %path.display(), "audit append failed");
                }
            }
            AuditMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn chain_entry(previous_hash: &str, kind: &str, details: Value) -> AuditEntry {
    let timestamp = Utc::now();
    let hash = entry_hash(previous_hash, timestamp, kind, &details);
    AuditEntry {
        timestamp,
        kind: kind.to_string(),
        details,
        previous_hash: previous_hash.to_string(),
        hash,
    }
}

fn entry_hash(previous_hash: &str, timestamp: DateTime<Utc>, kind: &str, details: &Value) -> String {
    let canonical = format!(
        "{previous_hash}|{}|{kind}|{details}",
        timestamp.to_rfc3339()
    );
    Sha256::digest(canonical.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

async fn write_entry(path: &Path, entry: &AuditEntry) -> anyhow::Result<()> {
    let line = serde_json::to_string(entry)?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    Ok(())
}

async fn last_hash(path: &Path) -> Option<String> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    let last = raw.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str::<AuditEntry>(last).ok().map(|e| e.hash)
}

/// Walk the chain and verify every link. Returns the entry count.
pub async fn verify_chain(path: impl AsRef<Path>) -> anyhow::Result<usize> {
    let raw = tokio::fs::read_to_string(path.as_ref()).await?;
    let mut previous = "genesis".to_string();
    let mut count = 0usize;
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let entry: AuditEntry = serde_json::from_str(line)?;
        if entry.previous_hash != previous {
            anyhow::bail!("chain broken at entry {count}: previous hash mismatch");
        }
        let expected = entry_hash(&entry.previous_hash, entry.timestamp, &entry.kind, &entry.details);
        if expected != entry.hash {
            anyhow::bail!("chain broken at entry {count}: hash mismatch");
        }
        previous = entry.hash;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn chain_starts_at_genesis_and_verifies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::open(&path).await.expect("open");
        logger.append("tool_invocation", json!({"tool": "Write"}));
        logger.append("tool_result", json!({"ok": true}));
        logger.flush().await;

        let raw = std::fs::read_to_string(&path).expect("read");
        let first: AuditEntry = serde_json::from_str(raw.lines().next().expect("line")).expect("parse");
        assert_eq!(first.previous_hash, "genesis");

        assert_eq!(verify_chain(&path).await.expect("verify"), 2);
    }

    #[tokio::test]
    async fn chain_continues_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        {
            let logger = AuditLogger::open(&path).await.expect("open");
            logger.append("one", json!({}));
            logger.flush().await;
        }
        {
            let logger = AuditLogger::open(&path).await.expect("reopen");
            logger.append("two", json!({}));
            logger.flush().await;
        }
        assert_eq!(verify_chain(&path).await.expect("verify"), 2);
    }

    #[tokio::test]
    async fn tampering_breaks_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::open(&path).await.expect("open");
        logger.append("one", json!({"n": 1}));
        logger.append("two", json!({"n": 2}));
        logger.flush().await;

        let raw = std::fs::read_to_string(&path).expect("read");
        let tampered = raw.replace(r#""n":1"#, r#""n":9"#);
        std::fs::write(&path, tampered).expect("write");
        assert!(verify_chain(&path).await.is_err());
    }
}
