use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

const POLL_DEBOUNCE: Duration = Duration::from_secs(2);

/// A mid-flight human message for a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringMessage {
    pub id: String,
    pub message: String,
    pub author: String,
    pub channel: String,
    pub created_at: DateTime<Utc>,
}

impl SteeringMessage {
    pub fn new(message: impl Into<String>, author: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            id: format!("steer-{}", Uuid::new_v4()),
            message: message.into(),
            author: author.into(),
            channel: channel.into(),
            created_at: Utc::now(),
        }
    }
}

/// Durable per-job steering queue: producers drop message files into
/// `steering/<jobId>/`, the consuming pipeline renames processed files into
/// `archive/` — the rename is the commit. Polls are debounced per job.
pub struct SteeringInbox {
    dir: PathBuf,
    last_poll: Mutex<HashMap<String, Instant>>,
}

impl SteeringInbox {
    pub async fn new(base_dir: &Path) -> anyhow::Result<Self> {
        let dir = base_dir.join("steering");
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            last_poll: Mutex::new(HashMap::new()),
        })
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.dir.join(job_id)
    }

    /// Producer side: persist a pending message for the job.
    pub async fn push(&self, job_id: &str, message: SteeringMessage) -> anyhow::Result<()> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(dir.join("archive")).await?;
        let path = dir.join(format!("{}.json", message.id));
        fs::write(&path, serde_json::to_string_pretty(&message)?).await?;
        Ok(())
    }

    /// Consumer side: drain pending messages, oldest first. Calls within the
    /// 2-second debounce window return empty without touching the
    /// filesystem.
    pub async fn poll(&self, job_id: &str) -> anyhow::Result<Vec<SteeringMessage>> {
        {
            let mut last_poll = self.last_poll.lock().await;
            if let Some(last) = last_poll.get(job_id) {
                if last.elapsed() < POLL_DEBOUNCE {
                    return Ok(Vec::new());
                }
            }
            last_poll.insert(job_id.to_string(), Instant::now());
        }
        self.drain(job_id).await
    }

    /// Drain without debounce; cancellation paths and tests use this.
    pub async fn drain(&self, job_id: &str) -> anyhow::Result<Vec<SteeringMessage>> {
        let dir = self.job_dir(job_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let archive = dir.join("archive");
        fs::create_dir_all(&archive).await?;

        let mut pending = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            match serde_json::from_str::<SteeringMessage>(&raw) {
                Ok(message) => pending.push((path, message)),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "unparsable steering message");
                }
            }
        }
        pending.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at));

        let mut out = Vec::with_capacity(pending.len());
        for (path, message) in pending {
            let target = archive.join(format!("{}.json", message.id));
            fs::rename(&path, &target).await?;
            out.push(message);
        }
        Ok(out)
    }
}
