use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use zora_types::TaskSpec;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntry {
    pub job_id: String,
    pub task: TaskSpec,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueData {
    #[serde(default)]
    entries: Vec<RetryEntry>,
    #[serde(default)]
    dead_letter: Vec<RetryEntry>,
}

/// Durable, backoff-scheduled queue of failed tasks. Entries survive
/// restarts in `retry-queue.json`; exhausted entries move to the dead-letter
/// section instead of disappearing.
pub struct RetryQueue {
    path: PathBuf,
    config: RetryConfig,
    data: RwLock<QueueData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Scheduled,
    DeadLettered,
}

impl RetryQueue {
    pub async fn open(base_dir: &std::path::Path, config: RetryConfig) -> anyhow::Result<Self> {
        let path = base_dir.join("retry-queue.json");
        let data = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => QueueData::default(),
        };
        Ok(Self {
            path,
            config,
            data: RwLock::new(data),
        })
    }

    /// Queue a freshly failed task, or push back an already-queued one with
    /// the next backoff step. Returns where the entry ended up.
    pub async fn enqueue(&self, task: TaskSpec, error: &str) -> anyhow::Result<RetryDisposition> {
        let disposition = {
            let mut data = self.data.write().await;
            if let Some(pos) = data.entries.iter().position(|e| e.job_id == task.job_id) {
                let mut entry = data.entries.remove(pos);
                entry.attempt_count += 1;
                entry.last_error = error.to_string();
                if entry.attempt_count >= entry.max_attempts {
                    data.dead_letter.push(entry);
                    RetryDisposition::DeadLettered
                } else {
                    entry.next_attempt_at = Utc::now() + self.backoff(entry.attempt_count);
                    data.entries.push(entry);
                    RetryDisposition::Scheduled
                }
            } else {
                let entry = RetryEntry {
                    job_id: task.job_id.clone(),
                    task,
                    attempt_count: 1,
                    max_attempts: self.config.max_attempts,
                    next_attempt_at: Utc::now() + self.backoff(1),
                    last_error: error.to_string(),
                };
                data.entries.push(entry);
                RetryDisposition::Scheduled
            }
        };
        self.persist().await?;
        Ok(disposition)
    }

    /// Entries whose next attempt is due.
    pub async fn due(&self, now: DateTime<Utc>) -> Vec<RetryEntry> {
        self.data
            .read()
            .await
            .entries
            .iter()
            .filter(|e| e.next_attempt_at <= now)
            .cloned()
            .collect()
    }

    /// Remove an entry after a successful re-submission.
    pub async fn remove(&self, job_id: &str) -> anyhow::Result<bool> {
        let removed = {
            let mut data = self.data.write().await;
            let before = data.entries.len();
            data.entries.retain(|e| e.job_id != job_id);
            before != data.entries.len()
        };
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    pub async fn entries(&self) -> Vec<RetryEntry> {
        self.data.read().await.entries.clone()
    }

    pub async fn dead_letter(&self) -> Vec<RetryEntry> {
        self.data.read().await.dead_letter.clone()
    }

    /// `min(base × 2^(attempt-1) + jitter, cap)`.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_secs.max(1);
        let exp = base.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(20));
        let jitter = rand::thread_rng().gen_range(0..=base);
        let secs = exp.saturating_add(jitter).min(self.config.max_delay_secs);
        Duration::seconds(secs as i64)
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let payload = {
            let data = self.data.read().await;
            serde_json::to_string_pretty(&*data)?
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            base_delay_secs: 10,
            max_delay_secs: 100,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn entries_survive_a_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = TaskSpec::new("retry me");
        let job_id = task.job_id.clone();
        {
            let queue = RetryQueue::open(dir.path(), config()).await.expect("open");
            queue.enqueue(task, "provider down").await.expect("enqueue");
        }
        let reopened = RetryQueue::open(dir.path(), config()).await.expect("reopen");
        let entries = reopened.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, job_id);
        assert_eq!(entries[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn due_respects_the_backoff_schedule() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = RetryQueue::open(dir.path(), config()).await.expect("open");
        queue
            .enqueue(TaskSpec::new("later"), "boom")
            .await
            .expect("enqueue");

        assert!(queue.due(Utc::now()).await.is_empty());
        let future = Utc::now() + Duration::seconds(30);
        assert_eq!(queue.due(future).await.len(), 1);
    }

    #[tokio::test]
    async fn repeated_failures_dead_letter_after_max_attempts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = RetryQueue::open(dir.path(), config()).await.expect("open");
        let task = TaskSpec::new("doomed");

        assert_eq!(
            queue.enqueue(task.clone(), "one").await.expect("enqueue"),
            RetryDisposition::Scheduled
        );
        assert_eq!(
            queue.enqueue(task.clone(), "two").await.expect("enqueue"),
            RetryDisposition::Scheduled
        );
        assert_eq!(
            queue.enqueue(task.clone(), "three").await.expect("enqueue"),
            RetryDisposition::DeadLettered
        );
        assert!(queue.entries().await.is_empty());
        let dead = queue.dead_letter().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error, "three");
    }

    #[tokio::test]
    async fn remove_clears_the_entry_after_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = RetryQueue::open(dir.path(), config()).await.expect("open");
        let task = TaskSpec::new("will succeed");
        let job_id = task.job_id.clone();
        queue.enqueue(task, "first failure").await.expect("enqueue");

        assert!(queue.remove(&job_id).await.expect("remove"));
        assert!(!queue.remove(&job_id).await.expect("remove again"));
        assert!(queue.entries().await.is_empty());
    }

    #[tokio::test]
    async fn backoff_grows_and_caps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = RetryQueue::open(dir.path(), config()).await.expect("open");
        let first = queue.backoff(1).num_seconds();
        assert!((10..=20).contains(&first));
        let capped = queue.backoff(10).num_seconds();
        assert_eq!(capped, 100);
    }
}
