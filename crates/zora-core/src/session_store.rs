use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use zora_types::Event;

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Append-only, per-job event logs: one `sessions/<jobId>.jsonl` file per
/// task, newline-delimited Event records. Single writer per job; readers
/// parse line by line and tolerate a trailing incomplete line.
#[derive(Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub job_id: String,
    pub event_count: usize,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed: bool,
}

impl SessionStore {
    pub async fn new(base_dir: &Path) -> anyhow::Result<Self> {
        let dir = base_dir.join("sessions");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.jsonl"))
    }

    /// One-shot append outside a buffered writer (steering producers,
    /// tests).
    pub async fn append(&self, job_id: &str, event: &Event) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(job_id))
            .await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        Ok(())
    }

    /// Replay a job's log. A torn trailing line (crash mid-write) is
    /// dropped; a torn line anywhere else is reported and skipped.
    pub async fn read(&self, job_id: &str) -> anyhow::Result<Vec<Event>> {
        let path = self.path_for(job_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).await?;
        let lines: Vec<&str> = raw.lines().collect();
        let mut events = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(err) if index + 1 == lines.len() => {
                    tracing::debug!(job_id, %err, "dropping torn trailing line");
                }
                Err(err) => {
                    tracing::warn!(job_id, line = index, %err, "skipping unparsable event line");
                }
            }
        }
        Ok(events)
    }

    pub async fn list(&self) -> anyhow::Result<Vec<SessionSummary>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(job_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let events = self.read(job_id).await.unwrap_or_default();
            out.push(SessionSummary {
                job_id: job_id.to_string(),
                event_count: events.len(),
                updated_at: events.last().map(|e| e.timestamp),
                completed: events
                    .iter()
                    .any(|e| matches!(e.kind, zora_types::EventKind::Done { .. })),
            });
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    /// Open the single buffered writer for a job. Appends are batched and
    /// flushed every 500 ms or on close; ordering is preserved.
    pub fn open_writer(&self, job_id: &str) -> BufferedJobWriter {
        BufferedJobWriter::new(self.path_for(job_id), job_id.to_string())
    }
}

pub struct BufferedJobWriter {
    job_id: String,
    buffer: Arc<Mutex<Vec<Event>>>,
    path: PathBuf,
    stop: CancellationToken,
    flusher: JoinHandle<()>,
}

impl BufferedJobWriter {
    fn new(path: PathBuf, job_id: String) -> Self {
        let buffer: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();

        let flush_buffer = buffer.clone();
        let flush_path = path.clone();
        let flush_stop = stop.clone();
        let flusher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = flush_stop.cancelled() => {
                        flush(&flush_path, &flush_buffer).await;
                        break;
                    }
                    _ = tokio::time::sleep(FLUSH_INTERVAL) => {
                        flush(&flush_path, &flush_buffer).await;
                    }
                }
            }
        });

        Self {
            job_id,
            buffer,
            path,
            stop,
            flusher,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn append(&self, event: &Event) {
        self.buffer.lock().await.push(event.clone());
    }

    /// Flush whatever is pending and stop the timer. Always called, success
    /// or failure; partial events already written stay on disk.
    pub async fn close(self) {
        self.stop.cancel();
        let _ = self.flusher.await;
        flush(&self.path, &self.buffer).await;
    }
}

async fn flush(path: &Path, buffer: &Arc<Mutex<Vec<Event>>>) {
    let pending = {
        let mut guard = buffer.lock().await;
        if guard.is_empty() {
            return;
        }
        std::mem::take(&mut *guard)
    };
    let mut payload = String::new();
    for event in &pending {
        match serde_json::to_string(event) {
            Ok(line) => {
                payload.push_str(&line);
                payload.push('\n');
            }
            Err(err) => tracing::error!(%err, "unserializable event dropped from session log"),
        }
    }
    let result = async {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(payload.as_bytes()).await?;
        file.flush().await?;
        Ok::<_, std::io::Error>(())
    }
    .await;
    if let Err(err) = result {
        tracing::error!(%err, path = %path.display(), "session log flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zora_types::EventKind;

    #[tokio::test]
    async fn append_then_read_sees_the_event_last() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path()).await.expect("store");
        store
            .append("job-1", &Event::text("p", "first"))
            .await
            .expect("append");
        let last = Event::done("p", "finished");
        store.append("job-1", &last).await.expect("append");

        let events = store.read("job-1").await.expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events.last().expect("last").kind, last.kind);
    }

    #[tokio::test]
    async fn buffered_writer_preserves_order_across_flushes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path()).await.expect("store");
        let writer = store.open_writer("job-2");
        for i in 0..20 {
            writer.append(&Event::text("p", format!("event {i}"))).await;
        }
        writer.close().await;

        let events = store.read("job-2").await.expect("read");
        assert_eq!(events.len(), 20);
        for (i, event) in events.iter().enumerate() {
            match &event.kind {
                EventKind::Text { text } => assert_eq!(text, &format!("event {i}")),
                other => panic!("unexpected kind: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn torn_trailing_line_is_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path()).await.expect("store");
        store
            .append("job-3", &Event::text("p", "whole"))
            .await
            .expect("append");
        // Simulate a crash mid-write.
        let path = dir.path().join("sessions/job-3.jsonl");
        let mut raw = std::fs::read_to_string(&path).expect("read");
        raw.push_str(r#"{"timestamp":"2026-01-01T00:"#);
        std::fs::write(&path, raw).expect("write");

        let events = store.read("job-3").await.expect("read");
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn list_reports_completion_and_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path()).await.expect("store");
        store.append("done-job", &Event::done("p", "ok")).await.expect("append");
        store.append("open-job", &Event::text("p", "working")).await.expect("append");

        let summaries = store.list().await.expect("list");
        assert_eq!(summaries.len(), 2);
        let done = summaries.iter().find(|s| s.job_id == "done-job").expect("done");
        assert!(done.completed);
        let open = summaries.iter().find(|s| s.job_id == "open-job").expect("open");
        assert!(!open.completed);
        assert_eq!(open.event_count, 1);
    }
}
