use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::error::MemoryResult;

#[derive(Debug, Serialize, Deserialize)]
struct IntegrityBaseline {
    sha256: String,
    updated_at: DateTime<Utc>,
}

/// Tier 1: a single human-editable markdown file with an integrity baseline
/// kept alongside it. A mismatch means someone edited the file out-of-band;
/// that is logged and accepted, never an error.
#[derive(Debug, Clone)]
pub struct LongTermMemory {
    file: PathBuf,
    baseline: PathBuf,
}

impl LongTermMemory {
    pub fn new(memory_dir: &Path) -> Self {
        Self {
            file: memory_dir.join("MEMORY.md"),
            baseline: memory_dir.join(".memory-integrity.json"),
        }
    }

    pub async fn read(&self) -> MemoryResult<String> {
        let content = match fs::read_to_string(&self.file).await {
            Ok(content) => content,
            Err(_) => return Ok(String::new()),
        };
        let digest = hex_digest(&content);
        match self.load_baseline().await {
            Some(baseline) if baseline.sha256 != digest => {
                tracing::warn!(
                    file = %self.file.display(),
                    "long-term memory changed outside the engine; accepting the edit"
                );
                self.write_baseline(&digest).await?;
            }
            Some(_) => {}
            None => self.write_baseline(&digest).await?,
        }
        Ok(content)
    }

    pub async fn append_line(&self, line: &str) -> MemoryResult<()> {
        let mut content = match fs::read_to_string(&self.file).await {
            Ok(content) => content,
            Err(_) => String::new(),
        };
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(line);
        content.push('\n');
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.file, &content).await?;
        self.write_baseline(&hex_digest(&content)).await
    }

    pub async fn refresh_baseline(&self) -> MemoryResult<()> {
        let content = fs::read_to_string(&self.file).await.unwrap_or_default();
        self.write_baseline(&hex_digest(&content)).await
    }

    async fn load_baseline(&self) -> Option<IntegrityBaseline> {
        let raw = fs::read_to_string(&self.baseline).await.ok()?;
        serde_json::from_str(&raw).ok()
    }

    async fn write_baseline(&self, digest: &str) -> MemoryResult<()> {
        if let Some(parent) = self.baseline.parent() {
            fs::create_dir_all(parent).await?;
        }
        let baseline = IntegrityBaseline {
            sha256: digest.to_string(),
            updated_at: Utc::now(),
        };
        fs::write(&self.baseline, serde_json::to_string_pretty(&baseline)?).await?;
        Ok(())
    }
}

fn hex_digest(content: &str) -> String {
    Sha256::digest(content.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Tier 2: one append-only markdown file per calendar day under
/// `memory/daily/`, with consolidated files moved into `archive/`.
#[derive(Debug, Clone)]
pub struct DailyNotes {
    dir: PathBuf,
}

impl DailyNotes {
    pub async fn new(dir: impl AsRef<Path>) -> MemoryResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join("archive")).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    pub async fn append(&self, line: &str) -> MemoryResult<()> {
        let today = Utc::now().date_naive();
        let path = self.path_for(today);
        let mut content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => format!("# {}\n\n", today.format("%Y-%m-%d")),
        };
        content.push_str(line);
        content.push('\n');
        fs::write(&path, content).await?;
        Ok(())
    }

    pub async fn most_recent_date(&self) -> Option<NaiveDate> {
        self.dates().await.ok()?.into_iter().max()
    }

    async fn dates(&self) -> MemoryResult<Vec<NaiveDate>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(date) = parse_note_date(&path) {
                out.push(date);
            }
        }
        Ok(out)
    }

    /// Notes strictly older than the cutoff, oldest first.
    pub async fn older_than(&self, cutoff: NaiveDate) -> MemoryResult<Vec<(NaiveDate, PathBuf)>> {
        let mut out: Vec<(NaiveDate, PathBuf)> = self
            .dates()
            .await?
            .into_iter()
            .filter(|d| *d < cutoff)
            .map(|d| (d, self.path_for(d)))
            .collect();
        out.sort_by_key(|(d, _)| *d);
        Ok(out)
    }

    pub async fn read(&self, path: &Path) -> MemoryResult<String> {
        Ok(fs::read_to_string(path).await?)
    }

    /// The rename is the commit: a note is either live or archived, never
    /// both.
    pub async fn archive(&self, date: NaiveDate) -> MemoryResult<()> {
        let from = self.path_for(date);
        let to = self
            .dir
            .join("archive")
            .join(format!("{}.md", date.format("%Y-%m-%d")));
        fs::rename(from, to).await?;
        Ok(())
    }
}

fn parse_note_date(path: &Path) -> Option<NaiveDate> {
    let stem = path.file_stem()?.to_str()?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn integrity_mismatch_warns_and_rebaselines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = LongTermMemory::new(dir.path());
        memory.append_line("- remembers the basics").await.expect("append");

        // Out-of-band edit.
        std::fs::write(dir.path().join("MEMORY.md"), "- hand edited\n").expect("edit");
        let content = memory.read().await.expect("read never throws");
        assert_eq!(content, "- hand edited\n");

        // Second read sees the refreshed baseline and stays quiet.
        let content = memory.read().await.expect("read");
        assert_eq!(content, "- hand edited\n");
    }

    #[tokio::test]
    async fn missing_memory_file_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = LongTermMemory::new(dir.path());
        assert_eq!(memory.read().await.expect("read"), "");
    }

    #[tokio::test]
    async fn daily_notes_append_and_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let notes = DailyNotes::new(dir.path().join("daily")).await.expect("notes");
        notes.append("- finished the report").await.expect("append");
        notes.append("- started the deploy").await.expect("append");

        let today = Utc::now().date_naive();
        assert_eq!(notes.most_recent_date().await, Some(today));
        let content = notes
            .read(&dir.path().join("daily").join(format!("{}.md", today.format("%Y-%m-%d"))))
            .await
            .expect("read");
        assert!(content.contains("finished the report"));
        assert!(content.contains("started the deploy"));

        notes.archive(today).await.expect("archive");
        assert_eq!(notes.most_recent_date().await, None);
        assert!(dir
            .path()
            .join("daily/archive")
            .join(format!("{}.md", today.format("%Y-%m-%d")))
            .exists());
    }

    #[tokio::test]
    async fn older_than_filters_and_sorts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let daily = dir.path().join("daily");
        let notes = DailyNotes::new(&daily).await.expect("notes");
        for date in ["2026-07-01", "2026-07-15", "2026-07-28"] {
            std::fs::write(daily.join(format!("{date}.md")), "x").expect("write");
        }
        let cutoff = NaiveDate::from_ymd_opt(2026, 7, 20).expect("date");
        let old = notes.older_than(cutoff).await.expect("older_than");
        assert_eq!(old.len(), 2);
        assert_eq!(old[0].0, NaiveDate::from_ymd_opt(2026, 7, 1).expect("date"));
    }
}
