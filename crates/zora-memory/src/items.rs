use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;

use crate::error::{MemoryError, MemoryResult};
use crate::types::{slugify, CategorySummary, MemoryItem};

/// One JSON file per item under `memory/items/`. Soft deletion moves the
/// file into `archive/`.
#[derive(Debug, Clone)]
pub struct ItemStore {
    dir: PathBuf,
}

impl ItemStore {
    pub async fn new(dir: impl AsRef<Path>) -> MemoryResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join("archive")).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn save(&self, item: &MemoryItem) -> MemoryResult<()> {
        let payload = serde_json::to_string_pretty(item)?;
        fs::write(self.path_for(&item.id), payload).await?;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> MemoryResult<MemoryItem> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(MemoryError::NotFound(id.to_string()));
        }
        let raw = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// All live (non-archived) items. Unparsable files are skipped with a
    /// warning rather than failing the listing.
    pub async fn list(&self) -> MemoryResult<Vec<MemoryItem>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "unreadable memory item");
                    continue;
                }
            };
            match serde_json::from_str::<MemoryItem>(&raw) {
                Ok(item) => out.push(item),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "unparsable memory item");
                }
            }
        }
        Ok(out)
    }

    pub async fn count(&self) -> MemoryResult<usize> {
        Ok(self.list().await?.len())
    }

    /// Record a real retrieval (a "get", not a "peek"): bump the access
    /// counter and last-accessed stamp, persist, return the updated item.
    pub async fn touch(&self, id: &str) -> MemoryResult<MemoryItem> {
        let mut item = self.load(id).await?;
        item.access_count = item.access_count.saturating_add(1);
        item.last_accessed = Utc::now();
        self.save(&item).await?;
        Ok(item)
    }

    /// Soft delete: rename into the archive subdirectory.
    pub async fn archive(&self, id: &str) -> MemoryResult<()> {
        let from = self.path_for(id);
        if !from.exists() {
            return Err(MemoryError::NotFound(id.to_string()));
        }
        let to = self.dir.join("archive").join(format!("{id}.json"));
        fs::rename(from, to).await?;
        Ok(())
    }
}

/// Category summary files under `memory/categories/<slug>.json`.
#[derive(Debug, Clone)]
pub struct CategoryStore {
    dir: PathBuf,
}

impl CategoryStore {
    pub async fn new(dir: impl AsRef<Path>) -> MemoryResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, slug: &str) -> PathBuf {
        self.dir.join(format!("{slug}.json"))
    }

    pub async fn get(&self, name: &str) -> Option<CategorySummary> {
        let raw = fs::read_to_string(self.path_for(&slugify(name))).await.ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn list(&self) -> MemoryResult<Vec<CategorySummary>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(raw) = fs::read_to_string(&path).await {
                if let Ok(summary) = serde_json::from_str::<CategorySummary>(&raw) {
                    out.push(summary);
                }
            }
        }
        out.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(out)
    }

    /// Fold a newly persisted item into its category record. The summary text
    /// is replaced by the injected summarizer when one is supplied; otherwise
    /// a counter line stands in.
    pub async fn record_item(
        &self,
        name: &str,
        summary_text: Option<String>,
    ) -> MemoryResult<CategorySummary> {
        let slug = slugify(name);
        let mut entry = self.get(name).await.unwrap_or(CategorySummary {
            slug: slug.clone(),
            name: name.to_string(),
            summary: String::new(),
            item_count: 0,
            updated_at: Utc::now(),
        });
        entry.item_count += 1;
        entry.updated_at = Utc::now();
        entry.summary = summary_text
            .unwrap_or_else(|| format!("{} items filed under {}", entry.item_count, entry.name));
        let payload = serde_json::to_string_pretty(&entry)?;
        fs::write(self.path_for(&slug), payload).await?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemType, NewItem, SourceType};

    fn item(summary: &str) -> MemoryItem {
        NewItem {
            item_type: ItemType::Fact,
            summary: summary.to_string(),
            source: "test".to_string(),
            source_type: SourceType::AgentAnalysis,
            tags: Vec::new(),
            category: None,
        }
        .into_item()
    }

    #[tokio::test]
    async fn save_load_and_touch_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ItemStore::new(dir.path()).await.expect("store");
        let original = item("the build uses cargo nextest");
        store.save(&original).await.expect("save");

        let loaded = store.load(&original.id).await.expect("load");
        assert_eq!(loaded.access_count, 0);

        let touched = store.touch(&original.id).await.expect("touch");
        assert_eq!(touched.access_count, 1);
        let reloaded = store.load(&original.id).await.expect("reload");
        assert_eq!(reloaded.access_count, 1);
    }

    #[tokio::test]
    async fn archive_is_a_soft_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ItemStore::new(dir.path()).await.expect("store");
        let original = item("temporary");
        store.save(&original).await.expect("save");
        store.archive(&original.id).await.expect("archive");

        assert!(matches!(
            store.load(&original.id).await,
            Err(MemoryError::NotFound(_))
        ));
        assert!(dir
            .path()
            .join("archive")
            .join(format!("{}.json", original.id))
            .exists());
        assert_eq!(store.list().await.expect("list").len(), 0);
    }

    #[tokio::test]
    async fn category_record_counts_items() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CategoryStore::new(dir.path()).await.expect("store");
        store.record_item("Build Tools", None).await.expect("record");
        let entry = store.record_item("Build Tools", None).await.expect("record");
        assert_eq!(entry.item_count, 2);
        assert_eq!(entry.slug, "build-tools");
        assert_eq!(store.list().await.expect("list").len(), 1);
    }
}
