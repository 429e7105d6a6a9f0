use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::MemoryResult;
use crate::types::MemoryItem;

const K1: f64 = 1.2;
const B: f64 = 0.75;
const DELTA: f64 = 1.0;

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexData {
    /// Document id → token count.
    docs: HashMap<String, usize>,
    /// Term → (document id → term frequency).
    postings: HashMap<String, HashMap<String, u32>>,
    total_len: usize,
}

/// Persistent inverted index over item summaries and tags, scored with BM25+.
/// Writers hold the lock across mutate-then-persist; readers may see results
/// one invalidation behind, which is acceptable.
pub struct SearchIndex {
    path: PathBuf,
    data: RwLock<IndexData>,
}

impl SearchIndex {
    pub async fn open(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => IndexData::default(),
        };
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub async fn upsert(&self, item: &MemoryItem) -> MemoryResult<()> {
        let text = index_text(item);
        let mut data = self.data.write().await;
        remove_locked(&mut data, &item.id);
        let tokens = tokenize(&text);
        data.total_len += tokens.len();
        data.docs.insert(item.id.clone(), tokens.len());
        for token in tokens {
            *data
                .postings
                .entry(token)
                .or_default()
                .entry(item.id.clone())
                .or_insert(0) += 1;
        }
        self.persist(&data).await
    }

    pub async fn remove(&self, id: &str) -> MemoryResult<()> {
        let mut data = self.data.write().await;
        remove_locked(&mut data, id);
        self.persist(&data).await
    }

    pub async fn rebuild(&self, items: &[MemoryItem]) -> MemoryResult<()> {
        let mut data = IndexData::default();
        for item in items {
            let tokens = tokenize(&index_text(item));
            data.total_len += tokens.len();
            data.docs.insert(item.id.clone(), tokens.len());
            for token in tokens {
                *data
                    .postings
                    .entry(token)
                    .or_default()
                    .entry(item.id.clone())
                    .or_insert(0) += 1;
            }
        }
        self.persist(&data).await?;
        *self.data.write().await = data;
        Ok(())
    }

    /// BM25+ relevance per document for the query. An empty query scores
    /// nothing.
    pub async fn score(&self, query: &str) -> HashMap<String, f64> {
        let terms = tokenize(query);
        let mut scores: HashMap<String, f64> = HashMap::new();
        if terms.is_empty() {
            return scores;
        }
        let data = self.data.read().await;
        let doc_count = data.docs.len();
        if doc_count == 0 {
            return scores;
        }
        let avg_len = data.total_len as f64 / doc_count as f64;

        for term in terms {
            let Some(posting) = data.postings.get(&term) else {
                continue;
            };
            let df = posting.len() as f64;
            let idf = (((doc_count as f64 - df + 0.5) / (df + 0.5)) + 1.0).ln();
            for (doc_id, &tf) in posting {
                let doc_len = *data.docs.get(doc_id).unwrap_or(&0) as f64;
                let tf = tf as f64;
                let norm = tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * doc_len / avg_len.max(1.0)));
                *scores.entry(doc_id.clone()).or_insert(0.0) += idf * (norm + DELTA);
            }
        }
        scores
    }

    async fn persist(&self, data: &IndexData) -> MemoryResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, serde_json::to_string(data)?).await?;
        Ok(())
    }
}

fn remove_locked(data: &mut IndexData, id: &str) {
    if let Some(len) = data.docs.remove(id) {
        data.total_len = data.total_len.saturating_sub(len);
    }
    data.postings.retain(|_, posting| {
        posting.remove(id);
        !posting.is_empty()
    });
}

fn index_text(item: &MemoryItem) -> String {
    let mut text = item.summary.clone();
    for tag in &item.tags {
        text.push(' ');
        text.push_str(tag);
    }
    text
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() > 1)
        .map(|w| w.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemType, NewItem, SourceType};

    fn item(summary: &str, tags: &[&str]) -> MemoryItem {
        NewItem {
            item_type: ItemType::Knowledge,
            summary: summary.to_string(),
            source: "test".to_string(),
            source_type: SourceType::AgentAnalysis,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            category: None,
        }
        .into_item()
    }

    #[tokio::test]
    async fn relevant_documents_outscore_unrelated_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = SearchIndex::open(dir.path().join("index.json"))
            .await
            .expect("index");
        let rust = item("the build pipeline compiles rust crates with cargo", &["build"]);
        let lunch = item("team lunch happens on thursdays", &[]);
        index.upsert(&rust).await.expect("upsert");
        index.upsert(&lunch).await.expect("upsert");

        let scores = index.score("rust cargo build").await;
        let rust_score = scores.get(&rust.id).copied().unwrap_or(0.0);
        let lunch_score = scores.get(&lunch.id).copied().unwrap_or(0.0);
        assert!(rust_score > lunch_score);
        assert!(rust_score > 0.0);
    }

    #[tokio::test]
    async fn empty_query_scores_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = SearchIndex::open(dir.path().join("index.json"))
            .await
            .expect("index");
        index.upsert(&item("something", &[])).await.expect("upsert");
        assert!(index.score("").await.is_empty());
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.json");
        let doc = item("zora remembers across restarts", &[]);
        {
            let index = SearchIndex::open(&path).await.expect("index");
            index.upsert(&doc).await.expect("upsert");
        }
        let reopened = SearchIndex::open(&path).await.expect("reopen");
        let scores = reopened.score("restarts").await;
        assert!(scores.contains_key(&doc.id));
    }

    #[tokio::test]
    async fn remove_drops_the_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = SearchIndex::open(dir.path().join("index.json"))
            .await
            .expect("index");
        let doc = item("transient entry", &[]);
        index.upsert(&doc).await.expect("upsert");
        index.remove(&doc.id).await.expect("remove");
        assert!(index.score("transient").await.is_empty());
    }
}
