use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::BoxFuture;

use crate::error::MemoryResult;
use crate::extract::{summary_jaccard, validate_candidate, ExtractionFn, ExtractionOutcome};
use crate::governance::{run_consolidation, ConsolidationReport};
pub use crate::governance::ReflectorFn;
use crate::index::SearchIndex;
use crate::items::{CategoryStore, ItemStore};
use crate::tiers::{DailyNotes, LongTermMemory};
use crate::types::{MemoryConfig, MemoryItem, NewItem};

/// Injected LLM-backed summarization for category records.
pub type SummarizerFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// How much context a caller wants loaded up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// A progressive index plus the curated long-term file; details are
    /// fetched on demand through the memory tools.
    Progressive,
    /// Category summaries and the top salient items for batch use.
    Full { days: u32 },
}

/// Facade over the three memory tiers, the structured item store and the
/// search index.
pub struct MemoryManager {
    config: MemoryConfig,
    store: ItemStore,
    categories: CategoryStore,
    index: SearchIndex,
    long_term: LongTermMemory,
    daily: DailyNotes,
    index_dirty: AtomicBool,
    reflector: Option<ReflectorFn>,
    summarizer: Option<SummarizerFn>,
    extractor: Option<ExtractionFn>,
    write_lock: tokio::sync::Mutex<()>,
}

impl MemoryManager {
    pub async fn new(memory_dir: impl AsRef<Path>, config: MemoryConfig) -> MemoryResult<Self> {
        let memory_dir = memory_dir.as_ref();
        Ok(Self {
            config,
            store: ItemStore::new(memory_dir.join("items")).await?,
            categories: CategoryStore::new(memory_dir.join("categories")).await?,
            index: SearchIndex::open(memory_dir.join(".memory-index.json")).await?,
            long_term: LongTermMemory::new(memory_dir),
            daily: DailyNotes::new(memory_dir.join("daily")).await?,
            index_dirty: AtomicBool::new(true),
            reflector: None,
            summarizer: None,
            extractor: None,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with_reflector(mut self, f: ReflectorFn) -> Self {
        self.reflector = Some(f);
        self
    }

    pub fn with_summarizer(mut self, f: SummarizerFn) -> Self {
        self.summarizer = Some(f);
        self
    }

    pub fn with_extractor(mut self, f: ExtractionFn) -> Self {
        self.extractor = Some(f);
        self
    }

    pub fn extraction_enabled(&self) -> bool {
        self.config.extraction_enabled && self.extractor.is_some()
    }

    /// Build the context block injected into a task's system prompt.
    pub async fn load_context(&self, mode: ContextMode) -> MemoryResult<String> {
        let long_term = self.long_term.read().await?;
        let mut out = String::new();
        if !long_term.trim().is_empty() {
            out.push_str("## Long-term memory\n");
            out.push_str(long_term.trim_end());
            out.push_str("\n\n");
        }
        match mode {
            ContextMode::Progressive => {
                let item_count = self.store.count().await?;
                let categories = self.categories.list().await?;
                let mut category_names = categories
                    .iter()
                    .map(|c| c.name.clone())
                    .collect::<Vec<_>>()
                    .join(", ");
                if category_names.is_empty() {
                    category_names = "none".to_string();
                }
                let recent = self
                    .daily
                    .most_recent_date()
                    .await
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "none".to_string());
                out.push_str("## Memory index\n");
                out.push_str(&format!(
                    "{item_count} structured items; categories: {category_names}; \
                     most recent daily note: {recent}.\n"
                ));
                out.push_str(
                    "Use the memory_search, recall_context and memory_save tools to retrieve \
                     and record details on demand instead of assuming they are present here.\n",
                );
            }
            ContextMode::Full { days } => {
                let categories = self.categories.list().await?;
                if !categories.is_empty() {
                    out.push_str("## Categories\n");
                    for category in categories {
                        out.push_str(&format!("- {}: {}\n", category.name, category.summary));
                    }
                    out.push('\n');
                }
                let mut items = self.store.list().await?;
                let now = Utc::now();
                let horizon = now - Duration::days(i64::from(days));
                items.retain(|i| i.last_accessed >= horizon || i.created_at >= horizon);
                let mut ranked: Vec<(MemoryItem, f64)> = items
                    .into_iter()
                    .map(|item| {
                        let score = self.salience(&item, 1.0);
                        (item, score)
                    })
                    .collect();
                ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                ranked.truncate(self.config.full_context_items);
                if !ranked.is_empty() {
                    out.push_str("## Salient items\n");
                    for (item, _) in ranked {
                        out.push_str(&format!("- [{}] {}\n", item.id, item.summary));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Salience-ranked search. This is a peek: access counters do not move.
    pub async fn recall(&self, query: &str, limit: usize) -> MemoryResult<Vec<(MemoryItem, f64)>> {
        self.ensure_index().await?;
        let relevance = self.index.score(query).await;
        if relevance.is_empty() {
            return Ok(Vec::new());
        }
        let items = self.store.list().await?;
        let mut scored: Vec<(MemoryItem, f64)> = items
            .into_iter()
            .filter_map(|item| {
                let relevance = *relevance.get(&item.id)?;
                let score = self.salience(&item, relevance);
                (score > 0.0).then_some((item, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        if limit > 0 {
            scored.truncate(limit);
        }
        Ok(scored)
    }

    /// A real retrieval: bumps the access counter.
    pub async fn get_item(&self, id: &str) -> MemoryResult<MemoryItem> {
        self.store.touch(id).await
    }

    pub async fn create_item(&self, new: NewItem) -> MemoryResult<MemoryItem> {
        let _guard = self.write_lock.lock().await;
        let item = new.into_item();
        self.store.save(&item).await?;
        self.index.upsert(&item).await?;
        if let Some(category) = &item.category {
            let summary = self.summarize_category(category).await;
            self.categories.record_item(category, summary).await?;
        }
        Ok(item)
    }

    pub async fn archive_item(&self, id: &str) -> MemoryResult<()> {
        let _guard = self.write_lock.lock().await;
        self.store.archive(id).await?;
        self.index.remove(id).await?;
        Ok(())
    }

    /// Daily sweep: move old notes to the archive, distill them into items,
    /// then invalidate the index cache.
    pub async fn consolidate(&self) -> MemoryResult<ConsolidationReport> {
        let _guard = self.write_lock.lock().await;
        let cutoff = (Utc::now() - Duration::days(self.config.consolidation_days)).date_naive();
        let report = run_consolidation(
            &self.daily,
            &self.long_term,
            &self.store,
            self.reflector.as_ref(),
            cutoff,
        )
        .await?;
        if report.items_created > 0 {
            self.index_dirty.store(true, Ordering::SeqCst);
        }
        Ok(report)
    }

    /// Post-task extraction: validate candidates from the injected extractor,
    /// drop near-duplicates, persist the rest.
    pub async fn extract_after_task(
        &self,
        job_id: &str,
        texts: Vec<String>,
    ) -> MemoryResult<ExtractionOutcome> {
        let mut outcome = ExtractionOutcome::default();
        let Some(extractor) = &self.extractor else {
            return Ok(outcome);
        };
        if !self.config.extraction_enabled || texts.is_empty() {
            return Ok(outcome);
        }
        let raw = match extractor(texts.join("\n")).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(job_id, %err, "memory extraction failed");
                return Ok(outcome);
            }
        };
        let candidates = match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(serde_json::Value::Array(items)) => items,
            _ => {
                tracing::warn!(job_id, "extractor returned something other than a JSON array");
                return Ok(outcome);
            }
        };

        let existing = self.store.list().await?;
        let mut known: Vec<String> = existing.iter().map(|i| i.summary.clone()).collect();
        for candidate in candidates {
            let Some(new_item) = validate_candidate(&candidate) else {
                outcome.invalid += 1;
                continue;
            };
            let duplicate = known
                .iter()
                .any(|s| summary_jaccard(s, &new_item.summary) >= self.config.dedup_similarity);
            if duplicate {
                outcome.skipped_duplicates += 1;
                continue;
            }
            known.push(new_item.summary.clone());
            self.create_item(new_item).await?;
            outcome.persisted += 1;
        }

        if outcome.persisted > 0 {
            self.daily
                .append(&format!(
                    "- extracted {} memory items from task {job_id}",
                    outcome.persisted
                ))
                .await?;
        }
        Ok(outcome)
    }

    pub async fn note_task_completion(&self, job_id: &str, summary: &str) -> MemoryResult<()> {
        let line = format!("- task {job_id} completed: {}", first_line(summary, 160));
        self.daily.append(&line).await
    }

    fn salience(&self, item: &MemoryItem, relevance: f64) -> f64 {
        let age_days = (Utc::now() - item.last_accessed).num_seconds() as f64 / 86_400.0;
        let recency = 0.5_f64.powf(age_days.max(0.0) / self.config.recency_half_life_days);
        let frequency = 1.0 + (1.0 + item.access_count as f64).log2() * 0.15;
        relevance * recency * frequency * item.source_type.trust()
    }

    async fn ensure_index(&self) -> MemoryResult<()> {
        if self.index_dirty.swap(false, Ordering::SeqCst) {
            let items = self.store.list().await?;
            self.index.rebuild(&items).await?;
        }
        Ok(())
    }

    async fn summarize_category(&self, category: &str) -> Option<String> {
        let summarizer = self.summarizer.as_ref()?;
        let items = self.store.list().await.ok()?;
        let joined = items
            .iter()
            .filter(|i| i.category.as_deref() == Some(category))
            .map(|i| i.summary.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        match summarizer(joined).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                tracing::warn!(category, %err, "category summarization failed");
                None
            }
        }
    }
}

fn first_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.len() <= max {
        line.to_string()
    } else {
        let mut cut = max;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &line[..cut])
    }
}
