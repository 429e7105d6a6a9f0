use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use futures::future::BoxFuture;

use crate::error::MemoryResult;
use crate::items::ItemStore;
use crate::tiers::{DailyNotes, LongTermMemory};
use crate::types::NewItem;

/// Injected reflector: given the concatenated content of the notes being
/// consolidated, returns persistent facts worth keeping as items.
pub type ReflectorFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Vec<NewItem>>> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidationReport {
    pub notes_archived: usize,
    pub items_created: usize,
}

/// Sweep daily notes older than the cutoff into the archive. The reflector
/// runs before the renames so a crash mid-pass re-consolidates rather than
/// losing notes; renames are the commit.
pub(crate) async fn run_consolidation(
    daily: &DailyNotes,
    long_term: &LongTermMemory,
    store: &ItemStore,
    reflector: Option<&ReflectorFn>,
    cutoff: NaiveDate,
) -> MemoryResult<ConsolidationReport> {
    let old_notes = daily.older_than(cutoff).await?;
    if old_notes.is_empty() {
        return Ok(ConsolidationReport::default());
    }

    let mut combined = String::new();
    for (date, path) in &old_notes {
        combined.push_str(&format!("## {}\n", date.format("%Y-%m-%d")));
        combined.push_str(&daily.read(path).await?);
        combined.push('\n');
    }

    let mut items_created = 0usize;
    if let Some(reflector) = reflector {
        match reflector(combined).await {
            Ok(candidates) => {
                for candidate in candidates {
                    let item = candidate.into_item();
                    store.save(&item).await?;
                    items_created += 1;
                }
            }
            Err(err) => {
                tracing::warn!(%err, "reflector failed; archiving notes without extraction");
            }
        }
    }

    let mut notes_archived = 0usize;
    for (date, _) in &old_notes {
        daily.archive(*date).await?;
        notes_archived += 1;
    }

    let span = format!(
        "{} through {}",
        old_notes.first().map(|(d, _)| d.to_string()).unwrap_or_default(),
        old_notes.last().map(|(d, _)| d.to_string()).unwrap_or_default(),
    );
    long_term
        .append_line(&format!(
            "- {}: consolidated {notes_archived} daily notes ({span}), {items_created} items extracted",
            Utc::now().date_naive()
        ))
        .await?;

    Ok(ConsolidationReport {
        notes_archived,
        items_created,
    })
}
