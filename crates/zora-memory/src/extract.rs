use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::types::{ItemType, NewItem, SourceType};

/// Injected post-task extraction function: takes the collected task text and
/// returns a JSON array of candidate items.
pub type ExtractionFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionOutcome {
    pub persisted: usize,
    pub skipped_duplicates: usize,
    pub invalid: usize,
}

/// Validate one candidate from the extraction output. Requires a known
/// `type` and a non-empty `summary`; a present-but-invalid enum rejects the
/// candidate rather than being coerced.
pub fn validate_candidate(value: &Value) -> Option<NewItem> {
    let obj = value.as_object()?;
    let item_type = ItemType::parse(obj.get("type")?.as_str()?)?;
    let summary = obj.get("summary")?.as_str()?.trim().to_string();
    if summary.is_empty() {
        return None;
    }
    let source_type = match obj.get("source_type") {
        None => SourceType::AgentAnalysis,
        Some(raw) => SourceType::parse(raw.as_str()?)?,
    };
    let tags = obj
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.as_str())
                .map(|t| t.to_string())
                .collect()
        })
        .unwrap_or_default();
    let category = obj
        .get("category")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string());
    Some(NewItem {
        item_type,
        summary,
        source: obj
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("task_extraction")
            .to_string(),
        source_type,
        tags,
        category,
    })
}

/// Word-set Jaccard similarity between two summaries, used for the ≥ 80%
/// duplicate gate.
pub fn summary_jaccard(a: &str, b: &str) -> f64 {
    let words = |s: &str| -> BTreeSet<String> {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect()
    };
    let set_a = words(a);
    let set_b = words(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidate_requires_type_and_summary() {
        assert!(validate_candidate(&json!({"type": "fact", "summary": "x y"})).is_some());
        assert!(validate_candidate(&json!({"summary": "no type"})).is_none());
        assert!(validate_candidate(&json!({"type": "fact", "summary": "  "})).is_none());
        assert!(validate_candidate(&json!({"type": "opinion", "summary": "bad enum"})).is_none());
    }

    #[test]
    fn invalid_source_type_rejects_the_candidate() {
        let candidate = json!({
            "type": "fact",
            "summary": "user works from Lisbon",
            "source_type": "hearsay"
        });
        assert!(validate_candidate(&candidate).is_none());
    }

    #[test]
    fn jaccard_detects_near_duplicates() {
        let a = "the user prefers dark mode in every editor";
        let b = "the user prefers dark mode in every editor always";
        assert!(summary_jaccard(a, b) >= 0.8);
        let unrelated = "deploys happen from the ci runner";
        assert!(summary_jaccard(a, unrelated) < 0.2);
    }
}
