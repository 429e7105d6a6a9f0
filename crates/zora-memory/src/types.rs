use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Knowledge,
    Preference,
    Task,
    Fact,
}

impl ItemType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "knowledge" => Some(ItemType::Knowledge),
            "preference" => Some(ItemType::Preference),
            "task" => Some(ItemType::Task),
            "fact" => Some(ItemType::Fact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    UserInstruction,
    AgentAnalysis,
    ToolOutput,
}

impl SourceType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user_instruction" => Some(SourceType::UserInstruction),
            "agent_analysis" => Some(SourceType::AgentAnalysis),
            "tool_output" => Some(SourceType::ToolOutput),
            _ => None,
        }
    }

    /// Weight applied to salience: what a user said outranks what the agent
    /// inferred, which outranks raw tool output.
    pub fn trust(self) -> f64 {
        match self {
            SourceType::UserInstruction => 1.0,
            SourceType::AgentAnalysis => 0.85,
            SourceType::ToolOutput => 0.7,
        }
    }
}

/// A persistent knowledge unit, stored one-per-file keyed by id. Deletion is
/// soft: items move to the archive directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub summary: String,
    pub source: String,
    pub source_type: SourceType,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Builder input for a new item; ids and timestamps are assigned on persist.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub item_type: ItemType,
    pub summary: String,
    pub source: String,
    pub source_type: SourceType,
    pub tags: Vec<String>,
    pub category: Option<String>,
}

impl NewItem {
    pub fn into_item(self) -> MemoryItem {
        let now = Utc::now();
        MemoryItem {
            id: format!("mem-{}", Uuid::new_v4()),
            item_type: self.item_type,
            summary: self.summary,
            source: self.source,
            source_type: self.source_type,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            tags: self.tags,
            category: self.category,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySummary {
    pub slug: String,
    pub name: String,
    pub summary: String,
    pub item_count: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Daily notes older than this many days are consolidated.
    pub consolidation_days: i64,
    pub extraction_enabled: bool,
    /// Half-life of the recency decay applied to salience.
    pub recency_half_life_days: f64,
    /// Items included in a full context dump.
    pub full_context_items: usize,
    /// Jaccard similarity at or above which an extracted item is a duplicate.
    pub dedup_similarity: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            consolidation_days: 7,
            extraction_enabled: true,
            recency_half_life_days: 14.0,
            full_context_items: 20,
            dedup_similarity: 0.8,
        }
    }
}

pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}
