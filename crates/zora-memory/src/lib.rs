mod error;
mod extract;
mod governance;
mod index;
mod items;
mod manager;
mod tiers;
mod types;

pub use error::{MemoryError, MemoryResult};
pub use extract::{summary_jaccard, validate_candidate, ExtractionFn, ExtractionOutcome};
pub use governance::ConsolidationReport;
pub use index::SearchIndex;
pub use items::{CategoryStore, ItemStore};
pub use manager::{ContextMode, MemoryManager, ReflectorFn, SummarizerFn};
pub use tiers::{DailyNotes, LongTermMemory};
pub use types::{CategorySummary, ItemType, MemoryConfig, MemoryItem, NewItem, SourceType};
