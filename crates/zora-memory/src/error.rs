use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("memory item not found: {0}")]
    NotFound(String),

    #[error("invalid memory item: {0}")]
    Invalid(String),
}

pub type MemoryResult<T> = Result<T, MemoryError>;
