use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy file: {0}")]
    InvalidConfig(String),

    /// The entry can never be granted: it is on the permanent deny-list.
    #[error("permanently denied: {0}")]
    PermanentDenial(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
