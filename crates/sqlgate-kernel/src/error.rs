use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("allow-list load failed: {0}")]
    SchemaLoad(String),
    #[error("unknown relation: {0}")]
    UnknownRelation(String),
}

/// Failure reported by a synthesizer or executor collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BoundaryError {
    #[error("boundary call timed out")]
    Timeout,
    #[error("boundary call cancelled")]
    Cancelled,
    #[error("boundary unavailable: {0}")]
    Unavailable(String),
    #[error("boundary call failed: {0}")]
    Failed(String),
}
