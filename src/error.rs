//! Error types for Smart-Fork

use thiserror::Error;

/// Result type alias for Smart-Fork operations
pub type Result<T> = std::result::Result<T, SmartForkError>;

/// Main error type for Smart-Fork
#[derive(Error, Debug)]
pub enum SmartForkError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("search error: {0}")]
    Search(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http request error: {0}")]
    #[cfg(feature = "openai")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("service not initialised")]
    NotInitialized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SmartForkError {
    /// Whether the failure is transient and worth retrying on the next
    /// indexing event (spec §7: transient errors are counted, not fatal).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SmartForkError::Embedding(_) | SmartForkError::Io(_)
        )
    }

    /// Single-line, human-readable rendering for the query endpoint's
    /// three user-visible failure shapes (spec §4.9 "Failure", §7
    /// "User-visible failure surface"): `InvalidInput`'s payload and
    /// `NotInitialized` are already complete user-facing sentences
    /// ("please provide a query", "service not initialised"); everything
    /// else is wrapped as "error: <message>".
    pub fn user_message(&self) -> String {
        match self {
            SmartForkError::InvalidInput(msg) => msg.clone(),
            SmartForkError::NotInitialized => "service not initialised".to_string(),
            other => format!("error: {}", other),
        }
    }
}
