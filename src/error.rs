//! Error types for Reverie

use thiserror::Error;

/// Main error type for the memory and reasoning core
#[derive(Error, Debug)]
pub enum ReverieError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A store transaction kept conflicting after its retry budget was spent
    #[error("Store conflict on {stream} after {attempts} attempts")]
    StoreConflict { stream: String, attempts: u32 },

    /// Malformed caller input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Input exceeds its token budget
    #[error("{field} is {tokens} tokens, limit is {limit}")]
    TokenLimit {
        field: &'static str,
        tokens: usize,
        limit: usize,
    },

    /// Upstream service answered with a non-success status
    #[error("{service} returned {status}: {message}")]
    Upstream {
        service: &'static str,
        status: u16,
        message: String,
    },

    /// Upstream service kept rate limiting after the whole backoff schedule
    #[error("{service} rate limited after {attempts} attempts")]
    RateLimited { service: &'static str, attempts: usize },

    /// Network transport failed
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Operation did not finish in time
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    /// Malformed upstream payload
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ReverieError {
    /// True when the error is a transient write conflict the store should retry:
    /// SQLite busy/locked, or a lost race on a `(doc_id, lvl, idx)` key.
    pub fn is_retryable_conflict(&self) -> bool {
        match self {
            ReverieError::Database(sqlx::Error::Database(db)) => {
                if db.is_unique_violation() {
                    return true;
                }
                // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
                matches!(
                    db.code().as_deref(),
                    Some("5") | Some("6") | Some("261") | Some("517") | Some("262")
                )
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ReverieError {
    fn from(e: serde_json::Error) -> Self {
        ReverieError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for ReverieError {
    fn from(e: bincode::Error) -> Self {
        ReverieError::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ReverieError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_limit_message_names_the_field() {
        let err = ReverieError::TokenLimit {
            field: "query",
            tokens: 900,
            limit: 512,
        };
        assert_eq!(err.to_string(), "query is 900 tokens, limit is 512");
    }

    #[test]
    fn validation_is_not_a_conflict() {
        assert!(!ReverieError::Validation("bad".into()).is_retryable_conflict());
    }
}
