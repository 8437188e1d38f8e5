//! Error types for Quarry's search core

use thiserror::Error;

/// Result type alias using Quarry's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Search core error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Projection errors (E001-E099)
    #[error("Unsupported model kind '{0}'. Searchable models: card, dashboard, collection, table, database, segment, action, indexed_entity, snippet.")]
    UnsupportedModelKind(String),

    #[error("Entity {model}:{id} not found.")]
    EntityNotFound { model: String, id: i64 },

    // Index errors (E100-E199)
    #[error("Index write failed after {attempts} attempt(s): {reason}")]
    IndexWriteFailed { attempts: u32, reason: String },

    #[error("Search index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Reindex failed: {0}. Run `quarry reindex` to retry.")]
    ReindexFailed(String),

    // Permission errors (E200-E299)
    #[error("Permission resolution failed: {0}")]
    PermissionResolutionFailed(String),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedModelKind(_) => "E001",
            Self::EntityNotFound { .. } => "E002",
            Self::IndexWriteFailed { .. } => "E100",
            Self::IndexUnavailable(_) => "E101",
            Self::ReindexFailed(_) => "E102",
            Self::PermissionResolutionFailed(_) => "E200",
            Self::DatabaseError(_) => "E400",
            Self::Serialization(_) => "E401",
            Self::InvalidInput(_) => "E800",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::IndexUnavailable(_) => Some("quarry config set search.engine in_place".to_string()),
            Self::ReindexFailed(_) => Some("quarry reindex".to_string()),
            Self::EntityNotFound { .. } => Some("quarry put <file.json>".to_string()),
            _ => None,
        }
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DatabaseError(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Database(_)
                    | sqlx::Error::WorkerCrashed
            ),
            Self::IndexWriteFailed { .. } | Self::IndexUnavailable(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}
