//! Quarry Core Library
//!
//! The search and indexing core of the Quarry BI server:
//! - Entity projection into search documents
//! - Generation-versioned SQLite index with atomic swap-over
//! - In-place scan engine used when no index is available
//! - Synchronous and batched ingestion of entity changes
//! - Ranking, permission filtering and pagination
//! - Configuration and storage

pub mod config;
pub mod domain;
pub mod error;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::search::{
        EngineCapability, Principal, SearchContext, SearchPage, SearchService,
    };
    pub use crate::error::{Error, Result};
}
