//! Search domain module
//!
//! Projects BI entities into search documents, keeps them in a
//! generation-versioned index and answers ranked, permission-filtered
//! searches.
//!
//! # Architecture
//!
//! - **Entities**: `SearchableEntity` and `EntityChange`, projected into
//!   `SearchDocument` by `EntityProjector`
//! - **Engines**: `SqliteIndexStore` (persistent, generation swap) and
//!   `InPlaceEngine` (query-time scan), both ranked by `Ranker`
//! - **Ingestion**: `IngestionPipeline`, synchronous or batched
//! - **Reindex**: `ReindexCoordinator` builds a new generation in the
//!   background and swaps it in
//! - **Service**: `SearchService` picks the engine, falls back, filters by
//!   permission and paginates
//!
//! # Example
//!
//! ```ignore
//! use quarry_core::domain::search::{PrincipalPermissions, SearchContext, SearchService, Principal};
//! use std::sync::Arc;
//!
//! let service = SearchService::from_config(&db, Arc::new(PrincipalPermissions), &config.search).await?;
//!
//! let ctx = SearchContext::new("revenue", Principal::superuser(1)).with_pagination(20, 0);
//! let page = service.search(&ctx).await?;
//!
//! // Rebuild the index without interrupting searches
//! let handle = service.reindex().await?;
//! let status = handle.wait().await;
//! ```

pub mod context;
pub mod document;
pub mod entity;
pub mod generation;
pub mod in_place;
pub mod ingestion;
pub mod permission;
pub mod projector;
pub mod reindex;
pub mod retry;
pub mod scoring;
pub mod service;
pub mod source;
pub mod specification;
pub mod store;

// Re-export main types
pub use context::{
    AccessLevel, ArchivedFilter, Pagination, PermissionSet, Principal, SearchContext,
};
pub use document::{DataScope, DocKey, PermissionScope, RankingSignals, SearchDocument};
pub use entity::{ChangeKind, EntityChange, ModelKind, SearchableEntity};
pub use generation::{GenerationPointer, GenerationStatus, IndexGeneration};
pub use in_place::InPlaceEngine;
pub use ingestion::{
    IngestOutcome, IngestionMetrics, IngestionMode, IngestionPipeline, IngestionSnapshot,
};
pub use permission::{PermissionFilter, PermissionService, PrincipalPermissions};
pub use projector::EntityProjector;
pub use reindex::{ReindexCoordinator, ReindexHandle, ReindexStatus, reindex_and_wait};
pub use retry::RetryPolicy;
pub use scoring::{PreparedQuery, Ranker, ScoredDocument};
pub use service::{IndexStatus, SearchPage, SearchService};
pub use source::{EntitySource, InMemoryEntitySource, ScanBatch, SqliteEntitySource};
pub use specification::{
    ArchivedSpec, CollectionScopeSpec, ModelKindSpec, SearchSpecBuilder, TextMatchSpec,
};
pub use store::{
    EngineCapability, EngineOutput, GenerationInfo, IndexStore, SearchBackend, SqliteIndexStore,
};
