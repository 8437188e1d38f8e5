//! Search engine facade
//!
//! Dispatches a request to the engine chosen at startup, falls back to the
//! in-place scan when the index cannot serve, applies permission filtering
//! and paginates. Also owns the ingestion pipeline and the reindex
//! coordinator so callers deal with a single entry point.

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;

use super::context::SearchContext;
use super::entity::EntityChange;
use super::generation::IndexGeneration;
use super::in_place::InPlaceEngine;
use super::ingestion::{IngestOutcome, IngestionMode, IngestionPipeline, IngestionSnapshot};
use super::permission::{PermissionFilter, PermissionService};
use super::reindex::{ReindexCoordinator, ReindexHandle, ReindexStatus};
use super::retry::RetryPolicy;
use super::scoring::{Ranker, ScoredDocument};
use super::source::{EntitySource, SqliteEntitySource};
use super::specification::SearchSpecBuilder;
use super::store::{EngineCapability, EngineOutput, IndexStore, SearchBackend, SqliteIndexStore};
use crate::config::SearchConfig;
use crate::error::{Error, Result};
use crate::storage::Database;

/// One page of visible results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    /// Results on this page, in rank order
    pub results: Vec<ScoredDocument>,
    /// Visible results across all pages
    pub total: usize,
    /// Engine that produced the results
    pub engine: EngineCapability,
    /// Generation read by the persistent engine
    pub generation: Option<IndexGeneration>,
}

/// Snapshot of the index for administrative callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub engine: EngineCapability,
    pub generation: Option<IndexGeneration>,
    pub documents: Option<u64>,
    pub reindex: Option<ReindexStatus>,
    pub ingestion: Option<IngestionSnapshot>,
}

/// Index-backed parts of the facade
struct IndexParts {
    store: Arc<dyn IndexStore>,
    ingestion: IngestionPipeline,
    reindex: ReindexCoordinator,
}

/// Single entry point for search, ingestion and reindexing
pub struct SearchService {
    capability: EngineCapability,
    in_place: InPlaceEngine,
    permissions: PermissionFilter,
    index: Option<IndexParts>,
    max_candidates: usize,
}

impl SearchService {
    /// Wire a facade around an already resolved capability
    ///
    /// `Persistent` requires an index store; `InPlace` ignores one.
    pub fn new(
        capability: EngineCapability,
        index: Option<Arc<dyn IndexStore>>,
        source: Arc<dyn EntitySource>,
        permissions: Arc<dyn PermissionService>,
        config: &SearchConfig,
    ) -> Result<Self> {
        let ranker = Ranker::new(config.ranking.clone());
        let in_place = InPlaceEngine::new(Arc::clone(&source), ranker);
        let retry = RetryPolicy::from_config(&config.retry);

        let index = match (capability, index) {
            (EngineCapability::InPlace, _) => None,
            (EngineCapability::Persistent, None) => {
                return Err(Error::IndexUnavailable(
                    "persistent engine requested without an index store".to_string(),
                ));
            }
            (EngineCapability::Persistent, Some(store)) => Some(IndexParts {
                ingestion: IngestionPipeline::new(
                    Arc::clone(&source),
                    Arc::clone(&store),
                    IngestionMode::from_config(&config.ingestion),
                    retry,
                ),
                reindex: ReindexCoordinator::new(Arc::clone(&source), Arc::clone(&store), retry),
                store,
            }),
        };

        tracing::info!(engine = %capability, "Search service ready");
        Ok(Self {
            capability,
            in_place,
            permissions: PermissionFilter::new(permissions),
            index,
            max_candidates: config.max_candidates.max(1),
        })
    }

    /// Open the facade over the application database
    ///
    /// Entities are read from `app_entity`; the persistent engine is opened
    /// only when `capability` asks for it.
    pub async fn open(
        pool: SqlitePool,
        capability: EngineCapability,
        permissions: Arc<dyn PermissionService>,
        config: &SearchConfig,
    ) -> Result<Self> {
        let source: Arc<dyn EntitySource> = Arc::new(SqliteEntitySource::new(pool.clone()));
        let store: Option<Arc<dyn IndexStore>> = match capability {
            EngineCapability::Persistent => Some(Arc::new(
                SqliteIndexStore::open(pool, Ranker::new(config.ranking.clone())).await?,
            )),
            EngineCapability::InPlace => None,
        };
        Self::new(capability, store, source, permissions, config)
    }

    /// Resolve the capability from configuration, then open
    pub async fn from_config(
        database: &Database,
        permissions: Arc<dyn PermissionService>,
        config: &SearchConfig,
    ) -> Result<Self> {
        let capability = EngineCapability::resolve(config, database).await?;
        Self::open(database.pool().clone(), capability, permissions, config).await
    }

    pub fn capability(&self) -> EngineCapability {
        self.capability
    }

    /// Run a search and return one page of visible results
    pub async fn search(&self, ctx: &SearchContext) -> Result<SearchPage> {
        let (engine, output) = self.execute(ctx).await?;

        // Engines pre-filter; this keeps the contract independent of them
        let spec = SearchSpecBuilder::for_context(ctx);
        let candidates: Vec<ScoredDocument> = output
            .results
            .into_iter()
            .filter(|r| spec.is_satisfied_by(&r.document))
            .collect();

        let mut visible = self.permissions.filter(ctx, candidates).await;
        let total = visible.len();
        if total > self.max_candidates {
            tracing::warn!(
                total,
                max_candidates = self.max_candidates,
                "Visible results exceed the candidate limit; deeper pages are not served"
            );
            visible.truncate(self.max_candidates);
        }
        let results = ctx.pagination().apply(visible);

        tracing::debug!(
            engine = %engine,
            total,
            returned = results.len(),
            "Search completed"
        );

        Ok(SearchPage {
            results,
            total,
            engine,
            generation: output.generation,
        })
    }

    /// Lazily run the search and yield the page's results one by one
    ///
    /// Nothing executes until the stream is first polled. Each call runs the
    /// search again; a stream cannot be restarted once exhausted.
    pub fn stream(&self, ctx: SearchContext) -> impl Stream<Item = Result<ScoredDocument>> + '_ {
        async_stream::stream! {
            match self.search(&ctx).await {
                Ok(page) => {
                    for item in page.results {
                        yield Ok(item);
                    }
                }
                Err(e) => yield Err(e),
            }
        }
    }

    async fn execute(&self, ctx: &SearchContext) -> Result<(EngineCapability, EngineOutput)> {
        let Some(index) = &self.index else {
            let output = self.in_place.query(ctx).await?;
            return Ok((EngineCapability::InPlace, output));
        };

        match index.store.query(ctx).await {
            Ok(output) => Ok((EngineCapability::Persistent, output)),
            Err(e @ (Error::IndexUnavailable(_) | Error::DatabaseError(_))) => {
                tracing::warn!(error = %e, "Search index failed, falling back to in-place engine");
                let output = self.in_place.query(ctx).await?;
                Ok((EngineCapability::InPlace, output))
            }
            Err(e) => Err(e),
        }
    }

    /// Forward an entity change to the ingestion pipeline
    pub async fn on_entity_changed(&self, change: EntityChange) -> IngestOutcome {
        match &self.index {
            Some(index) => index.ingestion.on_entity_changed(change).await,
            None => IngestOutcome::Skipped,
        }
    }

    /// Apply a change immediately, reporting write failures
    pub async fn apply_change(&self, change: EntityChange) -> Result<IngestOutcome> {
        match &self.index {
            Some(index) => index.ingestion.apply(change).await,
            None => Ok(IngestOutcome::Skipped),
        }
    }

    /// Drain queued changes into the index
    pub async fn flush(&self) -> Result<()> {
        match &self.index {
            Some(index) => index.ingestion.flush().await,
            None => Ok(()),
        }
    }

    /// Start a full rebuild, or join the one already running
    pub async fn reindex(&self) -> Result<ReindexHandle> {
        match &self.index {
            Some(index) => Ok(index.reindex.start().await),
            None => Err(Error::IndexUnavailable(
                "the in-place engine has no index to rebuild".to_string(),
            )),
        }
    }

    pub async fn index_status(&self) -> Result<IndexStatus> {
        let Some(index) = &self.index else {
            return Ok(IndexStatus {
                engine: self.capability,
                generation: None,
                documents: None,
                reindex: None,
                ingestion: None,
            });
        };

        let generation = index.store.current_generation();
        let documents = index.store.document_count(generation).await?;
        let reindex = index.reindex.current().await.map(|handle| handle.status());

        Ok(IndexStatus {
            engine: self.capability,
            generation: Some(generation),
            documents: Some(documents),
            reindex,
            ingestion: Some(index.ingestion.metrics()),
        })
    }

    /// Stop background work, draining queued changes first
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(index) = &self.index {
            if let Some(handle) = index.reindex.current().await {
                handle.cancel();
            }
            index.ingestion.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::search::context::{AccessLevel, ArchivedFilter, PermissionSet, Principal};
    use crate::domain::search::document::{DocKey, SearchDocument};
    use crate::domain::search::entity::{CardEntity, CardType, ModelKind, SearchableEntity};
    use crate::domain::search::permission::PrincipalPermissions;
    use crate::domain::search::source::InMemoryEntitySource;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use futures_util::StreamExt;

    fn card(id: i64, name: &str) -> SearchableEntity {
        SearchableEntity::Card(CardEntity {
            id,
            name: name.to_string(),
            description: None,
            archived: false,
            collection_id: None,
            collection_path: Vec::new(),
            display: "table".to_string(),
            card_type: CardType::Question,
            database_id: 1,
            table_id: None,
            native_query: None,
            template_tags: Vec::new(),
            view_count: 0,
            bookmark_count: 0,
            verified: false,
            updated_at: Utc::now() - Duration::hours(id),
        })
    }

    /// An index whose every read reports it is unavailable
    struct BrokenIndex;

    #[async_trait]
    impl SearchBackend for BrokenIndex {
        fn kind(&self) -> EngineCapability {
            EngineCapability::Persistent
        }

        async fn query(&self, _ctx: &SearchContext) -> Result<EngineOutput> {
            Err(Error::IndexUnavailable("disk gone".to_string()))
        }
    }

    #[async_trait]
    impl IndexStore for BrokenIndex {
        async fn upsert(&self, _documents: &[SearchDocument]) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _keys: &[DocKey]) -> Result<()> {
            Ok(())
        }

        async fn begin_generation(&self) -> Result<IndexGeneration> {
            Err(Error::IndexUnavailable("disk gone".to_string()))
        }

        async fn write_generation(
            &self,
            _generation: IndexGeneration,
            _documents: &[SearchDocument],
        ) -> Result<()> {
            Ok(())
        }

        async fn activate_generation(&self, _generation: IndexGeneration) -> Result<()> {
            Ok(())
        }

        async fn discard_generation(&self, _generation: IndexGeneration) -> Result<()> {
            Ok(())
        }

        fn current_generation(&self) -> IndexGeneration {
            IndexGeneration::INITIAL
        }

        async fn document_count(&self, _generation: IndexGeneration) -> Result<u64> {
            Ok(0)
        }
    }

    fn in_place_service(entities: Vec<SearchableEntity>) -> SearchService {
        SearchService::new(
            EngineCapability::InPlace,
            None,
            Arc::new(InMemoryEntitySource::with_entities(entities)),
            Arc::new(PrincipalPermissions),
            &SearchConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_in_place_search_paginates_visible_results() {
        let service = in_place_service((1..=5).map(|id| card(id, "Revenue")).collect());
        let ctx = SearchContext::new("revenue", Principal::superuser(1)).with_pagination(2, 1);

        let page = service.search(&ctx).await.unwrap();
        assert_eq!(page.engine, EngineCapability::InPlace);
        assert_eq!(page.total, 5);
        let ids: Vec<i64> = page.results.iter().map(|r| r.document.model_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    fn card_in(id: i64, name: &str, collection_id: i64) -> SearchableEntity {
        let mut entity = card(id, name);
        if let SearchableEntity::Card(inner) = &mut entity {
            inner.collection_id = Some(collection_id);
        }
        entity
    }

    fn limited_service(entities: Vec<SearchableEntity>, max_candidates: usize) -> SearchService {
        SearchService::new(
            EngineCapability::InPlace,
            None,
            Arc::new(InMemoryEntitySource::with_entities(entities)),
            Arc::new(PrincipalPermissions),
            &SearchConfig {
                max_candidates,
                ..SearchConfig::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_hidden_results_do_not_use_candidate_slots() {
        let mut entities: Vec<_> = (1..=3)
            .map(|id| card_in(id, "Revenue secret", 99))
            .collect();
        entities.push(card_in(10, "Revenue", 1));
        let service = limited_service(entities, 3);
        let reader = Principal::user(
            2,
            PermissionSet::new().with_collection(Some(1), AccessLevel::Read),
        );

        let page = service
            .search(&SearchContext::new("revenue", reader))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.results[0].document.model_id, 10);
    }

    #[tokio::test]
    async fn test_candidate_limit_keeps_best_ranked() {
        let mut entities: Vec<_> = (1..=3)
            .map(|id| card(id, &format!("Revenue weekly {}", id)))
            .collect();
        entities.push(card(10, "Revenue"));
        let service = limited_service(entities, 3);

        let page = service
            .search(&SearchContext::new("revenue", Principal::superuser(1)))
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.results.len(), 3);
        assert_eq!(page.results[0].document.name, "Revenue");
    }

    #[tokio::test]
    async fn test_persistent_requires_store() {
        let result = SearchService::new(
            EngineCapability::Persistent,
            None,
            Arc::new(InMemoryEntitySource::new()),
            Arc::new(PrincipalPermissions),
            &SearchConfig::default(),
        );
        assert!(matches!(result, Err(Error::IndexUnavailable(_))));
    }

    #[tokio::test]
    async fn test_falls_back_when_index_unavailable() {
        let service = SearchService::new(
            EngineCapability::Persistent,
            Some(Arc::new(BrokenIndex)),
            Arc::new(InMemoryEntitySource::with_entities(vec![card(1, "Churn")])),
            Arc::new(PrincipalPermissions),
            &SearchConfig::default(),
        )
        .unwrap();

        let page = service
            .search(&SearchContext::new("churn", Principal::superuser(1)))
            .await
            .unwrap();
        assert_eq!(page.engine, EngineCapability::InPlace);
        assert_eq!(page.generation, None);
        assert_eq!(page.results.len(), 1);
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_in_place_has_no_reindex() {
        let service = in_place_service(Vec::new());

        assert!(matches!(
            service.reindex().await,
            Err(Error::IndexUnavailable(_))
        ));
        assert_eq!(
            service
                .on_entity_changed(EntityChange::updated(ModelKind::Card, 1))
                .await,
            IngestOutcome::Skipped
        );

        let status = service.index_status().await.unwrap();
        assert_eq!(status.engine, EngineCapability::InPlace);
        assert_eq!(status.generation, None);
    }

    #[tokio::test]
    async fn test_stream_is_lazy_and_reruns() {
        let source = Arc::new(InMemoryEntitySource::with_entities(vec![card(1, "Orders")]));
        let service = SearchService::new(
            EngineCapability::InPlace,
            None,
            source.clone(),
            Arc::new(PrincipalPermissions),
            &SearchConfig::default(),
        )
        .unwrap();
        let ctx = SearchContext::new("orders", Principal::superuser(1))
            .with_archived(ArchivedFilter::Exclude);

        let stream = service.stream(ctx.clone());
        // Created before the insert, polled after it
        source.insert(card(2, "Orders by day"));
        let first: Vec<_> = Box::pin(stream).collect().await;
        assert_eq!(first.len(), 2);

        source.remove(ModelKind::Card, 1);
        let second: Vec<_> = Box::pin(service.stream(ctx)).collect().await;
        assert_eq!(second.len(), 1);
        assert!(second.iter().all(|r| r.is_ok()));
    }
}
