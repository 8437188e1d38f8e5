//! In-place search engine
//!
//! Used when no persistent index is available. Every request scans the live
//! entities, projects them and scores them with the same [`Ranker`] the index
//! uses, so callers cannot tell the two engines apart by their results.

use async_trait::async_trait;
use std::sync::Arc;

use super::context::SearchContext;
use super::projector::EntityProjector;
use super::scoring::Ranker;
use super::source::EntitySource;
use super::specification::SearchSpecBuilder;
use super::store::{EngineCapability, EngineOutput, SearchBackend};
use crate::error::Result;

/// Entities fetched per scan round trip
const DEFAULT_SCAN_BATCH: usize = 500;

/// Query-time scan over an [`EntitySource`]
#[derive(Clone)]
pub struct InPlaceEngine {
    source: Arc<dyn EntitySource>,
    ranker: Ranker,
    scan_batch: usize,
}

impl InPlaceEngine {
    pub fn new(source: Arc<dyn EntitySource>, ranker: Ranker) -> Self {
        Self {
            source,
            ranker,
            scan_batch: DEFAULT_SCAN_BATCH,
        }
    }

    pub fn with_scan_batch(mut self, scan_batch: usize) -> Self {
        self.scan_batch = scan_batch.max(1);
        self
    }
}

#[async_trait]
impl SearchBackend for InPlaceEngine {
    fn kind(&self) -> EngineCapability {
        EngineCapability::InPlace
    }

    async fn query(&self, ctx: &SearchContext) -> Result<EngineOutput> {
        let spec = SearchSpecBuilder::for_context(ctx).with_text(ctx.prepared().clone());
        let mut candidates = Vec::new();
        let mut scanned = 0usize;

        for model in ctx.requested_models() {
            let mut after = None;
            loop {
                let batch = self.source.scan(model, after, self.scan_batch).await?;
                scanned += batch.rows;
                after = batch.last_id;

                candidates.extend(
                    batch
                        .entities
                        .iter()
                        .map(EntityProjector::project)
                        .filter(|doc| spec.is_satisfied_by(doc)),
                );

                if batch.is_last(self.scan_batch) {
                    break;
                }
            }
        }

        tracing::debug!(
            scanned,
            candidates = candidates.len(),
            "In-place search scanned entities"
        );

        let results = self.ranker.rank(ctx.prepared(), candidates, ctx.now());
        Ok(EngineOutput {
            generation: None,
            results,
        })
    }
}
