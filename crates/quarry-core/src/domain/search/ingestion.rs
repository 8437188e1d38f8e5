//! Ingestion pipeline
//!
//! Turns entity change notifications from the CRUD layer into index writes.
//!
//! # Modes
//!
//! - **Synchronous**: fetch, project and write before returning. Used by tests
//!   and by call paths that need to read their own writes.
//! - **Batched**: changes go into a bounded queue and a single background
//!   worker flushes them in batches. Producers never block; a full queue
//!   drops the change with a warning since the source of truth is untouched.
//!
//! Changes to the same `(model, id)` apply in the order they were observed.
//! In batched mode repeated changes to one key collapse into a single
//! re-projection of the current entity state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use super::document::{DocKey, SearchDocument};
use super::entity::{ChangeKind, EntityChange};
use super::projector::EntityProjector;
use super::retry::RetryPolicy;
use super::source::EntitySource;
use super::store::IndexStore;
use crate::config::{IngestionConfig, IngestionModeSetting};
use crate::error::{Error, Result};

/// How changes reach the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionMode {
    Synchronous,
    Batched {
        /// Pending keys that trigger an early flush, and the write chunk size
        batch_size: usize,
        flush_interval: Duration,
        queue_capacity: usize,
    },
}

impl IngestionMode {
    pub fn from_config(config: &IngestionConfig) -> Self {
        match config.mode {
            IngestionModeSetting::Sync => Self::Synchronous,
            IngestionModeSetting::Batched => Self::Batched {
                batch_size: config.batch_size.max(1),
                flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
                queue_capacity: config.queue_capacity.max(1),
            },
        }
    }

    pub fn is_batched(&self) -> bool {
        matches!(self, Self::Batched { .. })
    }
}

/// What happened to a single change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// The document was written
    Indexed,
    /// The document was removed
    Removed,
    /// Accepted by the batch queue
    Queued,
    /// Rejected because the queue was full or closed
    Dropped,
    /// The write failed; the index is stale for this entity
    Failed,
    /// No index to maintain; the in-place engine reads live state
    Skipped,
}

// ========== Metrics ==========

/// Ingestion counters
#[derive(Debug, Default)]
pub struct IngestionMetrics {
    /// Documents written
    pub applied: AtomicU64,
    /// Documents removed
    pub deleted: AtomicU64,
    /// Changes folded into an already pending change for the same key
    pub coalesced: AtomicU64,
    /// Changes rejected by a full or closed queue
    pub dropped: AtomicU64,
    /// Changes whose index write failed
    pub failed: AtomicU64,
    /// Batches flushed by the worker
    pub batches: AtomicU64,
}

impl IngestionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> IngestionSnapshot {
        IngestionSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`IngestionMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngestionSnapshot {
    pub applied: u64,
    pub deleted: u64,
    pub coalesced: u64,
    pub dropped: u64,
    pub failed: u64,
    pub batches: u64,
}

// ========== Applying changes ==========

/// Shared write path for both modes
struct ChangeApplier {
    source: Arc<dyn EntitySource>,
    store: Arc<dyn IndexStore>,
    retry: RetryPolicy,
    metrics: Arc<IngestionMetrics>,
}

impl ChangeApplier {
    /// Decide the document state for one key from the current entity state
    async fn resolve(&self, key: DocKey, kind: ChangeKind) -> Result<Option<SearchDocument>> {
        if kind.is_removal() {
            return Ok(None);
        }
        let entity = self.source.fetch(key.model, key.id).await?;
        Ok(entity.as_ref().map(EntityProjector::project))
    }

    async fn write(&self, upserts: &[SearchDocument], deletes: &[DocKey]) -> Result<()> {
        if !upserts.is_empty() {
            self.retry
                .run("upsert", || self.store.upsert(upserts))
                .await?;
            IngestionMetrics::add(&self.metrics.applied, upserts.len());
        }
        if !deletes.is_empty() {
            self.retry
                .run("delete", || self.store.delete(deletes))
                .await?;
            IngestionMetrics::add(&self.metrics.deleted, deletes.len());
        }
        Ok(())
    }

    async fn apply_one(&self, change: EntityChange) -> Result<IngestOutcome> {
        let key = change.key();
        match self.resolve(key, change.kind).await? {
            Some(doc) => {
                self.write(std::slice::from_ref(&doc), &[]).await?;
                Ok(IngestOutcome::Indexed)
            }
            None => {
                self.write(&[], &[key]).await?;
                Ok(IngestOutcome::Removed)
            }
        }
    }

    /// Apply a chunk of coalesced changes with one write per direction
    async fn apply_batch(&self, batch: &[(DocKey, ChangeKind)]) {
        let mut upserts = Vec::with_capacity(batch.len());
        let mut deletes = Vec::new();

        for &(key, kind) in batch {
            match self.resolve(key, kind).await {
                Ok(Some(doc)) => upserts.push(doc),
                Ok(None) => deletes.push(key),
                Err(e) => {
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(key = %key, error = %e, "Failed to load entity for indexing");
                }
            }
        }

        if let Err(e) = self.write(&upserts, &deletes).await {
            IngestionMetrics::add(&self.metrics.failed, upserts.len() + deletes.len());
            tracing::error!(
                documents = upserts.len() + deletes.len(),
                error = %e,
                "Dropping index batch after failed writes"
            );
        }
        self.metrics.batches.fetch_add(1, Ordering::Relaxed);
    }
}

// ========== Batch worker ==========

enum Command {
    Change(EntityChange),
    Flush(oneshot::Sender<()>),
}

/// Pending changes keyed by document, in first-seen order
#[derive(Default)]
struct PendingChanges {
    order: Vec<DocKey>,
    latest: HashMap<DocKey, ChangeKind>,
}

impl PendingChanges {
    /// Record a change; returns true when it replaced a pending one
    fn push(&mut self, change: EntityChange) -> bool {
        let key = change.key();
        match self.latest.insert(key, change.kind) {
            Some(_) => true,
            None => {
                self.order.push(key);
                false
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn drain(&mut self) -> Vec<(DocKey, ChangeKind)> {
        let latest = std::mem::take(&mut self.latest);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|key| latest.get(&key).map(|kind| (key, *kind)))
            .collect()
    }
}

struct BatchWorker {
    applier: Arc<ChangeApplier>,
    batch_size: usize,
    flush_interval: Duration,
    pending: PendingChanges,
}

impl BatchWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut shutdown_rx: watch::Receiver<bool>) {
        // First tick one full interval from now, not immediately
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            batch_size = self.batch_size,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "Ingestion worker started"
        );

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Change(change)) => {
                        self.accept(change);
                        if self.pending.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.flush().await;
                        let _ = ack.send(());
                    }
                    None => break,
                },

                _ = ticker.tick() => {
                    self.flush().await;
                }

                changed = shutdown_rx.changed() => {
                    // A dropped sender means the pipeline is gone
                    if changed.is_err() || *shutdown_rx.borrow() {
                        rx.close();
                        while let Some(command) = rx.recv().await {
                            match command {
                                Command::Change(change) => self.accept(change),
                                Command::Flush(ack) => {
                                    let _ = ack.send(());
                                }
                            }
                        }
                        break;
                    }
                }
            }
        }

        self.flush().await;

        let snapshot = self.applier.metrics.snapshot();
        tracing::info!(
            applied = snapshot.applied,
            deleted = snapshot.deleted,
            coalesced = snapshot.coalesced,
            dropped = snapshot.dropped,
            failed = snapshot.failed,
            batches = snapshot.batches,
            "Ingestion worker stopped"
        );
    }

    fn accept(&mut self, change: EntityChange) {
        if self.pending.push(change) {
            self.applier.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let changes = self.pending.drain();
        tracing::debug!(changes = changes.len(), "Flushing ingestion batch");
        for chunk in changes.chunks(self.batch_size) {
            self.applier.apply_batch(chunk).await;
        }
    }
}

// ========== Pipeline ==========

/// Entry point for entity change notifications
pub struct IngestionPipeline {
    mode: IngestionMode,
    applier: Arc<ChangeApplier>,
    sender: Option<mpsc::Sender<Command>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionPipeline {
    /// Create a pipeline; batched mode spawns its worker on the current
    /// tokio runtime
    pub fn new(
        source: Arc<dyn EntitySource>,
        store: Arc<dyn IndexStore>,
        mode: IngestionMode,
        retry: RetryPolicy,
    ) -> Self {
        let applier = Arc::new(ChangeApplier {
            source,
            store,
            retry,
            metrics: Arc::new(IngestionMetrics::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (sender, worker) = match mode {
            IngestionMode::Synchronous => (None, None),
            IngestionMode::Batched {
                batch_size,
                flush_interval,
                queue_capacity,
            } => {
                let (tx, rx) = mpsc::channel(queue_capacity.max(1));
                let worker = BatchWorker {
                    applier: Arc::clone(&applier),
                    batch_size: batch_size.max(1),
                    flush_interval,
                    pending: PendingChanges::default(),
                };
                let handle = tokio::spawn(worker.run(rx, shutdown_rx));
                (Some(tx), Some(handle))
            }
        };

        Self {
            mode,
            applier,
            sender,
            shutdown_tx,
            worker: Mutex::new(worker),
        }
    }

    pub fn mode(&self) -> IngestionMode {
        self.mode
    }

    pub fn metrics(&self) -> IngestionSnapshot {
        self.applier.metrics.snapshot()
    }

    /// Handle a change notification
    ///
    /// Never fails: indexing is best effort relative to the entity mutation
    /// that triggered it. Failures are logged and counted.
    pub async fn on_entity_changed(&self, change: EntityChange) -> IngestOutcome {
        match &self.sender {
            None => match self.apply(change).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.applier.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        key = %change.key(),
                        change = %change.kind,
                        error = %e,
                        "Index write failed; document is stale"
                    );
                    IngestOutcome::Failed
                }
            },
            Some(sender) => match sender.try_send(Command::Change(change)) {
                Ok(()) => IngestOutcome::Queued,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.applier.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        key = %change.key(),
                        change = %change.kind,
                        "Ingestion queue full, dropping change"
                    );
                    IngestOutcome::Dropped
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.applier.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        key = %change.key(),
                        "Ingestion worker stopped, dropping change"
                    );
                    IngestOutcome::Dropped
                }
            },
        }
    }

    /// Apply one change immediately, regardless of mode, surfacing errors
    pub async fn apply(&self, change: EntityChange) -> Result<IngestOutcome> {
        let outcome = self.applier.apply_one(change).await?;
        tracing::debug!(key = %change.key(), change = %change.kind, outcome = ?outcome, "Applied change");
        Ok(outcome)
    }

    /// Write everything queued so far
    pub async fn flush(&self) -> Result<()> {
        let Some(sender) = &self.sender else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        sender
            .send(Command::Flush(ack_tx))
            .await
            .map_err(|_| Error::Other("ingestion worker has stopped".to_string()))?;
        ack_rx
            .await
            .map_err(|_| Error::Other("ingestion worker stopped before flushing".to_string()))
    }

    /// Drain the queue and stop the worker
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            handle
                .await
                .map_err(|e| Error::Other(format!("ingestion worker panicked: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::search::context::{ArchivedFilter, Principal, SearchContext};
    use crate::domain::search::entity::{CollectionEntity, ModelKind, SearchableEntity};
    use crate::domain::search::scoring::Ranker;
    use crate::domain::search::source::InMemoryEntitySource;
    use crate::domain::search::store::{SearchBackend, SqliteIndexStore};
    use crate::storage::Database;
    use chrono::Utc;

    fn collection(id: i64, name: &str, archived: bool) -> SearchableEntity {
        SearchableEntity::Collection(CollectionEntity {
            id,
            name: name.to_string(),
            description: None,
            archived,
            location: Vec::new(),
            updated_at: Utc::now(),
            official: false,
            personal_owner_id: None,
        })
    }

    async fn setup() -> (Arc<InMemoryEntitySource>, Arc<SqliteIndexStore>) {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteIndexStore::open(db.pool().clone(), Ranker::default())
            .await
            .unwrap();
        (Arc::new(InMemoryEntitySource::new()), Arc::new(store))
    }

    async fn names(store: &SqliteIndexStore, archived: ArchivedFilter) -> Vec<String> {
        let ctx = SearchContext::new("", Principal::superuser(1)).with_archived(archived);
        store
            .query(&ctx)
            .await
            .unwrap()
            .results
            .into_iter()
            .map(|r| r.document.name)
            .collect()
    }

    fn batched(batch_size: usize, queue_capacity: usize) -> IngestionMode {
        IngestionMode::Batched {
            batch_size,
            flush_interval: Duration::from_secs(3600),
            queue_capacity,
        }
    }

    #[test]
    fn test_mode_from_config() {
        let config = IngestionConfig::default();
        assert!(IngestionMode::from_config(&config).is_batched());

        let sync = IngestionConfig {
            mode: IngestionModeSetting::Sync,
            ..Default::default()
        };
        assert_eq!(IngestionMode::from_config(&sync), IngestionMode::Synchronous);
    }

    #[test]
    fn test_pending_changes_coalesce_in_first_seen_order() {
        let mut pending = PendingChanges::default();
        assert!(!pending.push(EntityChange::created(ModelKind::Card, 1)));
        assert!(!pending.push(EntityChange::created(ModelKind::Card, 2)));
        assert!(pending.push(EntityChange::deleted(ModelKind::Card, 1)));

        assert_eq!(
            pending.drain(),
            vec![
                (DocKey::new(ModelKind::Card, 1), ChangeKind::Deleted),
                (DocKey::new(ModelKind::Card, 2), ChangeKind::Created),
            ]
        );
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_synchronous_lifecycle() {
        let (source, store) = setup().await;
        let pipeline = IngestionPipeline::new(
            source.clone(),
            store.clone(),
            IngestionMode::Synchronous,
            RetryPolicy::default(),
        );

        source.insert(collection(1, "Finance", false));
        let outcome = pipeline
            .on_entity_changed(EntityChange::created(ModelKind::Collection, 1))
            .await;
        assert_eq!(outcome, IngestOutcome::Indexed);
        assert_eq!(names(&store, ArchivedFilter::Exclude).await, vec!["Finance"]);

        source.insert(collection(1, "Finance", true));
        pipeline
            .on_entity_changed(EntityChange::archived(ModelKind::Collection, 1))
            .await;
        assert!(names(&store, ArchivedFilter::Exclude).await.is_empty());
        assert_eq!(names(&store, ArchivedFilter::Only).await, vec!["Finance"]);

        source.insert(collection(1, "Finance", false));
        pipeline
            .on_entity_changed(EntityChange::unarchived(ModelKind::Collection, 1))
            .await;
        assert_eq!(names(&store, ArchivedFilter::Exclude).await, vec!["Finance"]);

        source.remove(ModelKind::Collection, 1);
        let outcome = pipeline
            .on_entity_changed(EntityChange::deleted(ModelKind::Collection, 1))
            .await;
        assert_eq!(outcome, IngestOutcome::Removed);
        assert!(names(&store, ArchivedFilter::Include).await.is_empty());

        let metrics = pipeline.metrics();
        assert_eq!(metrics.applied, 3);
        assert_eq!(metrics.deleted, 1);
    }

    #[tokio::test]
    async fn test_update_for_missing_entity_removes_document() {
        let (source, store) = setup().await;
        let pipeline = IngestionPipeline::new(
            source.clone(),
            store.clone(),
            IngestionMode::Synchronous,
            RetryPolicy::default(),
        );

        source.insert(collection(1, "Finance", false));
        pipeline
            .on_entity_changed(EntityChange::created(ModelKind::Collection, 1))
            .await;
        source.remove(ModelKind::Collection, 1);

        let outcome = pipeline
            .on_entity_changed(EntityChange::updated(ModelKind::Collection, 1))
            .await;
        assert_eq!(outcome, IngestOutcome::Removed);
    }

    #[tokio::test]
    async fn test_batched_coalescing() {
        let (source, store) = setup().await;
        let pipeline =
            IngestionPipeline::new(source.clone(), store.clone(), batched(100, 100), RetryPolicy::default());

        source.insert(collection(1, "Finance v3", false));
        source.insert(collection(2, "Ops", false));
        for change in [
            EntityChange::created(ModelKind::Collection, 1),
            EntityChange::updated(ModelKind::Collection, 1),
            EntityChange::created(ModelKind::Collection, 2),
            EntityChange::updated(ModelKind::Collection, 1),
        ] {
            assert_eq!(pipeline.on_entity_changed(change).await, IngestOutcome::Queued);
        }

        pipeline.flush().await.unwrap();

        let mut indexed = names(&store, ArchivedFilter::Exclude).await;
        indexed.sort();
        assert_eq!(indexed, vec!["Finance v3", "Ops"]);

        let metrics = pipeline.metrics();
        assert_eq!(metrics.coalesced, 2);
        assert_eq!(metrics.applied, 2);
        assert_eq!(metrics.batches, 1);

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_full_drops_change() {
        let (source, store) = setup().await;
        let pipeline =
            IngestionPipeline::new(source.clone(), store.clone(), batched(100, 2), RetryPolicy::default());

        // The worker cannot run between these calls on a current-thread runtime
        let outcomes = [
            pipeline.on_entity_changed(EntityChange::created(ModelKind::Card, 1)).await,
            pipeline.on_entity_changed(EntityChange::created(ModelKind::Card, 2)).await,
            pipeline.on_entity_changed(EntityChange::created(ModelKind::Card, 3)).await,
        ];
        assert_eq!(
            outcomes,
            [IngestOutcome::Queued, IngestOutcome::Queued, IngestOutcome::Dropped]
        );
        assert_eq!(pipeline.metrics().dropped, 1);

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let (source, store) = setup().await;
        let pipeline =
            IngestionPipeline::new(source.clone(), store.clone(), batched(100, 100), RetryPolicy::default());

        source.insert(collection(5, "Marketing", false));
        pipeline
            .on_entity_changed(EntityChange::created(ModelKind::Collection, 5))
            .await;
        pipeline.shutdown().await.unwrap();

        assert_eq!(names(&store, ArchivedFilter::Exclude).await, vec!["Marketing"]);
        assert_eq!(
            pipeline
                .on_entity_changed(EntityChange::updated(ModelKind::Collection, 5))
                .await,
            IngestOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn test_batch_size_triggers_flush() {
        let (source, store) = setup().await;
        let pipeline =
            IngestionPipeline::new(source.clone(), store.clone(), batched(2, 100), RetryPolicy::default());

        source.insert(collection(1, "A", false));
        source.insert(collection(2, "B", false));
        pipeline
            .on_entity_changed(EntityChange::created(ModelKind::Collection, 1))
            .await;
        pipeline
            .on_entity_changed(EntityChange::created(ModelKind::Collection, 2))
            .await;

        // Let the worker pick up both changes; the long interval cannot fire
        for _ in 0..50 {
            if pipeline.metrics().batches > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pipeline.metrics().batches, 1);
        assert_eq!(pipeline.metrics().applied, 2);

        pipeline.shutdown().await.unwrap();
    }
}
