//! Full index rebuilds
//!
//! A rebuild scans every model into a fresh generation while the current one
//! keeps serving reads and receiving live ingestion writes. Only a complete
//! generation is ever activated; cancellation or failure discards the
//! building generation and nothing else.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::entity::ModelKind;
use super::generation::IndexGeneration;
use super::projector::EntityProjector;
use super::retry::RetryPolicy;
use super::source::EntitySource;
use super::store::IndexStore;
use crate::error::{Error, Result};

/// Entities scanned and written per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Progress of a rebuild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReindexStatus {
    /// Spawned but no generation allocated yet
    Starting,
    Running {
        generation: IndexGeneration,
        documents: u64,
    },
    Completed {
        generation: IndexGeneration,
        documents: u64,
    },
    Cancelled {
        generation: Option<IndexGeneration>,
    },
    Failed {
        generation: Option<IndexGeneration>,
        error: String,
        /// Whether starting another rebuild may succeed
        retryable: bool,
    },
}

impl ReindexStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Cancelled { .. } | Self::Failed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Cancelled { .. } => "cancelled",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Handle to a running or finished rebuild
#[derive(Debug, Clone)]
pub struct ReindexHandle {
    id: Uuid,
    status: watch::Receiver<ReindexStatus>,
    cancel: CancellationToken,
}

impl ReindexHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Latest published status
    pub fn status(&self) -> ReindexStatus {
        self.status.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.status.borrow().is_finished()
    }

    /// Ask the rebuild to stop at the next chunk boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the rebuild to finish and return its final status
    pub async fn wait(&self) -> ReindexStatus {
        let mut status = self.status.clone();
        if let Ok(finished) = status.wait_for(ReindexStatus::is_finished).await {
            return finished.clone();
        }
        // The task is gone; whatever it published last is final
        let last = status.borrow().clone();
        last
    }
}

/// Runs one rebuild at a time
pub struct ReindexCoordinator {
    source: Arc<dyn EntitySource>,
    store: Arc<dyn IndexStore>,
    retry: RetryPolicy,
    chunk_size: usize,
    current: Mutex<Option<ReindexHandle>>,
}

impl ReindexCoordinator {
    pub fn new(source: Arc<dyn EntitySource>, store: Arc<dyn IndexStore>, retry: RetryPolicy) -> Self {
        Self {
            source,
            store,
            retry,
            chunk_size: DEFAULT_CHUNK_SIZE,
            current: Mutex::new(None),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Start a rebuild, or return the one already running
    pub async fn start(&self) -> ReindexHandle {
        let mut current = self.current.lock().await;
        if let Some(handle) = current.as_ref() {
            if !handle.is_finished() {
                tracing::info!(reindex_id = %handle.id(), "Reindex already running");
                return handle.clone();
            }
        }

        let (status_tx, status_rx) = watch::channel(ReindexStatus::Starting);
        let handle = ReindexHandle {
            id: Uuid::new_v4(),
            status: status_rx,
            cancel: CancellationToken::new(),
        };

        let job = RebuildJob {
            id: handle.id,
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            retry: self.retry,
            chunk_size: self.chunk_size,
            cancel: handle.cancel.clone(),
            status: status_tx,
        };
        tokio::spawn(job.run());

        tracing::info!(reindex_id = %handle.id, "Reindex started");
        *current = Some(handle.clone());
        handle
    }

    /// The most recent rebuild, finished or not
    pub async fn current(&self) -> Option<ReindexHandle> {
        self.current.lock().await.clone()
    }
}

struct RebuildJob {
    id: Uuid,
    source: Arc<dyn EntitySource>,
    store: Arc<dyn IndexStore>,
    retry: RetryPolicy,
    chunk_size: usize,
    cancel: CancellationToken,
    status: watch::Sender<ReindexStatus>,
}

enum Interrupted {
    Cancelled,
    Failed(Error),
}

impl From<Error> for Interrupted {
    fn from(e: Error) -> Self {
        Self::Failed(e)
    }
}

impl RebuildJob {
    async fn run(self) {
        let generation = match self.retry.run("begin_generation", || self.store.begin_generation()).await {
            Ok(generation) => generation,
            Err(e) => {
                self.fail(None, e);
                return;
            }
        };
        let _ = self.status.send(ReindexStatus::Running {
            generation,
            documents: 0,
        });

        let outcome = match self.build(generation).await {
            Ok(documents) => self.activate(generation, documents).await,
            Err(interrupted) => Err(interrupted),
        };

        match outcome {
            Ok(documents) => {
                tracing::info!(
                    reindex_id = %self.id,
                    generation = %generation,
                    documents,
                    "Reindex completed"
                );
                let _ = self.status.send(ReindexStatus::Completed {
                    generation,
                    documents,
                });
            }
            Err(Interrupted::Cancelled) => {
                self.discard(generation).await;
                tracing::info!(reindex_id = %self.id, generation = %generation, "Reindex cancelled");
                let _ = self.status.send(ReindexStatus::Cancelled {
                    generation: Some(generation),
                });
            }
            Err(Interrupted::Failed(e)) => {
                self.discard(generation).await;
                self.fail(Some(generation), e);
            }
        }
    }

    /// Scan every model into `generation`, returning the documents written
    async fn build(&self, generation: IndexGeneration) -> std::result::Result<u64, Interrupted> {
        let mut documents = 0u64;

        for model in ModelKind::ALL {
            let mut after = None;
            loop {
                if self.cancel.is_cancelled() {
                    return Err(Interrupted::Cancelled);
                }

                let batch = self.source.scan(model, after, self.chunk_size).await?;
                after = batch.last_id;

                let docs: Vec<_> = batch.entities.iter().map(EntityProjector::project).collect();
                if !docs.is_empty() {
                    self.retry
                        .run("write_generation", || self.store.write_generation(generation, &docs))
                        .await?;
                    documents += docs.len() as u64;
                    self.status.send_modify(|status| {
                        *status = ReindexStatus::Running {
                            generation,
                            documents,
                        }
                    });
                }

                if batch.is_last(self.chunk_size) {
                    break;
                }
            }
            tracing::debug!(reindex_id = %self.id, model = %model, documents, "Model scanned");
        }

        Ok(documents)
    }

    async fn activate(
        &self,
        generation: IndexGeneration,
        documents: u64,
    ) -> std::result::Result<u64, Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        self.store.activate_generation(generation).await?;
        Ok(documents)
    }

    async fn discard(&self, generation: IndexGeneration) {
        if let Err(e) = self.store.discard_generation(generation).await {
            tracing::error!(
                reindex_id = %self.id,
                generation = %generation,
                error = %e,
                "Failed to discard abandoned generation"
            );
        }
    }

    fn fail(&self, generation: Option<IndexGeneration>, source: Error) {
        let retryable = source.is_transient();
        let error = Error::ReindexFailed(source.to_string());
        tracing::error!(
            reindex_id = %self.id,
            generation = ?generation.map(|g| g.value()),
            retryable,
            error = %error,
            "Reindex failed"
        );
        let _ = self.status.send(ReindexStatus::Failed {
            generation,
            error: source.to_string(),
            retryable,
        });
    }
}

/// Run a rebuild to completion, returning an error unless it completed
pub async fn reindex_and_wait(coordinator: &ReindexCoordinator) -> Result<ReindexStatus> {
    let status = coordinator.start().await.wait().await;
    match &status {
        ReindexStatus::Completed { .. } => Ok(status),
        ReindexStatus::Failed { error, .. } => Err(Error::ReindexFailed(error.clone())),
        other => Err(Error::ReindexFailed(format!("rebuild ended as {}", other.label()))),
    }
}
