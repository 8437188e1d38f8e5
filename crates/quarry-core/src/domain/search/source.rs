//! Entity sources
//!
//! The search core never owns domain entities. It reads them through
//! [`EntitySource`], which stands for the CRUD models and their relational
//! store.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::document::DocKey;
use super::entity::{ModelKind, SearchableEntity};
use super::projector::decode_entity;
use crate::error::{Error, Result};

/// One page of a model scan
#[derive(Debug, Clone, Default)]
pub struct ScanBatch {
    /// Entities that decoded cleanly
    pub entities: Vec<SearchableEntity>,
    /// Highest id read, including rows that failed to decode
    pub last_id: Option<i64>,
    /// Rows read from the store
    pub rows: usize,
}

impl ScanBatch {
    /// Whether the scan has reached the end of the model
    pub fn is_last(&self, limit: usize) -> bool {
        self.rows < limit
    }
}

/// Read access to the live domain entities
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Fetch the current state of one entity
    async fn fetch(&self, model: ModelKind, id: i64) -> Result<Option<SearchableEntity>>;

    /// Scan one model in ascending id order, starting after `after`
    async fn scan(
        &self,
        model: ModelKind,
        after: Option<i64>,
        limit: usize,
    ) -> Result<ScanBatch>;
}

/// Entities stored as JSON rows in the `app_entity` table
#[derive(Debug, Clone)]
pub struct SqliteEntitySource {
    pool: SqlitePool,
}

impl SqliteEntitySource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace an entity row
    pub async fn put(&self, entity: &SearchableEntity) -> Result<()> {
        let payload = serde_json::to_string(entity)?;
        sqlx::query(
            r#"
            INSERT INTO app_entity (model, model_id, payload, archived, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(model, model_id) DO UPDATE SET
                payload = excluded.payload,
                archived = excluded.archived,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(entity.model().as_str())
        .bind(entity.id())
        .bind(payload)
        .bind(entity.archived())
        .bind(entity.updated_at())
        .execute(&self.pool)
        .await?;

        tracing::debug!(key = %entity.key(), "Stored entity");
        Ok(())
    }

    /// Delete an entity row, returning whether it existed
    pub async fn remove(&self, model: ModelKind, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM app_entity WHERE model = ? AND model_id = ?")
            .bind(model.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl EntitySource for SqliteEntitySource {
    async fn fetch(&self, model: ModelKind, id: i64) -> Result<Option<SearchableEntity>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT model, payload FROM app_entity WHERE model = ? AND model_id = ?",
        )
        .bind(model.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(tag, payload)| decode_entity(&tag, &payload))
            .transpose()
    }

    async fn scan(
        &self,
        model: ModelKind,
        after: Option<i64>,
        limit: usize,
    ) -> Result<ScanBatch> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT model_id, model, payload FROM app_entity
            WHERE model = ? AND model_id > ?
            ORDER BY model_id
            LIMIT ?
            "#,
        )
        .bind(model.as_str())
        .bind(after.unwrap_or(i64::MIN))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut batch = ScanBatch {
            entities: Vec::with_capacity(rows.len()),
            last_id: rows.last().map(|(id, _, _)| *id),
            rows: rows.len(),
        };
        for (id, tag, payload) in rows {
            match decode_entity(&tag, &payload) {
                Ok(entity) => batch.entities.push(entity),
                // One corrupt row must not abort a whole scan
                Err(e) => tracing::warn!(model = %model, id, error = %e, "Skipping undecodable entity row"),
            }
        }
        Ok(batch)
    }
}

/// Entities held in memory, for tests and embedding
#[derive(Debug, Default)]
pub struct InMemoryEntitySource {
    entities: RwLock<BTreeMap<DocKey, SearchableEntity>>,
}

impl InMemoryEntitySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = SearchableEntity>) -> Self {
        let source = Self::new();
        for entity in entities {
            source.insert(entity);
        }
        source
    }

    /// Insert or replace an entity
    pub fn insert(&self, entity: SearchableEntity) {
        if let Ok(mut entities) = self.entities.write() {
            entities.insert(entity.key(), entity);
        }
    }

    pub fn remove(&self, model: ModelKind, id: i64) -> Option<SearchableEntity> {
        self.entities
            .write()
            .ok()
            .and_then(|mut entities| entities.remove(&DocKey::new(model, id)))
    }

    pub fn len(&self) -> usize {
        self.entities.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> Error {
    Error::Other("entity source lock poisoned".to_string())
}

#[async_trait]
impl EntitySource for InMemoryEntitySource {
    async fn fetch(&self, model: ModelKind, id: i64) -> Result<Option<SearchableEntity>> {
        let entities = self.entities.read().map_err(|_| poisoned())?;
        Ok(entities.get(&DocKey::new(model, id)).cloned())
    }

    async fn scan(
        &self,
        model: ModelKind,
        after: Option<i64>,
        limit: usize,
    ) -> Result<ScanBatch> {
        let entities = self.entities.read().map_err(|_| poisoned())?;
        let start = DocKey::new(model, after.map_or(i64::MIN, |id| id.saturating_add(1)));
        let end = DocKey::new(model, i64::MAX);
        let entities: Vec<SearchableEntity> = entities
            .range(start..=end)
            .take(limit)
            .map(|(_, entity)| entity.clone())
            .collect();
        Ok(ScanBatch {
            last_id: entities.last().map(SearchableEntity::id),
            rows: entities.len(),
            entities,
        })
    }
}
