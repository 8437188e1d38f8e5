//! Index store
//!
//! The persistent search engine. Documents live in the `search_index` table,
//! partitioned by generation. Live writes land in every generation that is
//! either serving or being rebuilt, while a rebuild fills its own generation
//! and then swaps it in atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteArguments;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::fmt;
use std::sync::Arc;

use super::context::{ArchivedFilter, SearchContext};
use super::document::{DocKey, PermissionScope, RankingSignals, SearchDocument};
use super::entity::ModelKind;
use super::generation::{GenerationPointer, GenerationStatus, IndexGeneration};
use super::scoring::{Ranker, ScoredDocument};
use crate::config::{EngineSetting, SearchConfig};
use crate::error::{Error, Result};
use crate::storage::Database;

/// Which engine answers search requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineCapability {
    /// The generation-versioned `search_index` table
    Persistent,
    /// Scan, project and score entities at query time
    InPlace,
}

impl EngineCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::InPlace => "in_place",
        }
    }

    /// Decide once, at startup, which engine serves searches
    ///
    /// `auto` probes the index bookkeeping and settles on the in-place engine
    /// when it is missing; `app_db` treats a missing index as an error.
    pub async fn resolve(config: &SearchConfig, database: &Database) -> Result<Self> {
        if config.engine == EngineSetting::InPlace {
            return Ok(Self::InPlace);
        }

        let probe: std::result::Result<Option<(i64,)>, sqlx::Error> =
            sqlx::query_as("SELECT active_generation FROM search_index_state WHERE singleton = 1")
                .fetch_optional(database.pool())
                .await;

        let reason = match probe {
            Ok(Some(_)) => return Ok(Self::Persistent),
            Ok(None) => "index state row is missing".to_string(),
            Err(e) => format!("index state unreadable: {}", e),
        };

        match config.engine {
            EngineSetting::AppDb => Err(Error::IndexUnavailable(reason)),
            _ => {
                tracing::info!(%reason, "Search index unavailable, using in-place engine");
                Ok(Self::InPlace)
            }
        }
    }
}

impl fmt::Display for EngineCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ranked candidates produced by one engine for one request
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// Generation the results were read from, if the engine has one
    pub generation: Option<IndexGeneration>,
    /// Candidates in rank order, not yet permission filtered
    pub results: Vec<ScoredDocument>,
}

/// Anything that can answer a search request
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn kind(&self) -> EngineCapability;

    /// Ranked candidates for the request, before permission filtering
    async fn query(&self, ctx: &SearchContext) -> Result<EngineOutput>;
}

/// A search backend that keeps its own documents
#[async_trait]
pub trait IndexStore: SearchBackend {
    /// Insert or replace documents in every live generation
    async fn upsert(&self, documents: &[SearchDocument]) -> Result<()>;

    /// Remove documents from every live generation
    async fn delete(&self, keys: &[DocKey]) -> Result<()>;

    /// Allocate a new generation for a rebuild
    async fn begin_generation(&self) -> Result<IndexGeneration>;

    /// Write rebuild output; documents already present are left alone
    async fn write_generation(
        &self,
        generation: IndexGeneration,
        documents: &[SearchDocument],
    ) -> Result<()>;

    /// Make a fully built generation the one readers use
    async fn activate_generation(&self, generation: IndexGeneration) -> Result<()>;

    /// Throw away a generation that was never activated
    async fn discard_generation(&self, generation: IndexGeneration) -> Result<()>;

    fn current_generation(&self) -> IndexGeneration;

    /// Number of documents stored in a generation
    async fn document_count(&self, generation: IndexGeneration) -> Result<u64>;
}

/// Bookkeeping for one generation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationInfo {
    pub generation: IndexGeneration,
    pub status: GenerationStatus,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub documents: u64,
}

const SELECT_COLUMNS: &str = r#"
    SELECT model, model_id, name, description, native_query, template_tags,
           archived, collection_id, collection_path, database_id, table_id,
           updated_at, view_count, bookmark_count, official, scope, metadata
    FROM search_index
"#;

/// Live writes go to every active or building generation
const UPSERT_LIVE: &str = r#"
    INSERT INTO search_index (
        generation, model, model_id, name, description, native_query, template_tags,
        search_text, archived, collection_id, collection_path, database_id, table_id,
        updated_at, view_count, bookmark_count, official, scope, metadata
    )
    SELECT g.id, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
    FROM search_index_generation g
    WHERE g.status IN ('active', 'building')
    ON CONFLICT(generation, model, model_id) DO UPDATE SET
        name = excluded.name,
        description = excluded.description,
        native_query = excluded.native_query,
        template_tags = excluded.template_tags,
        search_text = excluded.search_text,
        archived = excluded.archived,
        collection_id = excluded.collection_id,
        collection_path = excluded.collection_path,
        database_id = excluded.database_id,
        table_id = excluded.table_id,
        updated_at = excluded.updated_at,
        view_count = excluded.view_count,
        bookmark_count = excluded.bookmark_count,
        official = excluded.official,
        scope = excluded.scope,
        metadata = excluded.metadata
"#;

/// Rebuild writes never overwrite a document ingested while the scan ran
const INSERT_REBUILD: &str = r#"
    INSERT INTO search_index (
        generation, model, model_id, name, description, native_query, template_tags,
        search_text, archived, collection_id, collection_path, database_id, table_id,
        updated_at, view_count, bookmark_count, official, scope, metadata
    )
    SELECT g.id, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
    FROM search_index_generation g
    WHERE g.id = ? AND g.status = 'building'
    ON CONFLICT(generation, model, model_id) DO NOTHING
"#;

/// A document with its JSON columns encoded
struct EncodedDocument<'a> {
    doc: &'a SearchDocument,
    template_tags: String,
    search_text: String,
    collection_path: String,
    scope: String,
    metadata: String,
}

impl<'a> EncodedDocument<'a> {
    fn new(doc: &'a SearchDocument) -> Result<Self> {
        Ok(Self {
            doc,
            template_tags: serde_json::to_string(&doc.template_tags)?,
            search_text: doc.search_text(),
            collection_path: serde_json::to_string(&doc.collection_path)?,
            scope: serde_json::to_string(&doc.scope)?,
            metadata: serde_json::to_string(&doc.metadata)?,
        })
    }

    fn bind<'q>(
        &'q self,
        sql: &'q str,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        let doc = self.doc;
        sqlx::query(sql)
            .bind(doc.model.as_str())
            .bind(doc.model_id)
            .bind(doc.name.as_str())
            .bind(doc.description.as_deref())
            .bind(doc.native_query.as_deref())
            .bind(self.template_tags.as_str())
            .bind(self.search_text.as_str())
            .bind(doc.archived)
            .bind(doc.collection_id)
            .bind(self.collection_path.as_str())
            .bind(doc.database_id)
            .bind(doc.table_id)
            .bind(doc.updated_at)
            .bind(doc.signals.view_count)
            .bind(doc.signals.bookmark_count)
            .bind(doc.signals.official)
            .bind(self.scope.as_str())
            .bind(self.metadata.as_str())
    }
}

#[derive(sqlx::FromRow)]
struct IndexRow {
    model: String,
    model_id: i64,
    name: String,
    description: Option<String>,
    native_query: Option<String>,
    template_tags: String,
    archived: bool,
    collection_id: Option<i64>,
    collection_path: String,
    database_id: Option<i64>,
    table_id: Option<i64>,
    updated_at: DateTime<Utc>,
    view_count: i64,
    bookmark_count: i64,
    official: bool,
    scope: String,
    metadata: String,
}

impl IndexRow {
    fn into_document(self) -> Result<SearchDocument> {
        let scope: PermissionScope = serde_json::from_str(&self.scope)?;
        Ok(SearchDocument {
            model: self.model.parse::<ModelKind>()?,
            model_id: self.model_id,
            name: self.name,
            description: self.description,
            native_query: self.native_query,
            template_tags: serde_json::from_str(&self.template_tags)?,
            archived: self.archived,
            collection_id: self.collection_id,
            collection_path: serde_json::from_str(&self.collection_path)?,
            database_id: self.database_id,
            table_id: self.table_id,
            updated_at: self.updated_at,
            signals: RankingSignals {
                view_count: self.view_count,
                bookmark_count: self.bookmark_count,
                official: self.official,
            },
            scope,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GenerationRow {
    id: i64,
    status: String,
    created_at: DateTime<Utc>,
    activated_at: Option<DateTime<Utc>>,
    documents: i64,
}

/// Escape `%`, `_` and the escape character itself for a `LIKE` pattern
fn like_pattern(token: &str) -> String {
    let mut pattern = String::with_capacity(token.len() + 2);
    pattern.push('%');
    for c in token.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// SQLite-backed persistent index
#[derive(Debug, Clone)]
pub struct SqliteIndexStore {
    pool: SqlitePool,
    pointer: Arc<GenerationPointer>,
    ranker: Ranker,
}

impl SqliteIndexStore {
    /// Open the index, loading the active generation and abandoning any
    /// rebuild a previous process left behind
    pub async fn open(pool: SqlitePool, ranker: Ranker) -> Result<Self> {
        let active: Option<(i64,)> =
            sqlx::query_as("SELECT active_generation FROM search_index_state WHERE singleton = 1")
                .fetch_optional(&pool)
                .await
                .map_err(|e| Error::IndexUnavailable(format!("index state unreadable: {}", e)))?;

        let Some((active,)) = active else {
            return Err(Error::IndexUnavailable(
                "index state row is missing".to_string(),
            ));
        };
        let active = IndexGeneration::from_i64(active)?;

        let store = Self {
            pool,
            pointer: Arc::new(GenerationPointer::new(active)),
            ranker,
        };

        let stale: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM search_index_generation WHERE status = 'building'")
                .fetch_all(&store.pool)
                .await?;
        for (id,) in stale {
            let generation = IndexGeneration::from_i64(id)?;
            tracing::warn!(generation = %generation, "Discarding unfinished rebuild");
            store.discard_generation(generation).await?;
        }

        tracing::debug!(generation = %active, "Opened search index");
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// All generations that still have rows or bookkeeping worth showing
    pub async fn generations(&self) -> Result<Vec<GenerationInfo>> {
        let rows: Vec<GenerationRow> = sqlx::query_as(
            r#"
            SELECT g.id, g.status, g.created_at, g.activated_at,
                   (SELECT COUNT(*) FROM search_index i WHERE i.generation = g.id) AS documents
            FROM search_index_generation g
            WHERE g.status IN ('building', 'active', 'retired')
            ORDER BY g.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(GenerationInfo {
                    generation: IndexGeneration::from_i64(row.id)?,
                    status: row.status.parse()?,
                    created_at: row.created_at,
                    activated_at: row.activated_at,
                    documents: row.documents.max(0) as u64,
                })
            })
            .collect()
    }

    async fn generation_status(
        conn: &mut sqlx::SqliteConnection,
        generation: IndexGeneration,
    ) -> Result<Option<GenerationStatus>> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM search_index_generation WHERE id = ?")
                .bind(generation.as_i64())
                .fetch_optional(&mut *conn)
                .await?;
        status.map(|(s,)| s.parse()).transpose()
    }

    async fn require_building(
        conn: &mut sqlx::SqliteConnection,
        generation: IndexGeneration,
    ) -> Result<()> {
        match Self::generation_status(conn, generation).await? {
            Some(GenerationStatus::Building) => Ok(()),
            Some(status) => Err(Error::ReindexFailed(format!(
                "generation {} is {}, not building",
                generation, status
            ))),
            None => Err(Error::ReindexFailed(format!(
                "generation {} does not exist",
                generation
            ))),
        }
    }

    fn candidate_query(
        ctx: &SearchContext,
        generation: IndexGeneration,
    ) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        qb.push(" WHERE generation = ").push_bind(generation.as_i64());

        let models = ctx.requested_models();
        if models.len() < ModelKind::ALL.len() {
            qb.push(" AND model IN (");
            let mut separated = qb.separated(", ");
            for model in models {
                separated.push_bind(model.as_str());
            }
            separated.push_unseparated(")");
        }

        match ctx.archived() {
            ArchivedFilter::Exclude => {
                qb.push(" AND archived = 0");
            }
            ArchivedFilter::Only => {
                qb.push(" AND archived = 1");
            }
            ArchivedFilter::Include => {}
        }

        if let Some(collection_id) = ctx.collection() {
            qb.push(" AND (collection_id = ")
                .push_bind(collection_id)
                .push(" OR EXISTS (SELECT 1 FROM json_each(search_index.collection_path) WHERE json_each.value = ")
                .push_bind(collection_id)
                .push("))");
        }

        for token in ctx.prepared().tokens() {
            qb.push(" AND search_text LIKE ")
                .push_bind(like_pattern(token))
                .push(" ESCAPE '\\'");
        }

        // Every match is ranked; the facade bounds how deep pages reach
        qb.push(" ORDER BY model, model_id");
        qb
    }
}

#[async_trait]
impl SearchBackend for SqliteIndexStore {
    fn kind(&self) -> EngineCapability {
        EngineCapability::Persistent
    }

    async fn query(&self, ctx: &SearchContext) -> Result<EngineOutput> {
        // One snapshot per request
        let generation = self.pointer.load();

        let mut qb = Self::candidate_query(ctx, generation);
        let rows: Vec<IndexRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let key = format!("{}:{}", row.model, row.model_id);
            match row.into_document() {
                Ok(doc) => documents.push(doc),
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping undecodable index row"),
            }
        }

        let results = self.ranker.rank(ctx.prepared(), documents, ctx.now());
        Ok(EngineOutput {
            generation: Some(generation),
            results,
        })
    }
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn upsert(&self, documents: &[SearchDocument]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let encoded = documents
            .iter()
            .map(EncodedDocument::new)
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        for doc in &encoded {
            doc.bind(UPSERT_LIVE).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        tracing::debug!(documents = documents.len(), "Upserted search documents");
        Ok(())
    }

    async fn delete(&self, keys: &[DocKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query(
                r#"
                DELETE FROM search_index
                WHERE model = ? AND model_id = ?
                  AND generation IN (
                      SELECT id FROM search_index_generation WHERE status IN ('active', 'building')
                  )
                "#,
            )
            .bind(key.model.as_str())
            .bind(key.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(documents = keys.len(), "Deleted search documents");
        Ok(())
    }

    async fn begin_generation(&self) -> Result<IndexGeneration> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO search_index_generation (id, status)
            VALUES ((SELECT COALESCE(MAX(id), 0) + 1 FROM search_index_generation), 'building')
            RETURNING id
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let generation = IndexGeneration::from_i64(id)?;
        tracing::info!(generation = %generation, "Started index generation");
        Ok(generation)
    }

    async fn write_generation(
        &self,
        generation: IndexGeneration,
        documents: &[SearchDocument],
    ) -> Result<()> {
        let encoded = documents
            .iter()
            .map(EncodedDocument::new)
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        Self::require_building(&mut tx, generation).await?;
        for doc in &encoded {
            doc.bind(INSERT_REBUILD)
                .bind(generation.as_i64())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn activate_generation(&self, generation: IndexGeneration) -> Result<()> {
        let previous = self.pointer.load();

        let mut tx = self.pool.begin().await?;
        Self::require_building(&mut tx, generation).await?;

        // The generation retired by the last swap has outlived its readers
        sqlx::query(
            r#"
            DELETE FROM search_index WHERE generation IN (
                SELECT id FROM search_index_generation WHERE status = 'retired'
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE search_index_generation SET status = 'purged' WHERE status = 'retired'")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE search_index_generation SET status = 'retired' WHERE status = 'active'")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE search_index_generation SET status = 'active', activated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(generation.as_i64())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE search_index_state SET active_generation = ?, updated_at = CURRENT_TIMESTAMP WHERE singleton = 1",
        )
        .bind(generation.as_i64())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.pointer
            .compare_and_swap(previous, generation)
            .map_err(|observed| {
                Error::ReindexFailed(format!(
                    "generation pointer moved to {} while activating {}",
                    observed, generation
                ))
            })?;

        tracing::info!(
            generation = %generation,
            previous = %previous,
            "Activated index generation"
        );
        Ok(())
    }

    async fn discard_generation(&self, generation: IndexGeneration) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        match Self::generation_status(&mut tx, generation).await? {
            Some(GenerationStatus::Building) => {}
            Some(GenerationStatus::Active) => {
                return Err(Error::InvalidInput(format!(
                    "generation {} is serving reads and cannot be discarded",
                    generation
                )));
            }
            // Already gone
            Some(_) | None => return Ok(()),
        }

        sqlx::query("DELETE FROM search_index WHERE generation = ?")
            .bind(generation.as_i64())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE search_index_generation SET status = 'cancelled' WHERE id = ?")
            .bind(generation.as_i64())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(generation = %generation, "Discarded index generation");
        Ok(())
    }

    fn current_generation(&self) -> IndexGeneration {
        self.pointer.load()
    }

    async fn document_count(&self, generation: IndexGeneration) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_index WHERE generation = ?")
            .bind(generation.as_i64())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
