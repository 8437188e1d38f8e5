//! Database migrations
//!
//! This module manages SQLite schema migrations for the search core.
//! Migrations are versioned and applied automatically on database connection.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Live entity rows written by the CRUD layer
const MIGRATION_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS app_entity (
        model TEXT NOT NULL,
        model_id INTEGER NOT NULL,
        payload TEXT NOT NULL,              -- JSON-encoded entity, tagged by model
        archived INTEGER NOT NULL DEFAULT 0,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (model, model_id)
    );

    CREATE INDEX IF NOT EXISTS idx_app_entity_model ON app_entity(model);
"#;

/// Migration 2: Generation-versioned search index
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS search_index_generation (
        id INTEGER PRIMARY KEY NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('building', 'active', 'retired', 'cancelled', 'purged')),
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        activated_at TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_search_index_generation_status
        ON search_index_generation(status);

    -- Single row pointing at the generation readers should use
    CREATE TABLE IF NOT EXISTS search_index_state (
        singleton INTEGER PRIMARY KEY NOT NULL CHECK (singleton = 1),
        active_generation INTEGER NOT NULL,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS search_index (
        generation INTEGER NOT NULL,
        model TEXT NOT NULL,
        model_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        native_query TEXT,
        template_tags TEXT NOT NULL DEFAULT '[]',
        search_text TEXT NOT NULL,          -- normalized text used for candidate matching
        archived INTEGER NOT NULL DEFAULT 0,
        collection_id INTEGER,
        collection_path TEXT NOT NULL DEFAULT '[]',
        database_id INTEGER,
        table_id INTEGER,
        updated_at TIMESTAMP NOT NULL,
        view_count INTEGER NOT NULL DEFAULT 0,
        bookmark_count INTEGER NOT NULL DEFAULT 0,
        official INTEGER NOT NULL DEFAULT 0,
        scope TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (generation, model, model_id)
    );

    CREATE INDEX IF NOT EXISTS idx_search_index_generation_model
        ON search_index(generation, model);
    CREATE INDEX IF NOT EXISTS idx_search_index_generation_archived
        ON search_index(generation, archived);

    INSERT OR IGNORE INTO search_index_generation (id, status, activated_at)
        VALUES (1, 'active', CURRENT_TIMESTAMP);
    INSERT OR IGNORE INTO search_index_state (singleton, active_generation)
        VALUES (1, 1);
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Live entity table");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Generation-versioned search index");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool")
    }

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await;

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, 0);
        assert!(status.needs_migration);

        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
        assert!(!status.needs_migration);
        assert!(!needs_migration(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = create_test_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_initial_generation_seeded() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        let (active,): (i64,) =
            sqlx::query_as("SELECT active_generation FROM search_index_state WHERE singleton = 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(active, 1);

        let (status,): (String,) =
            sqlx::query_as("SELECT status FROM search_index_generation WHERE id = 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "active");

        for table in ["app_entity", "search_index"] {
            let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap_or_else(|_| panic!("Table {} should exist", table));
            assert_eq!(count, 0, "Table {} should be empty", table);
        }
    }
}
