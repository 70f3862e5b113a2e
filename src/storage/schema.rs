use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::newsletters::MAX_NEWSLETTERS;
use super::types::{is_lock_message, DatabaseError};

// ============================================================================
// Database
// ============================================================================

/// SQLite-backed store for newsletters, sources, tags and reading-queue rows.
///
/// This is the remote collaborator of the cache engine; see
/// [`crate::remote::RemoteStore`] for the contract the engine relies on.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    /// Newest newsletters per user the list and its aggregates cover.
    pub(crate) list_limit: i64,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database backed by a single
    /// long-lived connection (each SQLite connection would otherwise see its
    /// own empty database).
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another instance holds the
    /// database lock, `DatabaseError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", path)
        };

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks before SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            // SQLite is single-writer; a handful of connections covers the
            // concurrent reads issued by a settle pass.
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self {
            pool,
            list_limit: MAX_NEWSLETTERS,
        };
        db.migrate().await.map_err(|e| {
            if is_lock_message(&e.to_string()) {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        tracing::debug!(path = %path, "Database opened");
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                UNIQUE(user_id, name)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS newsletters (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                source_id INTEGER REFERENCES sources(id) ON DELETE SET NULL,
                title TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_liked INTEGER NOT NULL DEFAULT 0,
                is_archived INTEGER NOT NULL DEFAULT 0,
                received_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                UNIQUE(user_id, name)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS newsletter_tags (
                newsletter_id INTEGER NOT NULL REFERENCES newsletters(id) ON DELETE CASCADE,
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (newsletter_id, tag_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // A user queues a newsletter at most once.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reading_queue (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                newsletter_id INTEGER NOT NULL REFERENCES newsletters(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(user_id, newsletter_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Newsletter list ordering and the unread aggregate
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_newsletters_user_received ON newsletters(user_id, received_at DESC)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_newsletters_unread ON newsletters(user_id) WHERE is_read = 0 AND is_archived = 0",
        )
        .execute(&mut *tx)
        .await?;
        // Per-source count aggregation
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_newsletters_source_archived ON newsletters(source_id, is_archived)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reading_queue_user_position ON reading_queue(user_id, position, id)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
