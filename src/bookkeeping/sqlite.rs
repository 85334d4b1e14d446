//! SQLite bookkeeping through sqlx

use crate::error::{Error, Result, StoreError};
use async_trait::async_trait;
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::{BookkeepingStore, CompletionRecord};

/// Bookkeeping in a local SQLite file
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn query_failed(what: &str) -> impl FnOnce(sqlx::Error) -> Error + '_ {
    move |e| Error::Store(StoreError::QueryFailed(format!("{}: {}", what, e)))
}

fn migration_failed(what: &str) -> impl FnOnce(sqlx::Error) -> Error + '_ {
    move |e| Error::Store(StoreError::MigrationFailed(format!("{}: {}", what, e)))
}

impl SqliteStore {
    /// Open (or create) the database file and run migrations
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Store(StoreError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Store(StoreError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Store(StoreError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let store = Self { pool };
        store.run_migrations().await?;
        tracing::debug!(path = %path.display(), "opened sqlite bookkeeping store");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Store(StoreError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(migration_failed("Failed to create schema_version table"))?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_one(&mut *conn)
                .await
                .map_err(query_failed("Failed to query schema version"))?;

        if current_version.unwrap_or(0) < 1 {
            Self::migrate_v1(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: transfers and archive passwords
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying bookkeeping migration v1");

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(migration_failed("Failed to begin transaction"))?;

        let result = async {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS transfers (
                    key TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    size INTEGER,
                    md5 TEXT,
                    destination TEXT,
                    completed_at INTEGER NOT NULL
                )
                "#,
            )
            .execute(&mut *conn)
            .await
            .map_err(migration_failed("Failed to create transfers table"))?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS rar_files (
                    hash TEXT PRIMARY KEY,
                    filename TEXT NOT NULL,
                    password TEXT NOT NULL
                )
                "#,
            )
            .execute(&mut *conn)
            .await
            .map_err(migration_failed("Failed to create rar_files table"))?;

            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (1, ?)")
                .bind(chrono::Utc::now().timestamp())
                .execute(&mut *conn)
                .await
                .map_err(migration_failed("Failed to record migration"))?;

            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(migration_failed("Failed to commit migration"))?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl BookkeepingStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn has_completed(&self, key: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM transfers WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("Failed to look up transfer"))?;
        Ok(found.is_some())
    }

    async fn mark_completed(&self, key: &str, record: &CompletionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transfers (key, name, size, md5, destination, completed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                name = excluded.name,
                size = excluded.size,
                md5 = excluded.md5,
                destination = excluded.destination,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(key)
        .bind(&record.name)
        .bind(record.size.and_then(|s| i64::try_from(s).ok()))
        .bind(record.md5.as_deref())
        .bind(record.destination.as_deref())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to record transfer"))?;

        Ok(())
    }

    async fn cached_password(&self, md5: &str) -> Result<Option<String>> {
        let password: Option<String> =
            sqlx::query_scalar("SELECT password FROM rar_files WHERE hash = ?")
                .bind(md5)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_failed("Failed to get cached password"))?;

        Ok(password)
    }

    async fn save_password(&self, filename: &str, md5: &str, password: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rar_files (hash, filename, password)
            VALUES (?, ?, ?)
            ON CONFLICT(hash) DO UPDATE SET
                filename = excluded.filename,
                password = excluded.password
            "#,
        )
        .bind(md5)
        .bind(filename)
        .bind(password)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to save password"))?;

        Ok(())
    }
}
