mod session;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub use session::{SessionRow, SessionTable};

use crate::backend::BackendSettings;
use crate::error::SessionError;

/// How long a connection waits for another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl From<sqlx::Error> for SessionError {
    fn from(e: sqlx::Error) -> Self {
        SessionError::unavailable(format!("database error: {}", e))
    }
}

/// SQLite-backed session backend.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    settings: Arc<BackendSettings>,
}

impl Database {
    /// Open or create a database at the given path.
    /// Use ":memory:" for an in-memory database.
    pub async fn open(path: &str, settings: BackendSettings) -> Result<Self, sqlx::Error> {
        let (options, max_connections) = if path == ":memory:" {
            // Every connection to sqlite::memory: is a distinct database.
            (SqliteConnectOptions::from_str("sqlite::memory:")?, 1)
        } else {
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            (options, 5)
        };
        // Concurrent writers wait for the lock instead of failing with SQLITE_BUSY.
        let options = options.busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            settings: Arc::new(settings),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// Get the current schema version.
    async fn get_version(&self) -> Result<i32, sqlx::Error> {
        let result: Option<(i32,)> = sqlx::query_as("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(result.map(|r| r.0).unwrap_or(0))
    }

    /// Set the schema version within a transaction.
    async fn set_version(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        version: i32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM schema_version")
            .execute(&mut **tx)
            .await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await?;

        let version = self.get_version().await?;

        if version < 1 {
            self.migrate_v1().await?;
        }

        Ok(())
    }

    /// Execute a list of queries in a transaction, then set the version.
    async fn run_migration(
        &self,
        version: i32,
        queries: &[&'static str],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for query in queries {
            sqlx::query(*query).execute(&mut *tx).await?;
        }
        Self::set_version(&mut tx, version).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn migrate_v1(&self) -> Result<(), sqlx::Error> {
        self.run_migration(
            1,
            &[
                "CREATE TABLE sessions (
                    session_handle TEXT PRIMARY KEY NOT NULL,
                    user_id TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    refresh_jti TEXT UNIQUE NOT NULL,
                    anti_csrf TEXT,
                    expires_at INTEGER NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                )",
                "CREATE INDEX idx_sessions_user_id ON sessions(user_id)",
                "CREATE INDEX idx_sessions_expires_at ON sessions(expires_at)",
                // Rotated refresh tokens, kept until expiry to detect reuse
                "CREATE TABLE consumed_refresh_tokens (
                    jti TEXT PRIMARY KEY NOT NULL,
                    session_handle TEXT NOT NULL,
                    expires_at INTEGER NOT NULL
                )",
                "CREATE INDEX idx_consumed_session ON consumed_refresh_tokens(session_handle)",
                "CREATE INDEX idx_consumed_expires_at ON consumed_refresh_tokens(expires_at)",
            ],
        )
        .await
    }

    /// Get the session table.
    pub fn sessions(&self) -> SessionTable {
        SessionTable::new(self.pool.clone())
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    /// Get the underlying connection pool (for tests that need raw SQL access).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
