//! SQLite session store.
//!
//! One row per `(user_id, session_id)`. The `version` column is the
//! authority for optimistic concurrency; the JSON document is rewritten
//! whole on every commit.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info, warn};
use turnkeep_core::error::StoreError;
use turnkeep_core::session::{SessionDocument, SessionKey, SessionStore};

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (or create) a session database.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database; it is pinned to a
    /// single connection so every query sees the same data.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite://{path}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let max_connections = if path.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite session store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                user_id      TEXT NOT NULL,
                session_id   TEXT NOT NULL,
                version      INTEGER NOT NULL,
                document     TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                PRIMARY KEY (user_id, session_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("sessions table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_user_updated ON sessions(user_id, updated_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("updated_at index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    async fn current_version(&self, key: &SessionKey) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT version FROM sessions WHERE user_id = ?1 AND session_id = ?2")
            .bind(&key.user_id)
            .bind(&key.session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("version lookup: {e}")))?;
        match row {
            Some(row) => {
                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| StoreError::QueryFailed(format!("version column: {e}")))?;
                Ok(version as u64)
            }
            None => Ok(0),
        }
    }

    fn stamped(doc: &SessionDocument, version: u64) -> Result<String, StoreError> {
        let mut doc = doc.clone();
        doc.version = version;
        doc.updated_at = Utc::now();
        doc.to_json()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load(&self, key: &SessionKey) -> Result<Option<SessionDocument>, StoreError> {
        let row = sqlx::query(
            "SELECT version, document FROM sessions WHERE user_id = ?1 AND session_id = ?2",
        )
        .bind(&key.user_id)
        .bind(&key.session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("load: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row
            .try_get("version")
            .map_err(|e| StoreError::QueryFailed(format!("version column: {e}")))?;
        let raw: String = row
            .try_get("document")
            .map_err(|e| StoreError::QueryFailed(format!("document column: {e}")))?;

        let mut doc = SessionDocument::from_json(&key.session_id, &raw)?;
        doc.version = version as u64;
        Ok(Some(doc))
    }

    async fn commit(
        &self,
        key: &SessionKey,
        doc: &SessionDocument,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let new_version = expected_version + 1;
        let json = Self::stamped(doc, new_version)?;
        let now = Utc::now().to_rfc3339();

        let result = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO sessions (user_id, session_id, version, document, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(user_id, session_id) DO NOTHING
                "#,
            )
            .bind(&key.user_id)
            .bind(&key.session_id)
            .bind(new_version as i64)
            .bind(&json)
            .bind(&now)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE sessions SET version = ?1, document = ?2, updated_at = ?3
                WHERE user_id = ?4 AND session_id = ?5 AND version = ?6
                "#,
            )
            .bind(new_version as i64)
            .bind(&json)
            .bind(&now)
            .bind(&key.user_id)
            .bind(&key.session_id)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await
        }
        .map_err(|e| StoreError::QueryFailed(format!("commit: {e}")))?;

        if result.rows_affected() == 0 {
            let found = self.current_version(key).await?;
            warn!(session = %key, expected = expected_version, found, "Commit lost version race");
            return Err(StoreError::VersionConflict {
                session_id: key.session_id.clone(),
                expected: expected_version,
                found,
            });
        }

        debug!(session = %key, version = new_version, "Session committed");
        Ok(new_version)
    }

    async fn force_commit(&self, key: &SessionKey, doc: &SessionDocument) -> Result<u64, StoreError> {
        let new_version = self.current_version(key).await? + 1;
        let json = Self::stamped(doc, new_version)?;

        sqlx::query(
            r#"
            INSERT INTO sessions (user_id, session_id, version, document, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_id, session_id) DO UPDATE SET
                version = MAX(sessions.version + 1, excluded.version),
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key.user_id)
        .bind(&key.session_id)
        .bind(new_version as i64)
        .bind(&json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("force commit: {e}")))?;

        self.current_version(key).await
    }

    async fn list(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT session_id FROM sessions WHERE user_id = ?1 ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list: {e}")))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("session_id")
                    .map_err(|e| StoreError::QueryFailed(format!("session_id column: {e}")))
            })
            .collect()
    }

    async fn delete(&self, key: &SessionKey) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?1 AND session_id = ?2")
            .bind(&key.user_id)
            .bind(&key.session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("delete: {e}")))?;
        Ok(result.rows_affected() > 0)
    }
}
