//! SQLite implementation of [`SessionStore`].
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are run automatically
//! on startup via [`SqliteStore::connect`].
//!
//! # Migrations path
//!
//! `sqlx::migrate!("./migrations")` resolves the path at compile time
//! relative to `CARGO_MANIFEST_DIR`, so the directory is embedded into the
//! binary. The database location comes from `REELFORGE_DATABASE_URL` at
//! runtime.
//!
//! # Queries
//!
//! The runtime-verified `sqlx::query` form is used so no `DATABASE_URL` is
//! needed at compile time.

use std::str::FromStr;

use async_trait::async_trait;
use reelforge_core::{RuntimeError, SessionSnapshot, SessionStore};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::debug;

/// SQLite-backed snapshot store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g.
    /// `"sqlite://reelforge.db"` or `"sqlite::memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to `:memory:` is its own database.
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new().connect_with(options).await?
        };
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Session ids with a stored snapshot, most recently updated first.
    pub async fn list_sessions(&self) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT session_id FROM session_snapshots ORDER BY updated_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

fn store_error(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Store(e.to_string())
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn load_snapshot(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSnapshot>, RuntimeError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT snapshot FROM session_snapshots WHERE session_id = ?1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error)?;
        row.map(|(text,)| serde_json::from_str(&text).map_err(store_error))
            .transpose()
    }

    async fn save_snapshot(
        &self,
        session_id: &str,
        snapshot: &SessionSnapshot,
    ) -> Result<(), RuntimeError> {
        let text = serde_json::to_string(snapshot).map_err(store_error)?;
        let revision = i64::try_from(snapshot.revision).unwrap_or(i64::MAX);
        let updated_at = snapshot.updated_at.to_rfc3339();
        sqlx::query(
            "INSERT INTO session_snapshots (session_id, snapshot, revision, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(session_id) DO UPDATE SET snapshot = ?2, revision = ?3, updated_at = ?4",
        )
        .bind(session_id)
        .bind(&text)
        .bind(revision)
        .bind(&updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        debug!(session = %session_id, revision, "snapshot saved");
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use reelforge_core::{TaskInput, TaskKind, TaskRecord};

    use super::*;

    #[tokio::test]
    async fn missing_session_loads_as_none() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        assert!(store.load_snapshot("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_previous_snapshot() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();

        let mut snapshot = SessionSnapshot::new("s1");
        store.save_snapshot("s1", &snapshot).await.unwrap();

        snapshot
            .tasks
            .push(TaskRecord::new(TaskKind::Image, TaskInput::prompt("a cat")));
        snapshot.revision = 7;
        store.save_snapshot("s1", &snapshot).await.unwrap();

        let loaded = store.load_snapshot("s1").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(store.list_sessions().await.unwrap(), vec!["s1".to_owned()]);
    }
}
