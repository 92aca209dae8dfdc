use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::engine::types::{Run, RunId};
use crate::storage::{
    JobStore, StepCommit, StoreError, cancelled, dispatched, parse_run_key, run_key, settled,
};

const RUNS_SEQUENCE: &str = "runs";

/// SQLite-backed job store.
///
/// Layout:
/// - `runs`: decimal run id → JSON-serialized [`Run`]
/// - `active_runs`: decimal run id, membership only
/// - `sequences`: the `runs` id sequence
///
/// The pool holds a single connection, so transactions never contend.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if missing) a store file and ensure its schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(sqlx::Error::Io)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        debug!(path = %path.display(), "Opening job store");
        Self::connect(options).await
    }

    /// A private, throwaway database. Lives as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS runs (key TEXT PRIMARY KEY NOT NULL, record TEXT NOT NULL)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS active_runs (key TEXT PRIMARY KEY NOT NULL)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sequences (name TEXT PRIMARY KEY NOT NULL, value INTEGER NOT NULL)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT OR IGNORE INTO sequences (name, value) VALUES (?, 0)")
            .bind(RUNS_SEQUENCE)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn read_run(conn: &mut SqliteConnection, id: RunId) -> Result<Run, StoreError> {
    let record: Option<String> = sqlx::query_scalar("SELECT record FROM runs WHERE key = ?")
        .bind(run_key(id))
        .fetch_optional(&mut *conn)
        .await?;
    let record = record.ok_or(StoreError::NotFound(id))?;
    Ok(serde_json::from_str(&record)?)
}

async fn write_run(conn: &mut SqliteConnection, run: &Run) -> Result<(), StoreError> {
    let record = serde_json::to_string(run)?;
    sqlx::query(
        "INSERT INTO runs (key, record) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET record = excluded.record",
    )
    .bind(run_key(run.id))
    .bind(record)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn is_active(conn: &mut SqliteConnection, id: RunId) -> Result<bool, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM active_runs WHERE key = ?")
        .bind(run_key(id))
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

async fn set_active(conn: &mut SqliteConnection, id: RunId) -> Result<(), StoreError> {
    sqlx::query("INSERT OR IGNORE INTO active_runs (key) VALUES (?)")
        .bind(run_key(id))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn unset_active(conn: &mut SqliteConnection, id: RunId) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM active_runs WHERE key = ?")
        .bind(run_key(id))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn next_id(conn: &mut SqliteConnection) -> Result<RunId, StoreError> {
    sqlx::query("UPDATE sequences SET value = value + 1 WHERE name = ?")
        .bind(RUNS_SEQUENCE)
        .execute(&mut *conn)
        .await?;
    let value: i64 = sqlx::query_scalar("SELECT value FROM sequences WHERE name = ?")
        .bind(RUNS_SEQUENCE)
        .fetch_one(&mut *conn)
        .await?;
    RunId::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("negative sequence value {}", value)))
}

async fn list_active(conn: &mut SqliteConnection) -> Result<Vec<RunId>, StoreError> {
    let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM active_runs")
        .fetch_all(&mut *conn)
        .await?;
    let mut ids = keys
        .iter()
        .map(|k| parse_run_key(k))
        .collect::<Result<Vec<_>, _>>()?;
    ids.sort_unstable();
    Ok(ids)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn allocate_id(&self) -> Result<RunId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id = next_id(&mut tx).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn put_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        write_run(&mut conn, run).await
    }

    async fn get_run(&self, id: RunId) -> Result<Run, StoreError> {
        let mut conn = self.pool.acquire().await?;
        read_run(&mut conn, id).await
    }

    async fn mark_active(&self, id: RunId) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        set_active(&mut conn, id).await
    }

    async fn mark_inactive(&self, id: RunId) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        unset_active(&mut conn, id).await
    }

    async fn active_ids(&self) -> Result<Vec<RunId>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        list_active(&mut conn).await
    }

    async fn create_run(&self, run: &Run) -> Result<Run, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut run = run.clone();
        run.id = next_id(&mut tx).await?;
        write_run(&mut tx, &run).await?;
        set_active(&mut tx, run.id).await?;
        tx.commit().await?;
        Ok(run)
    }

    async fn load_active(&self) -> Result<Vec<Run>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let ids = list_active(&mut tx).await?;
        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            let run = read_run(&mut tx, id).await.map_err(|e| match e {
                StoreError::NotFound(id) => {
                    StoreError::Corrupt(format!("active run {} has no record", id))
                }
                other => other,
            })?;
            runs.push(run);
        }
        tx.commit().await?;
        Ok(runs)
    }

    async fn begin_step(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !is_active(&mut tx, id).await? {
            return Ok(None);
        }
        let run = dispatched(read_run(&mut tx, id).await?);
        write_run(&mut tx, &run).await?;
        tx.commit().await?;
        Ok(Some(run))
    }

    async fn complete_step(
        &self,
        run: &Run,
        dispatched_generation: u64,
    ) -> Result<StepCommit, StoreError> {
        let mut tx = self.pool.begin().await?;
        let persisted = read_run(&mut tx, run.id).await?;
        if persisted.generation != dispatched_generation || !is_active(&mut tx, run.id).await? {
            return Ok(StepCommit::Stale {
                persisted_generation: persisted.generation,
            });
        }

        let settled = settled(&persisted, run);
        write_run(&mut tx, &settled).await?;
        let commit = if settled.is_stopped() {
            unset_active(&mut tx, settled.id).await?;
            StepCommit::Finished(settled)
        } else {
            StepCommit::Applied(settled)
        };
        tx.commit().await?;
        Ok(commit)
    }

    async fn cancel_run(&self, id: RunId, message: &str) -> Result<Option<Run>, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !is_active(&mut tx, id).await? {
            return Ok(None);
        }
        let persisted = read_run(&mut tx, id).await?;
        let terminal = if persisted.is_stopped() {
            persisted
        } else {
            let run = cancelled(persisted, message);
            write_run(&mut tx, &run).await?;
            run
        };
        unset_active(&mut tx, id).await?;
        tx.commit().await?;
        Ok(Some(terminal))
    }
}
