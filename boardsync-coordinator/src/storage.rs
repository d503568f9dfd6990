//! Durable task storage behind the write-behind flush queue.
//!
//! The coordinator treats storage as a key-value upsert/delete sink keyed by
//! task id: the cache is authoritative and storage lags it by at most the
//! flush delay plus retry backoff. [`PgTaskStore`] is the production
//! implementation; [`MemoryTaskStore`] backs tests and cache-only
//! deployments, and counts operations so tests can assert on write
//! coalescing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;

use boardsync_proto::task::{ColumnId, Task, TaskId};

use crate::conflict::ConflictAudit;

/// Errors from durable storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying database reported a failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored record could not be mapped back to a task.
    #[error("corrupt stored record: {0}")]
    Decode(String),
}

/// A durable sink for task records and conflict audit rows.
///
/// Implementations must be safe to call from multiple flush workers at
/// once; per-id serialization is the flush queue's job, not the store's.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts or fully replaces a task record.
    async fn upsert(&self, task: &Task) -> Result<(), StoreError>;

    /// Upserts a batch of tasks, all-or-nothing where the backend allows.
    async fn upsert_many(&self, tasks: &[Task]) -> Result<(), StoreError>;

    /// Removes a task record. Deleting a missing id is not an error.
    async fn delete(&self, id: &TaskId) -> Result<(), StoreError>;

    /// Fetches a single task record.
    async fn fetch(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    /// Fetches every task record on the board.
    async fn fetch_all(&self) -> Result<Vec<Task>, StoreError>;

    /// Appends a conflict audit row.
    async fn append_audit(&self, audit: &ConflictAudit) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-memory [`TaskStore`] with operation counters.
///
/// The counters let tests assert that the flush queue coalesced a burst of
/// enqueues into a single durable write.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    audits: RwLock<Vec<ConflictAudit>>,
    upserts: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryTaskStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with the given tasks, for cold-start
    /// hydration tests.
    #[must_use]
    pub fn seeded(tasks: Vec<Task>) -> Self {
        let map = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            tasks: RwLock::new(map),
            ..Self::default()
        }
    }

    /// Number of single-task upserts executed so far.
    #[must_use]
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }

    /// Number of deletes executed so far.
    #[must_use]
    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Snapshot of all audit rows written so far.
    pub async fn audit_rows(&self) -> Vec<ConflictAudit> {
        self.audits.read().await.clone()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn upsert(&self, task: &Task) -> Result<(), StoreError> {
        self.upserts.fetch_add(1, Ordering::Relaxed);
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn upsert_many(&self, batch: &[Task]) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        for task in batch {
            tasks.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let mut tasks = self.tasks.write().await;
        tasks.remove(id);
        Ok(())
    }

    async fn fetch(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(id).cloned())
    }

    async fn fetch_all(&self) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.values().cloned().collect())
    }

    async fn append_audit(&self, audit: &ConflictAudit) -> Result<(), StoreError> {
        let mut audits = self.audits.write().await;
        audits.push(audit.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "id, column_id, title, description, sort_order, version, \
     created_at, updated_at, creator_name, creator_color, updated_by_name, updated_by_color";

/// Postgres-backed [`TaskStore`] over a connection pool.
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    /// Connects a pool to the given database URL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the pool cannot be established.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_with<'e, E>(executor: E, task: &Task) -> Result<(), StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r"
            INSERT INTO tasks (id, column_id, title, description, sort_order, version,
                               created_at, updated_at, creator_name, creator_color,
                               updated_by_name, updated_by_color)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                column_id = EXCLUDED.column_id,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                sort_order = EXCLUDED.sort_order,
                version = EXCLUDED.version,
                updated_by_name = EXCLUDED.updated_by_name,
                updated_by_color = EXCLUDED.updated_by_color
            ",
        )
        .bind(task.id.as_uuid())
        .bind(task.column.as_str())
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.order)
        .bind(to_db_int(task.version))
        .bind(to_db_time(task.created_at))
        .bind(to_db_time(task.updated_at))
        .bind(&task.creator_name)
        .bind(&task.creator_color)
        .bind(&task.updated_by_name)
        .bind(&task.updated_by_color)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn upsert(&self, task: &Task) -> Result<(), StoreError> {
        Self::upsert_with(&self.pool, task).await
    }

    async fn upsert_many(&self, batch: &[Task]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for task in batch {
            Self::upsert_with(&mut *tx, task).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn fetch_all(&self) -> Result<Vec<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY column_id, sort_order");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn append_audit(&self, audit: &ConflictAudit) -> Result<(), StoreError> {
        let resolved = serde_json::to_value(&audit.resolved_state)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        sqlx::query(
            r"
            INSERT INTO conflict_audit_log
                (task_id, winner_event, loser_event, winner_user_id, loser_user_id,
                 resolved_state, resolution_msg, conflict_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(audit.task_id.as_uuid())
        .bind(&audit.winner_event)
        .bind(&audit.loser_event)
        .bind(&audit.winner_user_id)
        .bind(&audit.loser_user_id)
        .bind(resolved)
        .bind(&audit.message)
        .bind(to_db_time(audit.at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn to_db_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_db_time(ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(to_db_int(ms)).unwrap_or_default()
}

fn from_db_time(time: DateTime<Utc>) -> u64 {
    u64::try_from(time.timestamp_millis()).unwrap_or(0)
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<Task, StoreError> {
    let column: String = row.try_get("column_id")?;
    let column = column.parse::<ColumnId>().map_err(StoreError::Decode)?;
    let version: i64 = row.try_get("version")?;
    let version =
        u64::try_from(version).map_err(|_| StoreError::Decode(format!("version {version}")))?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(Task {
        id: TaskId::from_uuid(row.try_get("id")?),
        column,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        order: row.try_get("sort_order")?,
        version,
        created_at: from_db_time(created_at),
        updated_at: from_db_time(updated_at),
        creator_name: row.try_get("creator_name")?,
        creator_color: row.try_get("creator_color")?,
        updated_by_name: row.try_get("updated_by_name")?,
        updated_by_color: row.try_get("updated_by_color")?,
    })
}
