//! Authoritative in-memory board state.
//!
//! The cache owns the live [`Task`] records plus two indices: a per-column
//! membership set and a global board set. All reads are cache-first; durable
//! storage is only consulted on a miss (or on cold start), and the flush
//! queue reconciles storage back to the cache asynchronously.
//!
//! Every multi-key mutation happens inside a single write-lock critical
//! section, so a concurrent `list_all` never observes a task in two columns
//! or in zero columns while the task logically exists.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use boardsync_proto::task::{ColumnId, Task, TaskId};

use crate::storage::{StoreError, TaskStore};

/// Sliding entry TTL; refreshed on every read.
pub const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// How long a deleted id blocks re-hydration from (still lagging) storage.
/// Covers the flush delay plus the full retry backoff budget.
const TOMBSTONE_TTL: Duration = Duration::from_secs(30);

struct Entry {
    task: Task,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<TaskId, Entry>,
    columns: HashMap<ColumnId, HashSet<TaskId>>,
    board: HashSet<TaskId>,
    tombstones: HashMap<TaskId, Instant>,
    hydrated: bool,
}

impl CacheInner {
    /// Inserts a task record and both index memberships in one step.
    fn index_put(&mut self, task: Task, expires_at: Instant) {
        let id = task.id.clone();
        // A column change must not leave the id behind in the old set.
        if let Some(previous) = self.entries.get(&id)
            && previous.task.column != task.column
            && let Some(set) = self.columns.get_mut(&previous.task.column)
        {
            set.remove(&id);
        }
        self.columns
            .entry(task.column)
            .or_default()
            .insert(id.clone());
        self.board.insert(id.clone());
        self.tombstones.remove(&id);
        self.entries.insert(id, Entry { task, expires_at });
    }

    /// Removes a task record and both index memberships in one step.
    fn index_remove(&mut self, id: &TaskId) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        if let Some(set) = self.columns.get_mut(&entry.task.column) {
            set.remove(id);
        }
        self.board.remove(id);
        true
    }

    fn tombstoned(&mut self, id: &TaskId, now: Instant) -> bool {
        match self.tombstones.get(id) {
            Some(deadline) if now < *deadline => true,
            Some(_) => {
                self.tombstones.remove(id);
                false
            }
            None => false,
        }
    }
}

/// The authoritative hot store for board tasks.
///
/// Shared across the router, service, and flush workers via `Arc`.
pub struct AuthoritativeCache {
    inner: RwLock<CacheInner>,
    store: Arc<dyn TaskStore>,
    ttl: Duration,
}

impl AuthoritativeCache {
    /// Creates a cache hydrating from the given store, with the default TTL.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self::with_ttl(store, CACHE_TTL)
    }

    /// Creates a cache with a custom entry TTL (used by expiry tests).
    #[must_use]
    pub fn with_ttl(store: Arc<dyn TaskStore>, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            store,
            ttl,
        }
    }

    /// Writes a task record plus its column and board memberships.
    pub async fn put(&self, task: Task) {
        let expires_at = Instant::now() + self.ttl;
        let mut inner = self.inner.write().await;
        inner.index_put(task, expires_at);
    }

    /// Reads a task, refreshing its TTL.
    ///
    /// On a miss (or an expired entry) the cache hydrates itself from
    /// durable storage and backfills the indices before returning.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the hydration read fails.
    pub async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let now = Instant::now();
        {
            let mut inner = self.inner.write().await;
            if inner.tombstoned(id, now) {
                return Ok(None);
            }
            if let Some(entry) = inner.entries.get_mut(id)
                && entry.expires_at > now
            {
                entry.expires_at = now + self.ttl;
                return Ok(Some(entry.task.clone()));
            }
            // An expired entry stays in place until storage supplies a
            // replacement; it is still the newest state the board knows.
        }

        let fetched = self.store.fetch(id).await?;

        let mut inner = self.inner.write().await;
        if inner.tombstoned(id, now) {
            return Ok(None);
        }
        match fetched {
            Some(stored) => {
                // Versions only move cache -> storage, so a cache entry at
                // or above the stored version wins (a racing live write, or
                // an expired entry whose flush has not landed yet).
                if let Some(entry) = inner.entries.get_mut(id)
                    && entry.task.version >= stored.version
                {
                    entry.expires_at = now + self.ttl;
                    return Ok(Some(entry.task.clone()));
                }
                inner.index_put(stored.clone(), now + self.ttl);
                Ok(Some(stored))
            }
            None => {
                if let Some(entry) = inner.entries.get_mut(id) {
                    entry.expires_at = now + self.ttl;
                    return Ok(Some(entry.task.clone()));
                }
                Ok(None)
            }
        }
    }

    /// Applies a field-level mutation to a task inside one write-lock
    /// critical section, returning the resulting record.
    ///
    /// This is what makes the move+edit merge lossless under interleaving:
    /// each mutation reads the freshest record and touches only its own
    /// fields, so neither can write back a stale copy of the other's. A
    /// column change migrates the membership sets in the same section.
    ///
    /// Returns `None` if the task is absent (e.g. deleted since the caller
    /// last read it).
    pub async fn mutate<F>(&self, id: &TaskId, apply: F) -> Option<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut inner = self.inner.write().await;
        let entry = inner.entries.get_mut(id)?;
        let old_column = entry.task.column;
        apply(&mut entry.task);
        entry.expires_at = Instant::now() + self.ttl;
        let task = entry.task.clone();
        if task.column != old_column {
            if let Some(set) = inner.columns.get_mut(&old_column) {
                set.remove(id);
            }
            inner.columns.entry(task.column).or_default().insert(id.clone());
        }
        Some(task)
    }

    /// Reads a task without hydrating from storage or refreshing the TTL.
    ///
    /// This is the flush worker's view: the newest state the cache knows,
    /// even if the entry is past its TTL.
    pub async fn peek(&self, id: &TaskId) -> Option<Task> {
        let inner = self.inner.read().await;
        inner.entries.get(id).map(|entry| entry.task.clone())
    }

    /// Removes a task record and both index memberships, leaving a
    /// tombstone so the id cannot resurrect from lagging storage before
    /// the durable delete lands.
    pub async fn delete(&self, id: &TaskId) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.index_remove(id);
        inner
            .tombstones
            .insert(id.clone(), Instant::now() + TOMBSTONE_TTL);
        removed
    }

    /// Clears the tombstone for an id whose durable delete has landed.
    pub async fn forget_tombstone(&self, id: &TaskId) {
        let mut inner = self.inner.write().await;
        inner.tombstones.remove(id);
    }

    /// Materializes all live tasks, unsorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if cold-start hydration fails.
    pub async fn list_all(&self) -> Result<Vec<Task>, StoreError> {
        self.ensure_hydrated().await?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let expires_at = now + self.ttl;
        Ok(inner
            .entries
            .values_mut()
            .map(|entry| {
                entry.expires_at = expires_at;
                entry.task.clone()
            })
            .collect())
    }

    /// Returns the tasks of one column, sorted by fractional order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if cold-start hydration fails.
    pub async fn scan_column(&self, column: ColumnId) -> Result<Vec<Task>, StoreError> {
        self.ensure_hydrated().await?;
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .columns
            .get(&column)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.entries.get(id))
                    .map(|entry| entry.task.clone())
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by(|a, b| a.order.partial_cmp(&b.order).unwrap_or(std::cmp::Ordering::Equal));
        Ok(tasks)
    }

    /// Applies rebalanced orders to a column in one pipelined write, so
    /// concurrent readers only ever see the old or the new assignment of
    /// each task, never a torn mixture mid-update.
    pub async fn apply_orders(&self, updates: &[(TaskId, f64)]) {
        let mut inner = self.inner.write().await;
        for (id, order) in updates {
            if let Some(entry) = inner.entries.get_mut(id) {
                entry.task.order = *order;
            }
        }
    }

    /// Loads the full board from storage on first use.
    async fn ensure_hydrated(&self) -> Result<(), StoreError> {
        {
            let inner = self.inner.read().await;
            if inner.hydrated {
                return Ok(());
            }
        }
        let tasks = self.store.fetch_all().await?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        if inner.hydrated {
            return Ok(());
        }
        for task in tasks {
            // Entries written since the fetch started are newer than storage.
            if inner.entries.contains_key(&task.id) || inner.tombstoned(&task.id, now) {
                continue;
            }
            inner.index_put(task, now + self.ttl);
        }
        inner.hydrated = true;
        Ok(())
    }
}
