//! Debounced write-behind from the authoritative cache to durable storage.
//!
//! Every cache mutation enqueues a job keyed by a deterministic id, so a
//! drag burst against one task collapses into a single durable write. A job
//! runs no sooner than [`FLUSH_DELAY`] after its *last* enqueue: re-enqueuing
//! supersedes the pending job. A small worker pool executes non-colliding
//! jobs in parallel; colliding jobs share an id and serialize on a per-slot
//! guard. Failures retry with exponential backoff; after the attempt budget
//! is spent the failure is logged and the cache remains authoritative until
//! the next enqueue reconciles.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};

use boardsync_proto::task::{ColumnId, TaskId};

use crate::cache::AuthoritativeCache;
use crate::ordering;
use crate::storage::{StoreError, TaskStore};

/// Quiet period between the last enqueue of a job id and its execution.
pub const FLUSH_DELAY: Duration = Duration::from_millis(500);

/// Number of flush workers that may run concurrently.
const WORKER_POOL_SIZE: usize = 5;

/// Base backoff duration for retries.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum backoff duration.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Total attempts before a job is abandoned.
const MAX_ATTEMPTS: u32 = 5;

/// Deterministic coalescing key for a flush job.
///
/// Upsert and delete share the task slot, so whichever is enqueued later
/// wins the pending execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobId {
    /// Slot for upsert/delete of one task.
    Task(TaskId),
    /// Slot for re-densifying one column.
    Rebalance(ColumnId),
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(id) => write!(f, "task_{id}"),
            Self::Rebalance(column) => write!(f, "rebalance_{column}"),
        }
    }
}

/// A unit of write-behind work.
#[derive(Debug, Clone)]
pub enum FlushJob {
    /// Write the task's *current* cache state to storage.
    Upsert(TaskId),
    /// Remove the task from storage.
    Delete(TaskId),
    /// Reassign dense orders to a whole column.
    Rebalance(ColumnId),
}

impl FlushJob {
    /// The coalescing slot this job occupies.
    #[must_use]
    pub fn id(&self) -> JobId {
        match self {
            Self::Upsert(id) | Self::Delete(id) => JobId::Task(id.clone()),
            Self::Rebalance(column) => JobId::Rebalance(*column),
        }
    }
}

struct PendingJob {
    job: FlushJob,
    seq: u64,
}

struct FlushInner {
    pending: Mutex<HashMap<JobId, PendingJob>>,
    slots: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
    workers: Semaphore,
    seq: AtomicU64,
    delay: Duration,
    cache: Arc<AuthoritativeCache>,
    store: Arc<dyn TaskStore>,
}

/// Handle to the write-behind queue. Cheap to clone.
#[derive(Clone)]
pub struct FlushQueue {
    inner: Arc<FlushInner>,
}

impl FlushQueue {
    /// Creates a queue with the production [`FLUSH_DELAY`].
    #[must_use]
    pub fn new(cache: Arc<AuthoritativeCache>, store: Arc<dyn TaskStore>) -> Self {
        Self::with_delay(cache, store, FLUSH_DELAY)
    }

    /// Creates a queue with a custom debounce delay (used by tests).
    #[must_use]
    pub fn with_delay(
        cache: Arc<AuthoritativeCache>,
        store: Arc<dyn TaskStore>,
        delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(FlushInner {
                pending: Mutex::new(HashMap::new()),
                slots: Mutex::new(HashMap::new()),
                workers: Semaphore::new(WORKER_POOL_SIZE),
                seq: AtomicU64::new(0),
                delay,
                cache,
                store,
            }),
        }
    }

    /// Enqueues a job, superseding any pending job with the same id.
    pub async fn enqueue(&self, job: FlushJob) {
        let id = job.id();
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id.clone(), PendingJob { job, seq });
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.delay).await;
            let job = {
                let mut pending = inner.pending.lock().await;
                // Only the timer belonging to the *last* enqueue fires; any
                // earlier timer finds a newer seq and stands down.
                match pending.get(&id) {
                    Some(p) if p.seq == seq => pending.remove(&id).map(|p| p.job),
                    _ => None,
                }
            };
            if let Some(job) = job {
                run_with_retry(&inner, &id, &job).await;
            }
        });
    }

    /// Number of jobs currently waiting out their debounce window.
    pub async fn pending_len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

async fn run_with_retry(inner: &Arc<FlushInner>, id: &JobId, job: &FlushJob) {
    let Ok(_permit) = inner.workers.acquire().await else {
        return;
    };
    let slot = {
        let mut slots = inner.slots.lock().await;
        Arc::clone(slots.entry(id.clone()).or_default())
    };
    let guard = slot.lock().await;

    let mut attempt: u32 = 0;
    loop {
        match execute(inner, job).await {
            Ok(()) => {
                tracing::debug!(job = %id, "flush job completed");
                break;
            }
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    tracing::error!(
                        job = %id,
                        error = %e,
                        "flush job abandoned after {MAX_ATTEMPTS} attempts; cache remains authoritative"
                    );
                    break;
                }
                tracing::warn!(job = %id, error = %e, attempt, "flush job failed, retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }
    }

    drop(guard);
    let mut slots = inner.slots.lock().await;
    // Strong count 2 = the map plus our clone: nobody is waiting on the slot.
    if let Some(s) = slots.get(id)
        && Arc::strong_count(s) == 2
    {
        slots.remove(id);
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(BACKOFF_MAX)
}

async fn execute(inner: &FlushInner, job: &FlushJob) -> Result<(), StoreError> {
    match job {
        FlushJob::Upsert(id) => {
            // The current cache state, not the enqueue-time snapshot.
            match inner.cache.peek(id).await {
                Some(task) => inner.store.upsert(&task).await,
                // Deleted since enqueue; the shared slot's delete won.
                None => Ok(()),
            }
        }
        FlushJob::Delete(id) => {
            inner.store.delete(id).await?;
            inner.cache.forget_tombstone(id).await;
            Ok(())
        }
        FlushJob::Rebalance(column) => {
            let mut tasks = inner.cache.scan_column(*column).await?;
            if tasks.is_empty() {
                return Ok(());
            }
            let keys = ordering::rebalanced(tasks.len());
            for (task, key) in tasks.iter_mut().zip(&keys) {
                task.order = *key;
            }
            inner.store.upsert_many(&tasks).await?;
            let assignments: Vec<(TaskId, f64)> = tasks
                .iter()
                .map(|task| (task.id.clone(), task.order))
                .collect();
            inner.cache.apply_orders(&assignments).await;
            Ok(())
        }
    }
}
