//! Per-task advisory locks for serializing position conflicts.
//!
//! Only `TASK_MOVE` takes a lock: two concurrent moves touch the same field
//! set, so exactly one may win. The TTL bounds recovery when a holder dies
//! between acquire and release, and release is owner-verified so a late
//! release can never erase a successor's lock after expiry.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use boardsync_proto::task::TaskId;

/// Default lock TTL. Long enough for a move plus its broadcast, short
/// enough that a crashed holder stalls the task only briefly.
pub const LOCK_TTL: Duration = Duration::from_secs(2);

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// The caller now holds the lock.
    Acquired,
    /// Another owner holds the lock; carries that owner's id so the
    /// conflict path can name the winner.
    Held {
        /// Connection id of the current holder.
        owner: String,
    },
}

struct LockEntry {
    owner: String,
    expires_at: Instant,
}

/// Advisory per-task mutex table with TTL expiry.
///
/// `owner` is a process-unique identifier (the connection id); user
/// identity is irrelevant to the compare-and-delete release.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<TaskId, LockEntry>>,
}

impl LockManager {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set-if-absent acquire. An expired entry counts as absent; a live
    /// entry owned by the caller is refreshed rather than rejected.
    pub async fn acquire(&self, task_id: &TaskId, owner: &str, ttl: Duration) -> Acquire {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(task_id)
            && entry.expires_at > now
            && entry.owner != owner
        {
            return Acquire::Held {
                owner: entry.owner.clone(),
            };
        }
        locks.insert(
            task_id.clone(),
            LockEntry {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Acquire::Acquired
    }

    /// Atomic compare-and-delete release.
    ///
    /// Removes the lock only if `owner` still holds it; returns whether a
    /// release happened. A holder whose TTL has lapsed no longer owns the
    /// slot, so its late release leaves any successor untouched.
    pub async fn release(&self, task_id: &TaskId, owner: &str) -> bool {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        match locks.get(task_id) {
            Some(entry) if entry.owner == owner && entry.expires_at > now => {
                locks.remove(task_id);
                true
            }
            _ => false,
        }
    }

    /// Number of live (unexpired) locks, for observability.
    pub async fn live_count(&self) -> usize {
        let now = Instant::now();
        let locks = self.locks.lock().await;
        locks.values().filter(|e| e.expires_at > now).count()
    }
}
