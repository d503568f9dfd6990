//! `BoardSync` coordinator library.
//!
//! The server-side core of a real-time, multi-user kanban board: it
//! serializes conflicting mutations per task, merges orthogonal mutations,
//! keeps a dense per-column ordering under concurrent insertion, broadcasts
//! authoritative state transitions, and reconciles the in-memory board to
//! durable storage through a debounced write-behind queue.
//!
//! Exposed as a library so integration tests and embedders can start the
//! server on an in-memory store with [`server::start_server_with_state`].

pub mod cache;
pub mod config;
pub mod conflict;
pub mod flush;
pub mod lock;
pub mod ordering;
pub mod presence;
pub mod server;
pub mod service;
pub mod storage;

/// Returns the current wall-clock time in milliseconds since epoch.
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}
