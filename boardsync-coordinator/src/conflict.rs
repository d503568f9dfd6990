//! Conflict classification and loser notification for concurrent mutations.
//!
//! Three concurrent-operation classes exist on the board:
//!
//! 1. **Move + edit**: disjoint field sets (`column`/`order` vs
//!    `title`/`description`); both mutations apply in either order and the
//!    converged record carries both effects. Nobody is notified.
//! 2. **Move + move**: the same field set; serialized by the per-task
//!    lock. The acquire loser gets a [`CONFLICT_NOTIFY`] carrying the
//!    authoritative state, and an audit row is written fire-and-forget.
//! 3. **Insert + insert**: new tasks with new ids; resolved structurally
//!    by fractional ordering, with a lazy rebalance on key collision.
//!
//! [`CONFLICT_NOTIFY`]: boardsync_proto::event::ServerEvent::ConflictNotify

use serde::Serialize;

use boardsync_proto::event::ClientEvent;
use boardsync_proto::task::{Task, TaskId};

/// The mutation kind of a board operation, for conflict classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// `TASK_CREATE`
    Create,
    /// `TASK_UPDATE`
    Update,
    /// `TASK_MOVE`
    Move,
    /// `TASK_DELETE`
    Delete,
}

impl OpKind {
    /// Returns the mutation kind of a client event, or `None` for events
    /// that do not mutate tasks.
    #[must_use]
    pub const fn of(event: &ClientEvent) -> Option<Self> {
        match event {
            ClientEvent::TaskCreate(_) => Some(Self::Create),
            ClientEvent::TaskUpdate(_) => Some(Self::Update),
            ClientEvent::TaskMove(_) => Some(Self::Move),
            ClientEvent::TaskDelete(_) => Some(Self::Delete),
            ClientEvent::Hello(_) | ClientEvent::ReplayOps(_) | ClientEvent::PresenceUpdate(_) => {
                None
            }
        }
    }
}

/// How a pair of concurrent operations on the same board resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictClass {
    /// Disjoint field sets; both mutations apply, no notification.
    FieldMerge,
    /// Same field set; the per-task lock picks a winner, the loser is
    /// notified with the authoritative state.
    LockSerialized,
    /// Distinct new ids; fractional ordering resolves placement, an order
    /// collision triggers a lazy rebalance.
    Structural,
    /// Same field, arrival order wins silently; logged for observability.
    LastWriterWins,
}

/// Classifies a pair of concurrent operations targeting the same task
/// (or, for two creates, the same column gap).
#[must_use]
pub const fn classify(a: OpKind, b: OpKind) -> ConflictClass {
    match (a, b) {
        (OpKind::Move, OpKind::Move) => ConflictClass::LockSerialized,
        (OpKind::Move, OpKind::Update) | (OpKind::Update, OpKind::Move) => {
            ConflictClass::FieldMerge
        }
        (OpKind::Create, OpKind::Create) => ConflictClass::Structural,
        _ => ConflictClass::LastWriterWins,
    }
}

/// Append-only audit record for a lock-serialized conflict.
///
/// Written to durable storage off the critical path; a failed write is
/// logged and never surfaces to either client.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictAudit {
    /// The contested task.
    pub task_id: TaskId,
    /// Wire name of the winning event.
    pub winner_event: String,
    /// Wire name of the losing event.
    pub loser_event: String,
    /// Connection id of the lock holder.
    pub winner_user_id: String,
    /// Connection id of the notified loser.
    pub loser_user_id: String,
    /// Authoritative task state after resolution.
    pub resolved_state: Task,
    /// The human message delivered to the loser.
    pub message: String,
    /// Milliseconds since epoch when the conflict resolved.
    pub at: u64,
}

/// Builds the human message shown to a move-conflict loser.
#[must_use]
pub fn lock_loss_message(task: &Task, winner_name: &str) -> String {
    format!(
        "\"{}\" was just moved by {}; your move was not applied",
        task.title, winner_name
    )
}

/// Builds the audit record for a lost move conflict.
#[must_use]
pub fn lock_loss_audit(
    resolved: &Task,
    winner_user_id: &str,
    loser_user_id: &str,
    message: String,
    at: u64,
) -> ConflictAudit {
    ConflictAudit {
        task_id: resolved.id.clone(),
        winner_event: "TASK_MOVE".to_string(),
        loser_event: "TASK_MOVE".to_string(),
        winner_user_id: winner_user_id.to_string(),
        loser_user_id: loser_user_id.to_string(),
        resolved_state: resolved.clone(),
        message,
        at,
    }
}
