//! Presence types for live board participants.

use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Maximum allowed participant display name length in characters.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 64;

/// What a participant is currently doing on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Participant has a task open for editing.
    Editing,
    /// Participant is connected but not focused on a task.
    Idle,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Editing => write!(f, "editing"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// A live participant as tracked by the coordinator's presence registry.
///
/// `user_id` is the connection identifier assigned by the server on
/// connect. There is no account identity behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    /// Server-assigned connection identifier.
    pub user_id: String,
    /// Name the participant introduced themselves with.
    pub display_name: String,
    /// Palette color assigned on connect.
    pub color: String,
    /// Milliseconds since epoch when the connection registered.
    pub connected_at: u64,
    /// The task this participant is editing, if any.
    pub editing_task_id: Option<TaskId>,
}
