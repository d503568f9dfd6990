//! Board event protocol: client-to-server and server-to-client messages.
//!
//! Every mutation reaches the coordinator as a [`ClientEvent`] and every
//! state transition leaves it as a [`ServerEvent`]. Payload validation lives
//! here so the router's handlers can validate before touching any state, and
//! so offline replay batches are checked with exactly the same rules as live
//! traffic.

use serde::{Deserialize, Serialize};

use crate::presence::{MAX_DISPLAY_NAME_LENGTH, PresenceStatus, UserPresence};
use crate::task::{ColumnId, MAX_DESCRIPTION_LENGTH, MAX_TITLE_LENGTH, Task, TaskId};

/// Maximum number of operations accepted in a single replay batch.
pub const MAX_REPLAY_OPS: usize = 500;

/// A payload violated the protocol's validation rules.
///
/// Validation errors are terminal: the offending event is answered privately
/// with [`ErrorCode::ValidationError`] and never reaches the board state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Task title is empty.
    #[error("title must not be empty")]
    TitleEmpty,
    /// Task title exceeds [`MAX_TITLE_LENGTH`].
    #[error("title too long (max {MAX_TITLE_LENGTH} characters)")]
    TitleTooLong,
    /// Task description exceeds [`MAX_DESCRIPTION_LENGTH`].
    #[error("description too long (max {MAX_DESCRIPTION_LENGTH} characters)")]
    DescriptionTooLong,
    /// An update carried neither a title nor a description.
    #[error("update must change at least one of title, description")]
    EmptyUpdate,
    /// Order value is NaN or infinite.
    #[error("order must be a finite number")]
    OrderNotFinite,
    /// Version must be a positive integer.
    #[error("version must be positive")]
    VersionZero,
    /// Client timestamp must be a positive integer.
    #[error("client timestamp must be positive")]
    TimestampZero,
    /// Replay batch was empty.
    #[error("replay batch must contain at least one operation")]
    ReplayEmpty,
    /// Replay batch exceeded [`MAX_REPLAY_OPS`].
    #[error("replay batch too large (max {MAX_REPLAY_OPS} operations)")]
    ReplayTooLarge,
    /// A replay batch contained a nested replay or a connection handshake.
    #[error("operation cannot appear inside a replay batch")]
    UnreplayableOp,
    /// Display name is empty.
    #[error("display name must not be empty")]
    DisplayNameEmpty,
    /// Display name exceeds [`MAX_DISPLAY_NAME_LENGTH`].
    #[error("display name too long (max {MAX_DISPLAY_NAME_LENGTH} characters)")]
    DisplayNameTooLong,
}

fn check_title(title: &str) -> Result<(), ValidationError> {
    if title.is_empty() {
        return Err(ValidationError::TitleEmpty);
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(ValidationError::TitleTooLong);
    }
    Ok(())
}

fn check_description(description: &str) -> Result<(), ValidationError> {
    if description.chars().count() > MAX_DESCRIPTION_LENGTH {
        return Err(ValidationError::DescriptionTooLong);
    }
    Ok(())
}

/// Connection handshake, sent once as the first frame after upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Name the participant wants to appear under.
    pub display_name: String,
}

impl Hello {
    /// Validates the handshake payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.display_name.is_empty() {
            return Err(ValidationError::DisplayNameEmpty);
        }
        if self.display_name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
            return Err(ValidationError::DisplayNameTooLong);
        }
        Ok(())
    }
}

/// Payload of `TASK_CREATE`.
///
/// The id is chosen by the client; the server never rewrites it. The creator
/// snapshot fields are optional; when absent, the coordinator fills them
/// from the sender's presence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTask {
    /// Client-generated task id.
    pub id: TaskId,
    /// Column to create the task in.
    pub column: ColumnId,
    /// Task title.
    pub title: String,
    /// Optional initial description (defaults to empty).
    pub description: Option<String>,
    /// Optional creator name override.
    pub creator_name: Option<String>,
    /// Optional creator color override.
    pub creator_color: Option<String>,
}

impl CreateTask {
    /// Validates the create payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_title(&self.title)?;
        if let Some(description) = &self.description {
            check_description(description)?;
        }
        Ok(())
    }
}

/// Payload of `TASK_UPDATE`. Touches only title and description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTask {
    /// Target task id.
    pub id: TaskId,
    /// New title, if changing.
    pub title: Option<String>,
    /// New description, if changing.
    pub description: Option<String>,
    /// The version the client last observed.
    pub version: u64,
}

impl UpdateTask {
    /// Validates the update payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.is_none() && self.description.is_none() {
            return Err(ValidationError::EmptyUpdate);
        }
        if let Some(title) = &self.title {
            check_title(title)?;
        }
        if let Some(description) = &self.description {
            check_description(description)?;
        }
        if self.version == 0 {
            return Err(ValidationError::VersionZero);
        }
        Ok(())
    }
}

/// Payload of `TASK_MOVE`. Touches only column and order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveTask {
    /// Target task id.
    pub id: TaskId,
    /// Destination column.
    pub column: ColumnId,
    /// Destination fractional order within the column.
    pub order: f64,
    /// The version the client last observed.
    pub version: u64,
}

impl MoveTask {
    /// Validates the move payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.order.is_finite() {
            return Err(ValidationError::OrderNotFinite);
        }
        if self.version == 0 {
            return Err(ValidationError::VersionZero);
        }
        Ok(())
    }
}

/// Payload of `TASK_DELETE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTask {
    /// Target task id.
    pub id: TaskId,
}

/// Payload of `PRESENCE_UPDATE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// New activity status.
    pub status: PresenceStatus,
    /// The task in focus when `status` is `Editing`.
    pub task_id: Option<TaskId>,
}

/// One operation buffered by a client while offline.
///
/// Replay batches are sorted by `client_timestamp` and dispatched through
/// the same handler chain as live events, so conflict resolution applies
/// identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOp {
    /// The buffered operation.
    pub op: ClientEvent,
    /// Milliseconds since epoch when the client performed the operation.
    pub client_timestamp: u64,
}

impl QueuedOp {
    /// Validates the replay envelope (not the inner payload, which is
    /// checked by the normal handler chain at dispatch time).
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.client_timestamp == 0 {
            return Err(ValidationError::TimestampZero);
        }
        match self.op {
            ClientEvent::Hello(_) | ClientEvent::ReplayOps(_) => {
                Err(ValidationError::UnreplayableOp)
            }
            _ => Ok(()),
        }
    }
}

/// Events a client may send to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    /// Connection handshake; must be the first frame.
    Hello(Hello),
    /// Create a task.
    TaskCreate(CreateTask),
    /// Edit a task's title or description.
    TaskUpdate(UpdateTask),
    /// Move a task to a new column or position.
    TaskMove(MoveTask),
    /// Delete a task.
    TaskDelete(DeleteTask),
    /// Replay an offline operation log, 1..=500 entries.
    ReplayOps(Vec<QueuedOp>),
    /// Update the sender's activity status.
    PresenceUpdate(PresenceUpdate),
}

impl ClientEvent {
    /// Wire name of the event, as surfaced in logs and audit rows.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "HELLO",
            Self::TaskCreate(_) => "TASK_CREATE",
            Self::TaskUpdate(_) => "TASK_UPDATE",
            Self::TaskMove(_) => "TASK_MOVE",
            Self::TaskDelete(_) => "TASK_DELETE",
            Self::ReplayOps(_) => "REPLAY_OPS",
            Self::PresenceUpdate(_) => "PRESENCE_UPDATE",
        }
    }

    /// Validates the event payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Hello(payload) => payload.validate(),
            Self::TaskCreate(payload) => payload.validate(),
            Self::TaskUpdate(payload) => payload.validate(),
            Self::TaskMove(payload) => payload.validate(),
            Self::TaskDelete(_) | Self::PresenceUpdate(_) => Ok(()),
            Self::ReplayOps(ops) => {
                if ops.is_empty() {
                    return Err(ValidationError::ReplayEmpty);
                }
                if ops.len() > MAX_REPLAY_OPS {
                    return Err(ValidationError::ReplayTooLarge);
                }
                for op in ops {
                    op.validate()?;
                }
                Ok(())
            }
        }
    }
}

/// Machine-readable error codes surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Payload violated the protocol schema.
    ValidationError,
    /// Target task was missing at mutation time.
    NotFound,
    /// Reserved: the current merge policy tolerates mismatches.
    VersionMismatch,
    /// Unexpected failure while creating a task.
    CreateFailed,
    /// Unexpected failure while updating a task.
    UpdateFailed,
    /// Unexpected failure while moving a task.
    MoveFailed,
    /// Unexpected failure while deleting a task.
    DeleteFailed,
    /// Initial board snapshot could not be assembled.
    ConnectFailed,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::CreateFailed => "CREATE_FAILED",
            Self::UpdateFailed => "UPDATE_FAILED",
            Self::MoveFailed => "MOVE_FAILED",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::ConnectFailed => "CONNECT_FAILED",
        };
        f.write_str(name)
    }
}

/// Events the coordinator sends to clients.
///
/// `BoardSnapshot`, `ConflictNotify`, and `Error` are private to one
/// connection; the rest are broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    /// Full board state, sent privately on connect.
    BoardSnapshot {
        /// All live tasks sorted by column, then order.
        tasks: Vec<Task>,
        /// All active participants.
        presence: Vec<UserPresence>,
    },
    /// A task was created.
    TaskCreated(Task),
    /// A task's title or description changed.
    TaskUpdated(Task),
    /// A task moved to a new column or position.
    TaskMoved(Task),
    /// A task was deleted.
    TaskDeleted {
        /// Id of the removed task.
        id: TaskId,
    },
    /// The sender lost a position conflict; carries the authoritative state
    /// the client should revert its optimistic replica to.
    ConflictNotify {
        /// The contested task.
        task_id: TaskId,
        /// Authoritative post-resolution state.
        resolved_state: Task,
        /// Human-readable explanation for display.
        message: String,
    },
    /// Current participant list, broadcast on every presence change.
    PresenceState(Vec<UserPresence>),
    /// Request-scoped failure, private to the caller.
    Error {
        /// Machine-readable error code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}
