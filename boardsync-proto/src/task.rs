//! Task domain types for `BoardSync`.
//!
//! Defines the [`Task`] record that the coordinator treats as the sole
//! mutable board entity, plus the [`ColumnId`] enumeration and the
//! [`TaskId`] identifier. Tasks are postcard-encoded inside board events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed task title length in characters.
pub const MAX_TITLE_LENGTH: usize = 500;

/// Maximum allowed task description length in characters.
pub const MAX_DESCRIPTION_LENGTH: usize = 5000;

/// Unique identifier for a task.
///
/// Task ids are chosen by the creating client (so optimistic UI state stays
/// stable across the round-trip) and are never rewritten by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new time-ordered task identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `TaskId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One of the three fixed board columns.
///
/// The declaration order is the board's left-to-right display order and is
/// used as the primary sort key for full-board listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnId {
    /// Work not yet started.
    Todo,
    /// Work actively underway.
    InProgress,
    /// Finished work.
    Done,
}

impl ColumnId {
    /// All columns in board order.
    pub const ALL: [Self; 3] = [Self::Todo, Self::InProgress, Self::Done];

    /// Returns the canonical wire name of the column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in-progress",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for ColumnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ColumnId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "in-progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown column: {other}")),
        }
    }
}

/// A board task as held by the authoritative cache and broadcast to clients.
///
/// `order` is a fractional index: a finite real number whose only meaning is
/// its sort position relative to siblings in the same column. `version`
/// increases strictly with every effective mutation so subscribers can
/// discard stale broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Client-chosen unique identifier.
    pub id: TaskId,
    /// Column this task currently lives in.
    pub column: ColumnId,
    /// Short summary line, 1..=500 characters.
    pub title: String,
    /// Free-form body text, up to 5000 characters.
    pub description: String,
    /// Fractional sort key within `column`.
    pub order: f64,
    /// Mutation counter, starts at 1.
    pub version: u64,
    /// Milliseconds since epoch at creation.
    pub created_at: u64,
    /// Milliseconds since epoch of the last mutation.
    pub updated_at: u64,
    /// Display name of the creator, frozen at create time.
    pub creator_name: String,
    /// Presence color of the creator, frozen at create time.
    pub creator_color: String,
    /// Display name of the most recent mutator.
    pub updated_by_name: String,
    /// Presence color of the most recent mutator.
    pub updated_by_color: String,
}
