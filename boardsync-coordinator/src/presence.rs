//! Live participant registry with color assignment and stale reclamation.
//!
//! A participant registers on connect and is removed on clean disconnect;
//! the TTL reclaims entries whose connection vanished without teardown.
//! Colors come from a fixed six-color palette, assigned least-used-first so
//! a small group never shares a color.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use boardsync_proto::presence::{PresenceStatus, UserPresence};
use boardsync_proto::task::TaskId;

use crate::now_ms;

/// Sliding presence TTL; refreshed on any activity.
pub const PRESENCE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// The participant color palette.
pub const PALETTE: [&str; 6] = [
    "#e06c75", "#61afef", "#98c379", "#e5c07b", "#c678dd", "#56b6c2",
];

struct PresenceEntry {
    presence: UserPresence,
    expires_at: Instant,
}

/// Registry of live board participants.
pub struct PresenceRegistry {
    inner: RwLock<HashMap<String, PresenceEntry>>,
    ttl: Duration,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRegistry {
    /// Creates an empty registry with the default [`PRESENCE_TTL`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(PRESENCE_TTL)
    }

    /// Creates a registry with a custom TTL (used by reclamation tests).
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Registers a participant, assigning the least-used palette color
    /// across currently active participants.
    pub async fn register(&self, user_id: &str, display_name: &str) -> UserPresence {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        let mut usage: HashMap<&str, usize> = PALETTE.iter().map(|c| (*c, 0)).collect();
        for entry in inner.values() {
            if entry.expires_at > now
                && let Some(count) = usage.get_mut(entry.presence.color.as_str())
            {
                *count += 1;
            }
        }
        let color = PALETTE
            .iter()
            .min_by_key(|c| usage.get(**c).copied().unwrap_or(0))
            .copied()
            .unwrap_or(PALETTE[0]);

        let presence = UserPresence {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            color: color.to_string(),
            connected_at: now_ms(),
            editing_task_id: None,
        };
        inner.insert(
            user_id.to_string(),
            PresenceEntry {
                presence: presence.clone(),
                expires_at: now + self.ttl,
            },
        );
        presence
    }

    /// Refreshes a participant's TTL, returning whether the entry exists.
    pub async fn touch(&self, user_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(user_id) {
            Some(entry) => {
                entry.expires_at = Instant::now() + self.ttl;
                true
            }
            None => false,
        }
    }

    /// Updates a participant's editing focus and refreshes the TTL.
    ///
    /// Returns the updated presence, or `None` for an unknown participant.
    pub async fn set_focus(
        &self,
        user_id: &str,
        status: PresenceStatus,
        task_id: Option<TaskId>,
    ) -> Option<UserPresence> {
        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(user_id)?;
        entry.expires_at = Instant::now() + self.ttl;
        entry.presence.editing_task_id = match status {
            PresenceStatus::Editing => task_id,
            PresenceStatus::Idle => None,
        };
        Some(entry.presence.clone())
    }

    /// Looks up a participant without refreshing the TTL.
    pub async fn get(&self, user_id: &str) -> Option<UserPresence> {
        let inner = self.inner.read().await;
        inner.get(user_id).map(|entry| entry.presence.clone())
    }

    /// Removes a participant on clean disconnect.
    pub async fn remove(&self, user_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.remove(user_id).is_some()
    }

    /// Returns all active participants, pruning expired entries as a side
    /// effect so a vanished connection heals out of the set.
    pub async fn list_active(&self) -> Vec<UserPresence> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.retain(|_, entry| entry.expires_at > now);
        let mut active: Vec<UserPresence> =
            inner.values().map(|entry| entry.presence.clone()).collect();
        active.sort_by_key(|presence| presence.connected_at);
        active
    }
}
