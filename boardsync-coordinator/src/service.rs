//! Pure task mutation logic, free of any transport coupling.
//!
//! The service reads and writes the authoritative cache, enqueues
//! write-behind jobs, and triggers column rebalances when fractional
//! ordering runs out of precision. Locking is the router's concern: the
//! per-task lock must already be held when [`TaskService::move_task`] runs.
//!
//! Version policy: a client whose `version` lags the server state is *not*
//! rejected; the mutation applies against the latest record. Updates touch
//! `{title, description}` and moves touch `{column, order}`, so a
//! concurrent move+edit converges to the union of both effects with the
//! version advanced once per applied mutation. Mismatches are logged as an
//! observability signal.

use std::sync::Arc;

use boardsync_proto::event::{CreateTask, MoveTask, UpdateTask};
use boardsync_proto::task::{ColumnId, Task, TaskId};

use crate::cache::AuthoritativeCache;
use crate::flush::{FlushJob, FlushQueue};
use crate::now_ms;
use crate::ordering::{self, OrderError};
use crate::storage::StoreError;

/// Snapshot of the mutating participant, stamped onto the task.
#[derive(Debug, Clone)]
pub struct Actor {
    /// Display name of the participant.
    pub name: String,
    /// Presence color of the participant.
    pub color: String,
}

/// Errors from task mutations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The target task does not exist.
    #[error("task not found: {0}")]
    NotFound(TaskId),
    /// The cache could not hydrate from durable storage.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// An ordering key could not be computed.
    #[error(transparent)]
    Order(#[from] OrderError),
}

/// Task mutation service over the authoritative cache.
pub struct TaskService {
    cache: Arc<AuthoritativeCache>,
    flush: FlushQueue,
}

impl TaskService {
    /// Creates a service over the given cache and flush queue.
    #[must_use]
    pub fn new(cache: Arc<AuthoritativeCache>, flush: FlushQueue) -> Self {
        Self { cache, flush }
    }

    /// Creates a task at the bottom of its column with `version = 1`.
    ///
    /// The id is client-chosen; re-creating an existing id is an idempotent
    /// no-op returning the current record, so an offline log replayed twice
    /// converges to the same state.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on storage hydration or ordering failure.
    pub async fn create_task(
        &self,
        payload: CreateTask,
        actor: &Actor,
    ) -> Result<Task, ServiceError> {
        if let Some(existing) = self.cache.get(&payload.id).await? {
            tracing::debug!(task = %payload.id, "create for existing id, returning current state");
            return Ok(existing);
        }

        let column_tasks = self.cache.scan_column(payload.column).await?;
        let max_order = column_tasks.last().map(|task| task.order);
        let order = ordering::between(max_order, None)?;

        let now = now_ms();
        let creator_name = payload.creator_name.unwrap_or_else(|| actor.name.clone());
        let creator_color = payload.creator_color.unwrap_or_else(|| actor.color.clone());
        let task = Task {
            id: payload.id,
            column: payload.column,
            title: payload.title,
            description: payload.description.unwrap_or_default(),
            order,
            version: 1,
            created_at: now,
            updated_at: now,
            creator_name: creator_name.clone(),
            creator_color: creator_color.clone(),
            updated_by_name: creator_name,
            updated_by_color: creator_color,
        };

        self.cache.put(task.clone()).await;
        self.flush.enqueue(FlushJob::Upsert(task.id.clone())).await;
        self.check_density(task.column, &task.id).await?;

        tracing::info!(task = %task.id, column = %task.column, "task created");
        Ok(task)
    }

    /// Applies a title/description edit against the latest server state.
    ///
    /// Position fields are untouched, which is what makes a concurrent move
    /// merge losslessly. An edit that changes nothing is a no-op and does
    /// not advance the version.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if the task is missing.
    pub async fn update_task(
        &self,
        payload: UpdateTask,
        actor: &Actor,
    ) -> Result<Task, ServiceError> {
        let UpdateTask {
            id,
            title,
            description,
            version,
        } = payload;
        let current = self
            .cache
            .get(&id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        note_version_lag("update", &current, version);

        let next_title = title.unwrap_or_else(|| current.title.clone());
        let next_description = description.unwrap_or_else(|| current.description.clone());
        if next_title == current.title && next_description == current.description {
            return Ok(current);
        }

        let now = now_ms();
        let name = actor.name.clone();
        let color = actor.color.clone();
        let task = self
            .cache
            .mutate(&id, move |task| {
                task.title = next_title;
                task.description = next_description;
                task.version += 1;
                task.updated_at = now;
                task.updated_by_name = name;
                task.updated_by_color = color;
            })
            .await
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        self.flush.enqueue(FlushJob::Upsert(id)).await;
        Ok(task)
    }

    /// Applies a column/order move against the latest server state.
    ///
    /// The caller must hold the per-task lock. Title and description are
    /// untouched. A move to the task's current position is a no-op.
    ///
    /// After the write, the moved task's adjacent gaps in the destination
    /// column are inspected; an exhausted gap (including an outright key
    /// collision) enqueues a rebalance for the column.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if the task is missing.
    pub async fn move_task(&self, payload: MoveTask, actor: &Actor) -> Result<Task, ServiceError> {
        let MoveTask {
            id,
            column,
            order,
            version,
        } = payload;
        let current = self
            .cache
            .get(&id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        note_version_lag("move", &current, version);

        if current.column == column && current.order == order {
            return Ok(current);
        }

        let now = now_ms();
        let name = actor.name.clone();
        let color = actor.color.clone();
        let task = self
            .cache
            .mutate(&id, move |task| {
                task.column = column;
                task.order = order;
                task.version += 1;
                task.updated_at = now;
                task.updated_by_name = name;
                task.updated_by_color = color;
            })
            .await
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        self.flush.enqueue(FlushJob::Upsert(id.clone())).await;
        self.check_density(task.column, &id).await?;
        Ok(task)
    }

    /// Removes a task. Deleting a missing id is a success, so the second
    /// of two racing deletes is a clean no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on storage hydration failure.
    pub async fn delete_task(&self, id: &TaskId) -> Result<(), ServiceError> {
        if self.cache.get(id).await?.is_none() {
            return Ok(());
        }
        self.cache.delete(id).await;
        self.flush.enqueue(FlushJob::Delete(id.clone())).await;
        tracing::info!(task = %id, "task deleted");
        Ok(())
    }

    /// Returns all live tasks sorted by `(column, order)`, the shape the
    /// board snapshot consumes.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on storage hydration failure.
    pub async fn all_tasks(&self) -> Result<Vec<Task>, ServiceError> {
        let mut tasks = self.cache.list_all().await?;
        tasks.sort_by(|a, b| {
            a.column.cmp(&b.column).then(
                a.order
                    .partial_cmp(&b.order)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        Ok(tasks)
    }

    /// Enqueues a rebalance when either gap adjacent to `id` in `column`
    /// is too small for further midpoint insertion.
    async fn check_density(&self, column: ColumnId, id: &TaskId) -> Result<(), StoreError> {
        let tasks = self.cache.scan_column(column).await?;
        let Some(position) = tasks.iter().position(|task| &task.id == id) else {
            return Ok(());
        };
        let crowded_before =
            position > 0 && ordering::exhausted(tasks[position - 1].order, tasks[position].order);
        let crowded_after = position + 1 < tasks.len()
            && ordering::exhausted(tasks[position].order, tasks[position + 1].order);
        if crowded_before || crowded_after {
            tracing::info!(column = %column, "ordering gap exhausted, scheduling rebalance");
            self.flush.enqueue(FlushJob::Rebalance(column)).await;
        }
        Ok(())
    }
}

/// Logs a client whose version lags the server record; the mutation still
/// applies under the merge policy, the signal is for observability.
fn note_version_lag(op: &str, current: &Task, client_version: u64) {
    if client_version != current.version {
        tracing::debug!(
            task = %current.id,
            op,
            client_version,
            server_version = current.version,
            "version mismatch tolerated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryTaskStore, TaskStore};
    use std::time::Duration;

    fn make_actor() -> Actor {
        Actor {
            name: "alice".to_string(),
            color: "#e06c75".to_string(),
        }
    }

    fn make_service() -> (Arc<MemoryTaskStore>, FlushQueue, TaskService) {
        let store = Arc::new(MemoryTaskStore::new());
        let cache = Arc::new(AuthoritativeCache::new(store.clone() as Arc<dyn TaskStore>));
        // Long delay keeps jobs pending so tests can observe the queue.
        let queue = FlushQueue::with_delay(
            cache.clone(),
            store.clone() as Arc<dyn TaskStore>,
            Duration::from_secs(30),
        );
        let service = TaskService::new(cache, queue.clone());
        (store, queue, service)
    }

    fn create_payload(title: &str, column: ColumnId) -> CreateTask {
        CreateTask {
            id: TaskId::new(),
            column,
            title: title.to_string(),
            description: None,
            creator_name: None,
            creator_color: None,
        }
    }

    #[tokio::test]
    async fn create_in_empty_column_gets_half() {
        let (_store, _queue, service) = make_service();
        let task = service
            .create_task(create_payload("A", ColumnId::Todo), &make_actor())
            .await
            .unwrap();
        assert_eq!(task.order, 0.5);
        assert_eq!(task.version, 1);
        assert_eq!(task.creator_name, "alice");
        assert_eq!(task.updated_by_name, "alice");
    }

    #[tokio::test]
    async fn create_appends_below_max_order() {
        let (_store, _queue, service) = make_service();
        let first = service
            .create_task(create_payload("A", ColumnId::Todo), &make_actor())
            .await
            .unwrap();
        let second = service
            .create_task(create_payload("B", ColumnId::Todo), &make_actor())
            .await
            .unwrap();
        assert!(second.order > first.order);
    }

    #[tokio::test]
    async fn create_existing_id_is_idempotent() {
        let (_store, _queue, service) = make_service();
        let payload = create_payload("A", ColumnId::Todo);
        let first = service
            .create_task(payload.clone(), &make_actor())
            .await
            .unwrap();

        let mut again = payload;
        again.title = "Different title".to_string();
        let second = service.create_task(again, &make_actor()).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(second.version, 1);
    }

    #[tokio::test]
    async fn update_bumps_version_and_stamps_actor() {
        let (_store, _queue, service) = make_service();
        let task = service
            .create_task(create_payload("A", ColumnId::Todo), &make_actor())
            .await
            .unwrap();

        let bob = Actor {
            name: "bob".to_string(),
            color: "#61afef".to_string(),
        };
        let updated = service
            .update_task(
                UpdateTask {
                    id: task.id.clone(),
                    title: Some("A, revised".to_string()),
                    description: None,
                    version: task.version,
                },
                &bob,
            )
            .await
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.title, "A, revised");
        assert_eq!(updated.updated_by_name, "bob");
        assert_eq!(updated.creator_name, "alice");
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let (_store, _queue, service) = make_service();
        let err = service
            .update_task(
                UpdateTask {
                    id: TaskId::new(),
                    title: Some("x".to_string()),
                    description: None,
                    version: 1,
                },
                &make_actor(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_with_stale_version_still_applies() {
        let (_store, _queue, service) = make_service();
        let task = service
            .create_task(create_payload("A", ColumnId::Todo), &make_actor())
            .await
            .unwrap();

        let updated = service
            .update_task(
                UpdateTask {
                    id: task.id.clone(),
                    title: Some("revised".to_string()),
                    description: None,
                    version: 999,
                },
                &make_actor(),
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "revised");
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn noop_update_does_not_bump_version() {
        let (_store, _queue, service) = make_service();
        let task = service
            .create_task(create_payload("A", ColumnId::Todo), &make_actor())
            .await
            .unwrap();

        let unchanged = service
            .update_task(
                UpdateTask {
                    id: task.id.clone(),
                    title: Some("A".to_string()),
                    description: None,
                    version: task.version,
                },
                &make_actor(),
            )
            .await
            .unwrap();
        assert_eq!(unchanged.version, 1);
    }

    #[tokio::test]
    async fn move_changes_column_and_bumps_version() {
        let (_store, _queue, service) = make_service();
        let task = service
            .create_task(create_payload("A", ColumnId::Todo), &make_actor())
            .await
            .unwrap();

        let moved = service
            .move_task(
                MoveTask {
                    id: task.id.clone(),
                    column: ColumnId::Done,
                    order: 0.5,
                    version: task.version,
                },
                &make_actor(),
            )
            .await
            .unwrap();
        assert_eq!(moved.column, ColumnId::Done);
        assert_eq!(moved.version, 2);

        let all = service.all_tasks().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].column, ColumnId::Done);
    }

    #[tokio::test]
    async fn move_and_update_converge_to_union() {
        let (_store, _queue, service) = make_service();
        let task = service
            .create_task(create_payload("A", ColumnId::Todo), &make_actor())
            .await
            .unwrap();

        // Concurrent move and edit, applied in arrival order: both stick.
        service
            .move_task(
                MoveTask {
                    id: task.id.clone(),
                    column: ColumnId::Done,
                    order: 0.5,
                    version: task.version,
                },
                &make_actor(),
            )
            .await
            .unwrap();
        let merged = service
            .update_task(
                UpdateTask {
                    id: task.id.clone(),
                    title: Some("A, revised".to_string()),
                    description: None,
                    version: task.version, // stale on purpose
                },
                &make_actor(),
            )
            .await
            .unwrap();

        assert_eq!(merged.column, ColumnId::Done);
        assert_eq!(merged.title, "A, revised");
        assert_eq!(merged.version, 3);
    }

    #[tokio::test]
    async fn noop_move_does_not_bump_version() {
        let (_store, _queue, service) = make_service();
        let task = service
            .create_task(create_payload("A", ColumnId::Todo), &make_actor())
            .await
            .unwrap();

        let unchanged = service
            .move_task(
                MoveTask {
                    id: task.id.clone(),
                    column: task.column,
                    order: task.order,
                    version: task.version,
                },
                &make_actor(),
            )
            .await
            .unwrap();
        assert_eq!(unchanged.version, 1);
    }

    #[tokio::test]
    async fn move_missing_task_is_not_found() {
        let (_store, _queue, service) = make_service();
        let err = service
            .move_task(
                MoveTask {
                    id: TaskId::new(),
                    column: ColumnId::Done,
                    order: 0.5,
                    version: 1,
                },
                &make_actor(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn move_into_exhausted_gap_schedules_rebalance() {
        let (_store, queue, service) = make_service();
        let a = service
            .create_task(create_payload("A", ColumnId::Todo), &make_actor())
            .await
            .unwrap();
        let b = service
            .create_task(create_payload("B", ColumnId::Todo), &make_actor())
            .await
            .unwrap();
        service
            .create_task(create_payload("C", ColumnId::Todo), &make_actor())
            .await
            .unwrap();

        // Wedge C directly against A: the A..C gap collapses below 1e-9.
        let pending_before = queue.pending_len().await;
        service
            .move_task(
                MoveTask {
                    id: b.id.clone(),
                    column: ColumnId::Todo,
                    order: a.order + 1e-10,
                    version: b.version,
                },
                &make_actor(),
            )
            .await
            .unwrap();
        assert_eq!(queue.pending_len().await, pending_before + 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_store, _queue, service) = make_service();
        let task = service
            .create_task(create_payload("A", ColumnId::Todo), &make_actor())
            .await
            .unwrap();

        service.delete_task(&task.id).await.unwrap();
        service.delete_task(&task.id).await.unwrap();
        assert!(service.all_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_tasks_sorted_by_column_then_order() {
        let (_store, _queue, service) = make_service();
        service
            .create_task(create_payload("done-1", ColumnId::Done), &make_actor())
            .await
            .unwrap();
        service
            .create_task(create_payload("todo-1", ColumnId::Todo), &make_actor())
            .await
            .unwrap();
        service
            .create_task(create_payload("todo-2", ColumnId::Todo), &make_actor())
            .await
            .unwrap();

        let all = service.all_tasks().await.unwrap();
        let titles: Vec<&str> = all.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["todo-1", "todo-2", "done-1"]);
    }

    #[tokio::test]
    async fn version_strictly_increases_across_mutations() {
        let (_store, _queue, service) = make_service();
        let task = service
            .create_task(create_payload("A", ColumnId::Todo), &make_actor())
            .await
            .unwrap();

        let mut last = task.version;
        for i in 0..5 {
            let updated = service
                .update_task(
                    UpdateTask {
                        id: task.id.clone(),
                        title: Some(format!("rev {i}")),
                        description: None,
                        version: last,
                    },
                    &make_actor(),
                )
                .await
                .unwrap();
            assert!(updated.version > last);
            last = updated.version;
        }
    }
}
