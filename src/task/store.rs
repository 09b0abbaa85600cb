//! Concurrent task store.
//!
//! Implements: REQ-GOV-001/§10
//!
//! Stores `Arc<TaskRecord>` entries for cheap reads; mutation goes through
//! `Arc::make_mut`, which copies only when readers still hold the old
//! version. Admission atomically reserves the task ID (the map insert is the
//! reservation point), and every waiter on a task is woken on any change so
//! escalation parking is a logical wait, never a poll.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::Notify;

use super::error::TaskError;
use super::types::{TaskId, TaskRecord};

#[derive(Debug)]
struct TaskEntry {
    task: Arc<TaskRecord>,
    notify: Arc<Notify>,
}

/// Concurrent store of every task record, live and terminal.
pub struct TaskStore {
    tasks: DashMap<TaskId, TaskEntry>,
    active_count: AtomicUsize,
}

impl fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStore")
            .field("tasks", &self.tasks.len())
            .field("active", &self.active_count.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            active_count: AtomicUsize::new(0),
        }
    }

    /// Inserts a freshly admitted task. The insert is the atomic
    /// check-and-reserve of the task ID.
    pub fn insert(&self, task: TaskRecord) -> Arc<TaskRecord> {
        let task = Arc::new(task);
        let entry = TaskEntry {
            task: task.clone(),
            notify: Arc::new(Notify::new()),
        };
        let previous = self.tasks.insert(task.id.clone(), entry);
        debug_assert!(previous.is_none(), "task id collision");
        self.active_count.fetch_add(1, Ordering::AcqRel);
        task
    }

    /// Gets a task by ID.
    pub fn get(&self, task_id: &TaskId) -> Result<Arc<TaskRecord>, TaskError> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| TaskError::NotFound {
                task_id: task_id.clone(),
            })
    }

    /// Mutates a task under the store's entry lock and wakes waiters.
    ///
    /// The closure sees the record exclusively; the store tracks the
    /// active-count bookkeeping when the mutation lands in a terminal
    /// state. An `Err` from the closure leaves the record untouched.
    pub fn update<F>(&self, task_id: &TaskId, mutate: F) -> Result<Arc<TaskRecord>, TaskError>
    where
        F: FnOnce(&mut TaskRecord) -> Result<(), TaskError>,
    {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound {
                task_id: task_id.clone(),
            })?;

        let was_terminal = entry.task.status.is_terminal();

        // Mutate a copy first so a failed closure can't leave the stored
        // record half-written.
        let mut candidate = (*entry.task).clone();
        mutate(&mut candidate)?;
        entry.task = Arc::new(candidate);

        if !was_terminal && entry.task.status.is_terminal() {
            self.active_count.fetch_sub(1, Ordering::AcqRel);
        }
        entry.notify.notify_waiters();
        Ok(entry.task.clone())
    }

    /// Writes back a task the caller holds exclusive control of.
    ///
    /// The pipeline mutates an owned copy while a stage runs (the stage's
    /// atomic unit) and commits it here when the unit completes; per-task
    /// stage execution is strictly sequential, so the entry cannot have
    /// changed underneath. Waiters are woken on every commit.
    pub fn commit(&self, task: TaskRecord) -> Result<Arc<TaskRecord>, TaskError> {
        let mut entry = self
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| TaskError::NotFound {
                task_id: task.id.clone(),
            })?;
        let was_terminal = entry.task.status.is_terminal();
        entry.task = Arc::new(task);
        if !was_terminal && entry.task.status.is_terminal() {
            self.active_count.fetch_sub(1, Ordering::AcqRel);
        }
        entry.notify.notify_waiters();
        Ok(entry.task.clone())
    }

    /// Waits until a task is terminal or parked (`Escalated`).
    ///
    /// This is the suspension point for callers observing a task: parked
    /// tasks consume no worker and are resumed only by an explicit
    /// resolution call.
    pub async fn wait_until_settled(&self, task_id: &TaskId) -> Result<Arc<TaskRecord>, TaskError> {
        loop {
            let notify = {
                let entry = self
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| TaskError::NotFound {
                        task_id: task_id.clone(),
                    })?;
                // Register interest before re-checking to avoid the lost
                // wakeup between check and await.
                entry.notify.clone()
            };
            let notified = notify.notified();

            {
                let entry = self
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| TaskError::NotFound {
                        task_id: task_id.clone(),
                    })?;
                if entry.task.status.is_terminal() || entry.task.status.is_parked() {
                    return Ok(entry.task.clone());
                }
            }

            notified.await;
        }
    }

    /// Waits until a task is terminal, seeing through escalation parks.
    pub async fn wait_until_terminal(
        &self,
        task_id: &TaskId,
    ) -> Result<Arc<TaskRecord>, TaskError> {
        loop {
            let notify = {
                let entry = self
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| TaskError::NotFound {
                        task_id: task_id.clone(),
                    })?;
                entry.notify.clone()
            };
            let notified = notify.notified();

            {
                let entry = self
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| TaskError::NotFound {
                        task_id: task_id.clone(),
                    })?;
                if entry.task.status.is_terminal() {
                    return Ok(entry.task.clone());
                }
            }

            notified.await;
        }
    }

    /// Number of non-terminal tasks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    /// Total tasks, including terminal ones.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::types::{Budget, ImpactFlags, RiskTier};
    use crate::task::status::TaskStatus;

    fn task() -> TaskRecord {
        TaskRecord::new(
            "goal",
            RiskTier::Low,
            ImpactFlags::default(),
            Budget {
                max_steps: 12,
                max_tool_calls: 5,
            },
            vec![],
        )
    }

    #[test]
    fn failed_update_leaves_record_untouched() {
        let store = TaskStore::new();
        let id = store.insert(task()).id.clone();

        let err = store.update(&id, |t| {
            t.goal = "half-written".into();
            t.transition(TaskStatus::Done, None) // invalid from Pending
        });
        assert!(err.is_err());
        assert_eq!(store.get(&id).unwrap().goal, "goal");
    }

    #[test]
    fn active_count_tracks_terminal_transitions() {
        let store = TaskStore::new();
        let id = store.insert(task()).id.clone();
        assert_eq!(store.active_count(), 1);

        store
            .update(&id, |t| {
                t.transition(TaskStatus::Running, None)?;
                t.transition(TaskStatus::Done, None)
            })
            .unwrap();
        assert_eq!(store.active_count(), 0);
        assert_eq!(store.total_count(), 1);
    }

    #[tokio::test]
    async fn wait_until_settled_wakes_on_escalation() {
        let store = Arc::new(TaskStore::new());
        let id = store.insert(task()).id.clone();

        let waiter = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.wait_until_settled(&id).await })
        };

        store
            .update(&id, |t| {
                t.transition(TaskStatus::Running, None)?;
                t.park("needs human", None, crate::stage::StageKind::Produce)
            })
            .unwrap();

        let settled = waiter.await.unwrap().unwrap();
        assert_eq!(settled.status, TaskStatus::Escalated);
    }
}
