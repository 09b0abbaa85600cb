//! Task operation errors.

use thiserror::Error;

use super::status::TaskStatus;
use super::types::TaskId;

/// Errors that can occur during task record operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Task with the given ID was not found.
    #[error("task '{task_id}' not found")]
    NotFound {
        /// The missing ID
        task_id: TaskId,
    },

    /// Task is already in a terminal state; terminal records are immutable.
    #[error("task '{task_id}' is already terminal ({status})")]
    AlreadyTerminal {
        /// The task
        task_id: TaskId,
        /// Its terminal status
        status: TaskStatus,
    },

    /// Invalid automated state transition.
    #[error("invalid transition for task '{task_id}': {from} -> {to}")]
    InvalidTransition {
        /// The task
        task_id: TaskId,
        /// Current status
        from: TaskStatus,
        /// Attempted status
        to: TaskStatus,
    },

    /// An automated actor tried to move a task parked in `ESCALATED`.
    /// Only the human resolution path may.
    #[error("task '{task_id}' is escalated and awaits human disposition")]
    ParkedAwaitingHuman {
        /// The parked task
        task_id: TaskId,
    },

    /// Escalation resolution was requested for a task that is not parked.
    #[error("task '{task_id}' is not escalated (status {status})")]
    NotEscalated {
        /// The task
        task_id: TaskId,
        /// Its actual status
        status: TaskStatus,
    },
}
