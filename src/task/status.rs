//! Task lifecycle status and transition matrix.
//!
//! Implements: REQ-GOV-001/F-001
//!
//! State machine, keyed by risk tier at routing time:
//! - Pending → Running (admission complete, pipeline started)
//! - Pending → Rejected (cancelled before start)
//! - Running → Done (LOW tier auto-completes)
//! - Running → Review (MEDIUM/HIGH output awaiting verdicts)
//! - Running → Escalated (human gate, policy conflict, compliance hold)
//! - Running → Rejected (budget halt, cancellation, compliance reject)
//! - Review → Running (Reconcile sent the task back to Produce)
//! - Review → Done | Rejected | Escalated
//! - Escalated → Running | Done | Rejected (human resolution ONLY)
//!
//! `Escalated` is terminal to every automated actor: the ordinary
//! transition path refuses to leave it, and only the explicit human
//! resolution path on [`super::types::TaskRecord`] may.

use serde::{Deserialize, Serialize};

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Admitted, pipeline not yet started
    Pending,
    /// A stage currently holds control
    Running,
    /// Output produced, Review/Reconcile verdicts pending
    Review,
    /// Parked awaiting human disposition
    Escalated,
    /// Completed with an accepted output
    Done,
    /// Terminated with a recorded refusal, failure, or cancellation
    Rejected,
}

impl TaskStatus {
    /// True if the task lifecycle has ended.
    ///
    /// `Escalated` is deliberately NOT terminal here: the record stays
    /// mutable for the human resolution path, while [`Self::is_parked`]
    /// keeps every automated path out.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Rejected)
    }

    /// True if the task is suspended awaiting external human input.
    #[must_use]
    pub fn is_parked(&self) -> bool {
        matches!(self, Self::Escalated)
    }

    /// Checks whether an *automated* transition from this status to
    /// another is valid. Human-resolution transitions out of `Escalated`
    /// go through [`super::types::TaskRecord::resolve_escalation`] and are
    /// intentionally absent from this matrix.
    #[must_use]
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Rejected)
                | (TaskStatus::Running, TaskStatus::Review)
                | (TaskStatus::Running, TaskStatus::Escalated)
                | (TaskStatus::Running, TaskStatus::Done)
                | (TaskStatus::Running, TaskStatus::Rejected)
                | (TaskStatus::Review, TaskStatus::Running)
                | (TaskStatus::Review, TaskStatus::Escalated)
                | (TaskStatus::Review, TaskStatus::Done)
                | (TaskStatus::Review, TaskStatus::Rejected)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Review => write!(f, "REVIEW"),
            Self::Escalated => write!(f, "ESCALATED"),
            Self::Done => write!(f, "DONE"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_done_and_rejected() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Rejected.is_terminal());
        assert!(!TaskStatus::Escalated.is_terminal());
        assert!(TaskStatus::Escalated.is_parked());
    }

    #[test]
    fn no_automated_exit_from_escalated() {
        for to in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Review,
            TaskStatus::Done,
            TaskStatus::Rejected,
        ] {
            assert!(!TaskStatus::Escalated.can_transition_to(to));
        }
    }

    #[test]
    fn review_can_loop_back_to_running() {
        assert!(TaskStatus::Review.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::Running));
    }
}
