//! Append-only audit trail: one entry per governor or stage decision.
//!
//! Implements: REQ-AUD-001 (Audit Trail)
//!
//! The audit log is the sole source of truth for *why* a decision was made.
//! Entries are never edited or deleted. Every component may append; none may
//! rewrite. Appends serialize behind one lock, which gives a global sequence
//! and therefore preserves the per-task causal order the rest of the system
//! relies on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::RuleId;
use crate::stage::StageKind;
use crate::task::TaskId;

// ============================================================================
// Entries
// ============================================================================

/// What kind of decision an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    /// Task admitted by the governor
    Admitted,
    /// Submission rejected before a task record existed
    SubmissionRejected,
    /// Single-source override accepted at submission
    OverrideGranted,
    /// Risk tier assigned
    TierAssigned,
    /// A stage finished its work
    StageCompleted,
    /// A stage surfaced a typed failure
    StageFailed,
    /// Task parked awaiting human disposition
    Escalated,
    /// Human resolution received, task resumed or closed
    EscalationResolved,
    /// Task reached `Done`
    Completed,
    /// Task reached `Rejected`
    Rejected,
    /// Task cancelled by an external authority
    Cancelled,
    /// A budget limit halted the task
    BudgetHalted,
    /// Non-blocking finding recorded for the trail
    Warning,
    /// Promotion proposal drafted from episodic history
    ProposalDrafted,
    /// Proposal approved; rule promoted into the policy store
    ProposalApproved,
    /// Proposal rejected by a human
    ProposalRejected,
    /// Proposal pruned or expired, with reason
    ProposalPruned,
}

impl fmt::Display for AuditDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Admitted => "admitted",
            Self::SubmissionRejected => "submission_rejected",
            Self::OverrideGranted => "override_granted",
            Self::TierAssigned => "tier_assigned",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::Escalated => "escalated",
            Self::EscalationResolved => "escalation_resolved",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::BudgetHalted => "budget_halted",
            Self::Warning => "warning",
            Self::ProposalDrafted => "proposal_drafted",
            Self::ProposalApproved => "proposal_approved",
            Self::ProposalRejected => "proposal_rejected",
            Self::ProposalPruned => "proposal_pruned",
        };
        f.write_str(s)
    }
}

/// One immutable audit entry.
///
/// Implements: REQ-AUD-001/F-001
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Global append sequence (monotonic)
    pub seq: u64,
    /// Task the decision concerns; `None` for promotion-queue decisions
    pub task_id: Option<TaskId>,
    /// Stage that made the decision; `None` for governor decisions
    pub stage: Option<StageKind>,
    /// Decision recorded
    pub decision: AuditDecision,
    /// Human-readable rationale
    pub rationale: String,
    /// Policy rules the decision applied
    pub policy_refs: Vec<RuleId>,
    /// When the entry was appended
    pub timestamp: DateTime<Utc>,
}

/// Time-range/task filter for audit export.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only entries for this task
    pub task_id: Option<TaskId>,
    /// Only entries at or after this instant
    pub from: Option<DateTime<Utc>>,
    /// Only entries strictly before this instant
    pub until: Option<DateTime<Utc>>,
}

/// Errors raised on audit append.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Durable journal append failed; the entry was not recorded.
    #[error(transparent)]
    Journal(#[from] crate::journal::JournalError),
}

// ============================================================================
// Log
// ============================================================================

/// The append-only audit log.
///
/// Implements: REQ-AUD-001
pub struct AuditLog {
    entries: RwLock<Vec<Arc<AuditEntry>>>,
    next_seq: AtomicU64,
    append_lock: Mutex<()>,
    journal: Option<crate::journal::JsonlJournal>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("entries", &self.len())
            .field("journaled", &self.journal.is_some())
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    /// Creates an in-memory audit log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(1),
            append_lock: Mutex::new(()),
            journal: None,
        }
    }

    /// Creates a log that journals to `<dir>/audit.jsonl`.
    pub fn with_journal(dir: &std::path::Path) -> Result<Self, crate::journal::JournalError> {
        let journal = crate::journal::JsonlJournal::open(dir, "audit")?;
        Ok(Self {
            entries: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(1),
            append_lock: Mutex::new(()),
            journal: Some(journal),
        })
    }

    /// Appends one entry. Once acknowledged, the entry is immutable.
    ///
    /// Implements: REQ-AUD-001/F-001, F-002
    pub fn append(
        &self,
        task_id: Option<TaskId>,
        stage: Option<StageKind>,
        decision: AuditDecision,
        rationale: impl Into<String>,
        policy_refs: Vec<RuleId>,
    ) -> Result<Arc<AuditEntry>, AuditError> {
        let _guard = self.append_lock.lock().expect("audit append lock poisoned");

        let entry = Arc::new(AuditEntry {
            seq: self.next_seq.fetch_add(1, Ordering::AcqRel),
            task_id,
            stage,
            decision,
            rationale: rationale.into(),
            policy_refs,
            timestamp: Utc::now(),
        });

        if let Some(journal) = &self.journal {
            journal.append(entry.as_ref())?;
        }

        self.entries
            .write()
            .expect("audit entries lock poisoned")
            .push(entry.clone());

        tracing::info!(
            seq = entry.seq,
            task_id = entry.task_id.as_ref().map(|t| t.as_str()).unwrap_or("-"),
            stage = ?entry.stage,
            decision = %entry.decision,
            rationale = %entry.rationale,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Exports entries matching a filter, in append order.
    ///
    /// Implements: REQ-AUD-001/F-003 (filterable append-only read access)
    #[must_use]
    pub fn export(&self, filter: &AuditFilter) -> Vec<Arc<AuditEntry>> {
        let entries = self.entries.read().expect("audit entries lock poisoned");
        entries
            .iter()
            .filter(|e| match &filter.task_id {
                Some(id) => e.task_id.as_ref() == Some(id),
                None => true,
            })
            .filter(|e| filter.from.is_none_or(|from| e.timestamp >= from))
            .filter(|e| filter.until.is_none_or(|until| e.timestamp < until))
            .cloned()
            .collect()
    }

    /// All entries for one task, in causal order.
    #[must_use]
    pub fn entries_for_task(&self, task_id: &TaskId) -> Vec<Arc<AuditEntry>> {
        self.export(&AuditFilter {
            task_id: Some(task_id.clone()),
            ..AuditFilter::default()
        })
    }

    /// The most recent `limit` entries for one task, oldest first.
    #[must_use]
    pub fn latest_for_task(&self, task_id: &TaskId, limit: usize) -> Vec<Arc<AuditEntry>> {
        let mut entries = self.entries_for_task(task_id);
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        entries
    }

    /// Total entries appended.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("audit entries lock poisoned").len()
    }

    /// True if nothing was ever appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_are_sequenced_and_ordered_per_task() {
        let log = AuditLog::new();
        let task = TaskId::from_raw("task_a");
        let other = TaskId::from_raw("task_b");

        log.append(Some(task.clone()), None, AuditDecision::Admitted, "in", vec![])
            .unwrap();
        log.append(Some(other.clone()), None, AuditDecision::Admitted, "in", vec![])
            .unwrap();
        log.append(
            Some(task.clone()),
            Some(StageKind::Plan),
            AuditDecision::StageCompleted,
            "planned",
            vec![],
        )
        .unwrap();

        let entries = log.entries_for_task(&task);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].seq < entries[1].seq);
        assert_eq!(entries[1].decision, AuditDecision::StageCompleted);
    }

    #[test]
    fn latest_for_task_keeps_the_tail() {
        let log = AuditLog::new();
        let task = TaskId::from_raw("task_a");
        for i in 0..5 {
            log.append(
                Some(task.clone()),
                None,
                AuditDecision::Warning,
                format!("w{i}"),
                vec![],
            )
            .unwrap();
        }
        let tail = log.latest_for_task(&task, 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].rationale, "w3");
        assert_eq!(tail[1].rationale, "w4");
    }

    #[test]
    fn export_filters_by_time_range() {
        let log = AuditLog::new();
        let before = Utc::now();
        log.append(None, None, AuditDecision::ProposalDrafted, "p", vec![])
            .unwrap();
        let all = log.export(&AuditFilter::default());
        assert_eq!(all.len(), 1);

        let none = log.export(&AuditFilter {
            until: Some(before),
            ..AuditFilter::default()
        });
        assert!(none.is_empty());
    }
}
