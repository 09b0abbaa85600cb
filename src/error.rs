//! Governance error taxonomy.
//!
//! Implements: REQ-GOV-001/§7 (Error Handling)
//!
//! No error kind is ever swallowed: every variant either terminates a task
//! cleanly (with the rationale recorded in the audit trail) or escalates it
//! for human disposition. A refusal is a fully valid output of the system.

use thiserror::Error;

use crate::config::ConfigError;
use crate::policy::{PolicyError, RuleId};
use crate::promotion::{PromotionError, ProposalId};
use crate::provenance::{ProvenanceError, RecordId};
use crate::stage::{Capability, StageKind};
use crate::task::{BudgetResource, TaskError, TaskId};

/// Top-level error taxonomy for the governance core.
#[derive(Debug, Error)]
pub enum GovernanceError {
    /// Submission carried fewer distinct sources than policy requires and
    /// no audited override was supplied.
    #[error(
        "insufficient provenance: {distinct_sources} distinct source(s), {required} required"
    )]
    InsufficientProvenance {
        /// Distinct sources found in the submission
        distinct_sources: usize,
        /// The configured minimum
        required: usize,
    },

    /// A provenance record failed creation-time validation.
    #[error("malformed provenance: {0}")]
    MalformedProvenance(#[from] ProvenanceError),

    /// A stage acted outside its declared capability set.
    #[error("authority violation: stage '{stage}' attempted '{capability}'")]
    AuthorityViolation {
        /// Offending stage
        stage: StageKind,
        /// Capability it attempted
        capability: Capability,
    },

    /// Produced output cited a record the ledger does not hold.
    #[error("unsupported claim in task '{task_id}': citation '{record_id}' unresolved")]
    UnsupportedClaim {
        /// Task whose output failed
        task_id: TaskId,
        /// The dangling citation
        record_id: RecordId,
    },

    /// A declared budget was exceeded; the task halted immediately.
    #[error("budget exceeded for task '{task_id}': {resource} {used}/{limit}")]
    BudgetExceeded {
        /// The halted task
        task_id: TaskId,
        /// Which quota was crossed
        resource: BudgetResource,
        /// Usage after the breaching charge
        used: u32,
        /// The quota
        limit: u32,
    },

    /// A promotion was attempted without a valid human approval token.
    #[error("approval required to apply proposal '{proposal_id}'")]
    ApprovalRequired {
        /// The proposal involved
        proposal_id: ProposalId,
    },

    /// The goal conflicts with policy invariants. During risk assessment
    /// this forces the HIGH tier; as a submission blocker it fails the
    /// submission outright.
    #[error("policy conflict: {reason}")]
    PolicyConflict {
        /// Rules in conflict
        rule_refs: Vec<RuleId>,
        /// Why
        reason: String,
    },

    /// Task record operation failed.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Policy store operation failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Promotion queue operation failed.
    #[error(transparent)]
    Promotion(#[from] PromotionError),

    /// Audit append failed; the decision was not recorded and the operation
    /// that needed it did not proceed.
    #[error(transparent)]
    Audit(#[from] crate::audit::AuditError),

    /// Episodic or durable-log append failed.
    #[error(transparent)]
    Journal(#[from] crate::journal::JournalError),

    /// An external collaborator failed inside a stage.
    #[error("collaborator failure in stage '{stage}': {details}")]
    Collaborator {
        /// Stage whose collaborator failed
        stage: StageKind,
        /// What went wrong
        details: String,
    },
}

impl From<crate::stage::StageError> for GovernanceError {
    fn from(err: crate::stage::StageError) -> Self {
        use crate::stage::StageError;
        match err {
            StageError::AuthorityViolation { stage, capability } => {
                Self::AuthorityViolation { stage, capability }
            }
            StageError::Provenance(inner) => Self::MalformedProvenance(inner),
            StageError::Collaborator { stage, details } => Self::Collaborator { stage, details },
            StageError::MissingPrerequisite { stage, missing } => Self::Collaborator {
                stage,
                details: format!("missing prerequisite state: {missing}"),
            },
        }
    }
}
