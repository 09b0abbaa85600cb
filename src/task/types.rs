//! Task domain types: record, risk tier, budgets, stage artifacts.
//!
//! Implements: REQ-GOV-001/§6.1

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::TaskError;
use super::status::TaskStatus;
use crate::provenance::RecordId;
use crate::stage::StageKind;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique task identifier (`task_` prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a new random task ID.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("task_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Wraps a known ID (journal recovery, tests).
    #[must_use]
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Risk Tier
// ============================================================================

/// Risk classification determining approval requirements.
///
/// Ordering is by severity, so tier comparisons read naturally:
/// `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    /// Auto-completes with post-hoc audit only
    Low,
    /// Requires a Review pass before output is finalized
    Medium,
    /// Requires a human gate before the Produce stage
    High,
}

impl RiskTier {
    /// The next tier up, capped at `High`.
    #[must_use]
    pub fn escalate_one(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

// ============================================================================
// Budgets
// ============================================================================

/// Which budget a breach concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetResource {
    /// Stage-transition step quota
    Steps,
    /// External tool-call quota
    ToolCalls,
}

impl fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steps => write!(f, "steps"),
            Self::ToolCalls => write!(f, "tool_calls"),
        }
    }
}

/// Per-task resource quotas, fixed at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum stage-transition steps
    pub max_steps: u32,
    /// Maximum external tool calls
    pub max_tool_calls: u32,
}

/// Running usage against a [`Budget`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetUsage {
    /// Steps consumed
    pub steps: u32,
    /// Tool calls consumed
    pub tool_calls: u32,
}

/// A budget limit was crossed. The task halts immediately; there is no
/// partial continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetBreach {
    /// Which quota was crossed
    pub resource: BudgetResource,
    /// Usage after the attempted charge
    pub used: u32,
    /// The quota
    pub limit: u32,
}

// ============================================================================
// Stage artifacts
// ============================================================================

/// Impact markers a submitter may declare up front. Undeclared impact is
/// still caught by the keyword heuristics, but a declared marker is
/// authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactFlags {
    /// Action cannot be undone once executed
    pub irreversible: bool,
    /// Action moves money or creates financial exposure
    pub financial: bool,
    /// Action creates legal or contractual exposure
    pub legal: bool,
}

impl ImpactFlags {
    /// True if any marker is set.
    #[must_use]
    pub fn any(&self) -> bool {
        self.irreversible || self.financial || self.legal
    }
}

/// Structured task specification written by the Plan stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Concrete artifacts the task must produce
    pub deliverables: Vec<String>,
    /// Checkable statements that define success
    pub success_criteria: Vec<String>,
    /// Constraints the output must respect
    pub constraints: Vec<String>,
    /// Projected stage-transition steps
    pub estimated_steps: u32,
    /// Projected external tool calls
    pub estimated_tool_calls: u32,
    /// Whether every success criterion is checkable
    pub falsifiable: bool,
}

/// Output written by the Produce stage, bound to spec and provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducedOutput {
    /// The produced content
    pub content: String,
    /// Ledger records the content claims support from
    pub citations: Vec<RecordId>,
    /// SHA-256 digest binding content + citations for integrity checks
    pub digest: String,
    /// 1-based Produce attempt that yielded this output
    pub attempt: u32,
}

/// Pass/fail verdict written by the Review stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    /// Whether the output passed review
    pub passed: bool,
    /// Observations, including non-blocking warnings
    pub notes: Vec<String>,
    /// Changes required before the output can pass
    pub required_changes: Vec<String>,
    /// When the verdict was written
    pub decided_at: DateTime<Utc>,
}

/// Outbound-action verdict written by the Compliance stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComplianceOutcome {
    /// Output may leave the system
    Approve,
    /// Output held for human review
    Hold,
    /// Output refused
    Reject,
}

impl fmt::Display for ComplianceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "APPROVE"),
            Self::Hold => write!(f, "HOLD"),
            Self::Reject => write!(f, "REJECT"),
        }
    }
}

/// Compliance verdict with its reasons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceVerdict {
    /// The verdict
    pub outcome: ComplianceOutcome,
    /// Why
    pub reasons: Vec<String>,
    /// When the verdict was written
    pub decided_at: DateTime<Utc>,
}

// ============================================================================
// Escalation
// ============================================================================

/// How a human resolved an escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionRecord {
    /// True for approve, false for reject
    pub approved: bool,
    /// Identity of the approver
    pub approver: String,
    /// When the decision arrived
    pub decided_at: DateTime<Utc>,
}

/// An escalation parked on the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    /// Why the task escalated
    pub reason: String,
    /// Stage that raised it; `None` when the governor parked the task
    pub raised_by: Option<StageKind>,
    /// Stage execution resumes from if approved
    pub resume_from: StageKind,
    /// When the task parked
    pub raised_at: DateTime<Utc>,
    /// Human disposition, once it arrives
    pub resolution: Option<ResolutionRecord>,
}

/// Record of a status transition, kept on the task as its local audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTransition {
    /// Previous status
    pub from: TaskStatus,
    /// New status
    pub to: TaskStatus,
    /// When the transition occurred
    pub at: DateTime<Utc>,
    /// Why
    pub reason: Option<String>,
}

// ============================================================================
// Task record
// ============================================================================

/// The complete record of one governed task.
///
/// Implements: REQ-GOV-001/§6.1
///
/// Owned exclusively by whichever stage currently holds control; the
/// governor holds ownership between stages. All mutation goes through the
/// store, which enforces the ownership handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier
    pub id: TaskId,
    /// The goal as submitted
    pub goal: String,
    /// Risk tier assigned at admission
    pub risk_tier: RiskTier,
    /// Declared impact markers from submission
    pub impact: ImpactFlags,
    /// Stage currently (or last) holding control
    pub current_stage: Option<StageKind>,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Resource quotas
    pub budget: Budget,
    /// Usage against the quotas
    pub usage: BudgetUsage,

    /// Ledger records admitted for this task (submission + Gather)
    pub provenance: Vec<RecordId>,
    /// Spec written by Plan
    pub spec: Option<TaskSpec>,
    /// Output written by Produce
    pub output: Option<ProducedOutput>,
    /// Verdict written by Review
    pub review: Option<ReviewVerdict>,
    /// Verdict written by Compliance
    pub compliance: Option<ComplianceVerdict>,
    /// Produce attempts so far (Reconcile retry accounting)
    pub produce_attempts: u32,
    /// Parked escalation, if any
    pub escalation: Option<EscalationRecord>,

    /// Human-readable rationale for the terminal state
    pub rationale: Option<String>,
    /// Local transition trail
    pub transitions: Vec<TaskTransition>,
    /// When the task was admitted
    pub created_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Creates a new record in `Pending`.
    #[must_use]
    pub fn new(
        goal: impl Into<String>,
        risk_tier: RiskTier,
        impact: ImpactFlags,
        budget: Budget,
        provenance: Vec<RecordId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            goal: goal.into(),
            risk_tier,
            impact,
            current_stage: None,
            status: TaskStatus::Pending,
            budget,
            usage: BudgetUsage::default(),
            provenance,
            spec: None,
            output: None,
            review: None,
            compliance: None,
            produce_attempts: 0,
            escalation: None,
            rationale: None,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies an automated status transition.
    ///
    /// Implements: REQ-GOV-001/F-001
    ///
    /// Terminal records are immutable; a parked (`Escalated`) record refuses
    /// every automated transition; only [`Self::resolve_escalation`] may
    /// move it.
    pub fn transition(
        &mut self,
        new_status: TaskStatus,
        reason: Option<String>,
    ) -> Result<(), TaskError> {
        if self.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                task_id: self.id.clone(),
                status: self.status,
            });
        }
        if self.status.is_parked() {
            return Err(TaskError::ParkedAwaitingHuman {
                task_id: self.id.clone(),
            });
        }
        if !self.status.can_transition_to(new_status) {
            return Err(TaskError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: new_status,
            });
        }
        self.record_transition(new_status, reason);
        Ok(())
    }

    /// Applies a human escalation resolution.
    ///
    /// Implements: REQ-GOV-003/F-002, the only path out of `Escalated`.
    /// Approval moves the task back to `Running` so the pipeline can resume
    /// from the parked stage; rejection terminates with the approver's
    /// reason.
    pub fn resolve_escalation(
        &mut self,
        approved: bool,
        approver: impl Into<String>,
        reason: Option<String>,
    ) -> Result<(), TaskError> {
        if self.status != TaskStatus::Escalated {
            return Err(TaskError::NotEscalated {
                task_id: self.id.clone(),
                status: self.status,
            });
        }
        let approver = approver.into();
        if let Some(escalation) = &mut self.escalation {
            escalation.resolution = Some(ResolutionRecord {
                approved,
                approver: approver.clone(),
                decided_at: Utc::now(),
            });
        }
        let (next, default_reason) = if approved {
            (TaskStatus::Running, format!("approved by {approver}"))
        } else {
            (TaskStatus::Rejected, format!("rejected by {approver}"))
        };
        self.record_transition(next, Some(reason.unwrap_or(default_reason)));
        Ok(())
    }

    /// Charges one stage-transition step against the budget.
    pub fn charge_step(&mut self) -> Result<(), BudgetBreach> {
        self.usage.steps += 1;
        if self.usage.steps > self.budget.max_steps {
            return Err(BudgetBreach {
                resource: BudgetResource::Steps,
                used: self.usage.steps,
                limit: self.budget.max_steps,
            });
        }
        Ok(())
    }

    /// Charges external tool calls against the budget.
    pub fn charge_tool_calls(&mut self, calls: u32) -> Result<(), BudgetBreach> {
        self.usage.tool_calls += calls;
        if self.usage.tool_calls > self.budget.max_tool_calls {
            return Err(BudgetBreach {
                resource: BudgetResource::ToolCalls,
                used: self.usage.tool_calls,
                limit: self.budget.max_tool_calls,
            });
        }
        Ok(())
    }

    /// Parks the task in `Escalated` with a pending resolution slot.
    pub fn park(
        &mut self,
        reason: impl Into<String>,
        raised_by: Option<StageKind>,
        resume_from: StageKind,
    ) -> Result<(), TaskError> {
        let reason = reason.into();
        self.escalation = Some(EscalationRecord {
            reason: reason.clone(),
            raised_by,
            resume_from,
            raised_at: Utc::now(),
            resolution: None,
        });
        self.transition(TaskStatus::Escalated, Some(reason))
    }

    fn record_transition(&mut self, to: TaskStatus, reason: Option<String>) {
        self.transitions.push(TaskTransition {
            from: self.status,
            to,
            at: Utc::now(),
            reason,
        });
        self.status = to;
        self.updated_at = Utc::now();
    }
}
