//! The stage pipeline: capability-bounded processing stages.
//!
//! Implements: REQ-GOV-002 (Stage Pipeline & Capability Bounds)
//!
//! Every stage is a function over `(task, ledger, policy snapshot)` that
//! yields an updated task, one audit entry, and optionally an escalation.
//! What a stage may touch is declared up front as a capability grant set;
//! the [`StageContext`] refuses any write outside the grants, and the
//! refusal surfaces to the governor as an authority violation.
//!
//! | Stage      | May                                   | May not                    |
//! |------------|---------------------------------------|----------------------------|
//! | Plan       | write spec / success criteria         | gather facts, produce      |
//! | Gather     | append provenance records             | speculate beyond sources   |
//! | Produce    | write output bound to spec + sources  | change spec scope          |
//! | Review     | write pass/fail verdict + changes     | author or edit content     |
//! | Reconcile  | decide accept / retry / escalate      | re-run Review itself       |
//! | Compliance | write APPROVE/HOLD/REJECT verdict     | originate content          |

pub mod collaborators;
pub mod compliance;
pub mod gather;
pub mod plan;
pub mod produce;
pub mod reconcile;
pub mod review;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::CoreConfig;
use crate::policy::{PolicySnapshot, RuleId};
use crate::provenance::{ProvenanceDraft, ProvenanceError, ProvenanceLedger, ProvenanceRecord, RecordId};
use crate::task::{
    ComplianceVerdict, ProducedOutput, ReviewVerdict, TaskRecord, TaskSpec,
};

pub use collaborators::{
    Collaborators, ContentProducer, DraftOutput, NoopGatherer, SourceGatherer, TemplateProducer,
};
pub use compliance::ComplianceStage;
pub use gather::GatherStage;
pub use plan::PlanStage;
pub use produce::ProduceStage;
pub use reconcile::{Disposition, ReconcileStage};
pub use review::ReviewStage;

// ============================================================================
// Stage kinds & capability grants
// ============================================================================

/// The six pipeline stages, in fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Writes the task spec and success criteria
    Plan,
    /// Appends provenance records
    Gather,
    /// Writes output bound to spec and gathered provenance
    Produce,
    /// Writes a pass/fail verdict with required changes
    Review,
    /// Decides accept / retry / escalate
    Reconcile,
    /// Writes the outbound APPROVE/HOLD/REJECT verdict
    Compliance,
}

impl StageKind {
    /// The write capabilities this stage is granted. Everything else is an
    /// authority violation.
    #[must_use]
    pub fn grants(&self) -> &'static [Capability] {
        match self {
            Self::Plan => &[Capability::WriteSpec],
            Self::Gather => &[Capability::AppendProvenance],
            Self::Produce => &[Capability::WriteOutput],
            Self::Review => &[Capability::WriteReviewVerdict],
            Self::Reconcile => &[Capability::DecideDisposition],
            Self::Compliance => &[Capability::WriteComplianceVerdict],
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Gather => write!(f, "gather"),
            Self::Produce => write!(f, "produce"),
            Self::Review => write!(f, "review"),
            Self::Reconcile => write!(f, "reconcile"),
            Self::Compliance => write!(f, "compliance"),
        }
    }
}

/// A single grantable write capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Write the task spec
    WriteSpec,
    /// Append provenance records for the task
    AppendProvenance,
    /// Write the produced output
    WriteOutput,
    /// Write the review verdict
    WriteReviewVerdict,
    /// Decide accept/retry/escalate
    DecideDisposition,
    /// Write the compliance verdict
    WriteComplianceVerdict,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WriteSpec => "write_spec",
            Self::AppendProvenance => "append_provenance",
            Self::WriteOutput => "write_output",
            Self::WriteReviewVerdict => "write_review_verdict",
            Self::DecideDisposition => "decide_disposition",
            Self::WriteComplianceVerdict => "write_compliance_verdict",
        };
        f.write_str(s)
    }
}

/// The stage sequence for a risk tier.
///
/// Implements: REQ-GOV-002/F-001. Routing is a static table keyed by tier,
/// not runtime dispatch. LOW tasks skip Review/Reconcile (post-hoc audit
/// only); the HIGH-tier human gate before Produce is the runner's concern,
/// not part of the sequence itself.
#[must_use]
pub fn sequence_for(tier: crate::task::RiskTier) -> &'static [StageKind] {
    match tier {
        crate::task::RiskTier::Low => &[
            StageKind::Plan,
            StageKind::Gather,
            StageKind::Produce,
            StageKind::Compliance,
        ],
        crate::task::RiskTier::Medium | crate::task::RiskTier::High => &[
            StageKind::Plan,
            StageKind::Gather,
            StageKind::Produce,
            StageKind::Review,
            StageKind::Reconcile,
            StageKind::Compliance,
        ],
    }
}

// ============================================================================
// Stage errors & outcome
// ============================================================================

/// Typed failures a stage can surface. A stage never retries itself; the
/// governor logs the failure and decides retry vs. escalation from policy.
#[derive(Debug, Error)]
pub enum StageError {
    /// A stage attempted a write outside its capability grants.
    #[error("stage '{stage}' attempted '{capability}' outside its capability grants")]
    AuthorityViolation {
        /// Offending stage
        stage: StageKind,
        /// Capability it attempted
        capability: Capability,
    },

    /// A gathered record failed the ledger's creation-time validation.
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),

    /// An external collaborator (producer, gatherer) failed.
    #[error("collaborator failure in stage '{stage}': {details}")]
    Collaborator {
        /// Stage whose collaborator failed
        stage: StageKind,
        /// What went wrong
        details: String,
    },

    /// A stage needed task state an earlier stage should have written.
    #[error("stage '{stage}' is missing prerequisite state: {missing}")]
    MissingPrerequisite {
        /// Stage that hit the gap
        stage: StageKind,
        /// What was missing
        missing: &'static str,
    },
}

/// What a completed stage hands back to the pipeline runner.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// One-line rationale for the audit entry
    pub summary: String,
    /// Policy rules the stage applied
    pub policy_refs: Vec<RuleId>,
    /// Non-blocking findings, each recorded as a warning audit entry
    pub warnings: Vec<String>,
    /// Escalation request; the runner parks the task
    pub escalation: Option<String>,
    /// Reconcile's decision; `None` for every other stage
    pub disposition: Option<Disposition>,
}

impl StageOutcome {
    /// An ordinary completed-stage outcome.
    #[must_use]
    pub fn done(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            policy_refs: Vec::new(),
            warnings: Vec::new(),
            escalation: None,
            disposition: None,
        }
    }

    /// Attaches policy references.
    #[must_use]
    pub fn with_refs(mut self, refs: Vec<RuleId>) -> Self {
        self.policy_refs = refs;
        self
    }

    /// Attaches a non-blocking warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Requests escalation.
    #[must_use]
    pub fn escalate(mut self, reason: impl Into<String>) -> Self {
        self.escalation = Some(reason.into());
        self
    }
}

// ============================================================================
// Stage context
// ============================================================================

/// Capability-guarded view of one task during one stage execution.
///
/// Implements: REQ-GOV-002/F-002
///
/// The context owns the only mutable handle to the task while the stage
/// runs; every write checks the grant set of the executing stage first.
pub struct StageContext<'a> {
    stage: StageKind,
    task: &'a mut TaskRecord,
    ledger: &'a ProvenanceLedger,
    policy: Arc<PolicySnapshot>,
    config: &'a CoreConfig,
    tool_calls: u32,
}

impl<'a> StageContext<'a> {
    /// Builds a context for one stage execution.
    #[must_use]
    pub fn new(
        stage: StageKind,
        task: &'a mut TaskRecord,
        ledger: &'a ProvenanceLedger,
        policy: Arc<PolicySnapshot>,
        config: &'a CoreConfig,
    ) -> Self {
        Self {
            stage,
            task,
            ledger,
            policy,
            config,
            tool_calls: 0,
        }
    }

    fn require(&self, capability: Capability) -> Result<(), StageError> {
        if self.stage.grants().contains(&capability) {
            Ok(())
        } else {
            Err(StageError::AuthorityViolation {
                stage: self.stage,
                capability,
            })
        }
    }

    // ── Reads (ungated) ──────────────────────────────────────────────────

    /// The executing stage.
    #[must_use]
    pub fn stage(&self) -> StageKind {
        self.stage
    }

    /// Read-only view of the task.
    #[must_use]
    pub fn task(&self) -> &TaskRecord {
        self.task
    }

    /// The policy snapshot the task runs under.
    #[must_use]
    pub fn policy(&self) -> &PolicySnapshot {
        &self.policy
    }

    /// Core configuration (retry bounds, dominance share, …).
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        self.config
    }

    /// Resolves every ledger record admitted for this task.
    #[must_use]
    pub fn task_records(&self) -> Vec<Arc<ProvenanceRecord>> {
        self.task
            .provenance
            .iter()
            .filter_map(|id| self.ledger.get(id))
            .collect()
    }

    /// Looks up one ledger record.
    #[must_use]
    pub fn record(&self, id: &RecordId) -> Option<Arc<ProvenanceRecord>> {
        self.ledger.get(id)
    }

    /// Tool calls noted so far in this stage.
    #[must_use]
    pub fn tool_calls(&self) -> u32 {
        self.tool_calls
    }

    /// Notes external tool calls for budget accounting. The runner charges
    /// them against the task budget when the stage's atomic unit completes.
    pub fn note_tool_calls(&mut self, calls: u32) {
        self.tool_calls += calls;
    }

    // ── Writes (capability-gated) ────────────────────────────────────────

    /// Writes the task spec. Requires `WriteSpec`.
    pub fn set_spec(&mut self, spec: TaskSpec) -> Result<(), StageError> {
        self.require(Capability::WriteSpec)?;
        self.task.spec = Some(spec);
        Ok(())
    }

    /// Validates and appends one provenance record for this task.
    /// Requires `AppendProvenance`.
    pub fn append_provenance(&mut self, draft: ProvenanceDraft) -> Result<RecordId, StageError> {
        self.require(Capability::AppendProvenance)?;
        let id = self.ledger.append(draft)?;
        self.task.provenance.push(id.clone());
        Ok(id)
    }

    /// Writes the produced output, digest-bound to content and citations.
    /// Requires `WriteOutput`.
    pub fn set_output(
        &mut self,
        content: String,
        citations: Vec<RecordId>,
    ) -> Result<(), StageError> {
        self.require(Capability::WriteOutput)?;
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        for citation in &citations {
            hasher.update(citation.as_str().as_bytes());
        }
        let attempt = self.task.produce_attempts + 1;
        self.task.produce_attempts = attempt;
        self.task.output = Some(ProducedOutput {
            content,
            citations,
            digest: format!("{:x}", hasher.finalize()),
            attempt,
        });
        Ok(())
    }

    /// Writes the review verdict. Requires `WriteReviewVerdict`.
    pub fn set_review(&mut self, verdict: ReviewVerdict) -> Result<(), StageError> {
        self.require(Capability::WriteReviewVerdict)?;
        self.task.review = Some(verdict);
        Ok(())
    }

    /// Writes the compliance verdict. Requires `WriteComplianceVerdict`.
    pub fn set_compliance(&mut self, verdict: ComplianceVerdict) -> Result<(), StageError> {
        self.require(Capability::WriteComplianceVerdict)?;
        self.task.compliance = Some(verdict);
        Ok(())
    }
}

// ============================================================================
// Stage trait
// ============================================================================

/// One pipeline stage.
///
/// Implementations must be pure over their inputs apart from the declared
/// context writes: no retries, no sleeping, no direct store access. An `Err`
/// surfaces to the governor, which decides what happens next.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Which stage this is.
    fn kind(&self) -> StageKind;

    /// Executes the stage over the task.
    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Budget, ImpactFlags, RiskTier};

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
    fn writes_outside_grants_are_authority_violations() {
        let ledger = ProvenanceLedger::new();
        let policy = Arc::new(crate::policy::PolicyStore::new(
            crate::policy::loader::embedded_default_rules().unwrap(),
        ))
        .snapshot();
        let config = CoreConfig::default();
        let mut record = task();

        // Plan may write the spec…
        let mut ctx = StageContext::new(StageKind::Plan, &mut record, &ledger, policy.clone(), &config);
        ctx.set_spec(TaskSpec {
            deliverables: vec!["summary".into()],
            success_criteria: vec!["covers input".into()],
            constraints: vec![],
            estimated_steps: 4,
            estimated_tool_calls: 1,
            falsifiable: true,
        })
        .unwrap();

        // …but not the output.
        let err = ctx.set_output("draft".into(), vec![]).unwrap_err();
        match err {
            StageError::AuthorityViolation { stage, capability } => {
                assert_eq!(stage, StageKind::Plan);
                assert_eq!(capability, Capability::WriteOutput);
            }
            other => panic!("expected authority violation, got {other:?}"),
        }
    }

    #[test]
    fn low_tier_sequence_skips_review() {
        let seq = sequence_for(RiskTier::Low);
        assert!(!seq.contains(&StageKind::Review));
        assert!(seq.contains(&StageKind::Compliance));

        let seq = sequence_for(RiskTier::Medium);
        assert_eq!(
            seq,
            &[
                StageKind::Plan,
                StageKind::Gather,
                StageKind::Produce,
                StageKind::Review,
                StageKind::Reconcile,
                StageKind::Compliance,
            ]
        );
    }

    #[test]
    fn every_capability_is_granted_to_exactly_one_stage() {
        use Capability::*;
        for capability in [
            WriteSpec,
            AppendProvenance,
            WriteOutput,
            WriteReviewVerdict,
            DecideDisposition,
            WriteComplianceVerdict,
        ] {
            let holders: Vec<_> = [
                StageKind::Plan,
                StageKind::Gather,
                StageKind::Produce,
                StageKind::Review,
                StageKind::Reconcile,
                StageKind::Compliance,
            ]
            .into_iter()
            .filter(|s| s.grants().contains(&capability))
            .collect();
            assert_eq!(holders.len(), 1, "capability {capability} not exclusive");
        }
    }
}
