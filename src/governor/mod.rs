//! The Governor: single authority for admission, risk, and escalation.
//!
//! Implements: REQ-GOV-001 (Task Admission & Risk Assessment),
//!             REQ-GOV-003 (Escalation & Human Resolution)
//!
//! The governor never generates content and never judges factual truth.
//! It admits or refuses submissions, assigns the risk tier, owns the task
//! record between stages, and is the only automated party allowed to record
//! a human's escalation decision.

pub mod risk;

use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::{AuditDecision, AuditLog};
use crate::config::CoreConfig;
use crate::error::GovernanceError;
use crate::policy::{PolicyStore, RuleId};
use crate::provenance::{ProvenanceDraft, ProvenanceLedger};
use crate::task::{
    Budget, ImpactFlags, RiskTier, TaskId, TaskRecord, TaskStatus, TaskStore,
};

pub use risk::{ConflictFinding, RiskAssessment};

// ============================================================================
// Submission surface
// ============================================================================

/// Options supplied with a submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Accept fewer than the configured minimum of distinct sources. The
    /// override itself is recorded in the audit trail.
    pub allow_single_source: bool,
    /// Impact markers the submitter declares up front
    pub impact: ImpactFlags,
}

/// A human's disposition of an escalated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationDecision {
    /// Resume the task from the parked stage
    Approve,
    /// Terminate the task with the approver's reason
    Reject,
}

// ============================================================================
// Governor
// ============================================================================

/// The admission and escalation authority.
pub struct Governor {
    config: Arc<CoreConfig>,
    policy: Arc<PolicyStore>,
    ledger: Arc<ProvenanceLedger>,
    audit: Arc<AuditLog>,
    tasks: Arc<TaskStore>,
}

impl Governor {
    /// Creates a governor over the shared stores.
    #[must_use]
    pub fn new(
        config: Arc<CoreConfig>,
        policy: Arc<PolicyStore>,
        ledger: Arc<ProvenanceLedger>,
        audit: Arc<AuditLog>,
        tasks: Arc<TaskStore>,
    ) -> Self {
        Self {
            config,
            policy,
            ledger,
            audit,
            tasks,
        }
    }

    /// Admits a submission or refuses it with a recorded rationale.
    ///
    /// Implements: REQ-GOV-001/F-002
    ///
    /// Constraint order matters: malformed provenance is checked first
    /// (creation-time rejection), then the minimum-source rule, then the
    /// policy-conflict blocker. A refused submission creates no task record;
    /// the refusal itself is still audited.
    pub fn submit(
        &self,
        goal: &str,
        provenance: Vec<ProvenanceDraft>,
        options: SubmitOptions,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        // Creation-time validation of every supplied record.
        for draft in &provenance {
            if let Err(err) = ProvenanceLedger::validate(draft) {
                self.audit.append(
                    None,
                    None,
                    AuditDecision::SubmissionRejected,
                    format!("malformed provenance for goal '{goal}': {err}"),
                    vec![RuleId::from_raw("pol_provenance_required")],
                )?;
                return Err(GovernanceError::MalformedProvenance(err));
            }
        }

        // Minimum-source rule.
        let mut sources: Vec<&str> = provenance.iter().map(|d| d.source.as_str()).collect();
        sources.sort_unstable();
        sources.dedup();
        let distinct = sources.len();
        let required = self.config.provenance.min_sources;
        let override_used = distinct < required && options.allow_single_source;
        if distinct < required && !options.allow_single_source {
            self.audit.append(
                None,
                None,
                AuditDecision::SubmissionRejected,
                format!(
                    "goal '{goal}' submitted with {distinct} distinct source(s); {required} required"
                ),
                vec![RuleId::from_raw("pol_provenance_required")],
            )?;
            return Err(GovernanceError::InsufficientProvenance {
                distinct_sources: distinct,
                required,
            });
        }

        let snapshot = self.policy.snapshot();
        let budget = Budget {
            max_steps: self.config.budgets.max_steps,
            max_tool_calls: self.config.budgets.max_tool_calls,
        };

        // A conflict that is itself the submission's blocker refuses the
        // submission; any other conflict is a tier-forcing signal inside
        // the assessment.
        if let Some(finding) = risk::detect_conflict(goal) {
            if finding.blocks_submission {
                self.audit.append(
                    None,
                    None,
                    AuditDecision::SubmissionRejected,
                    format!("goal '{goal}' refused: {}", finding.reason),
                    finding.rule_refs.clone(),
                )?;
                warn!(goal, reason = %finding.reason, "Submission refused on policy conflict");
                return Err(GovernanceError::PolicyConflict {
                    rule_refs: finding.rule_refs,
                    reason: finding.reason,
                });
            }
        }

        let assessment = risk::assess(goal, options.impact, &self.config, &snapshot, budget);

        // Admit: append provenance, create the record, reserve the ID.
        let mut record_ids = Vec::with_capacity(provenance.len());
        for draft in provenance {
            record_ids.push(self.ledger.append(draft)?);
        }
        let task = self.tasks.insert(TaskRecord::new(
            goal,
            assessment.tier,
            options.impact,
            budget,
            record_ids,
        ));

        self.audit.append(
            Some(task.id.clone()),
            None,
            AuditDecision::Admitted,
            format!("goal '{goal}' admitted with {distinct} distinct source(s)"),
            vec![RuleId::from_raw("pol_provenance_required")],
        )?;
        if override_used {
            self.audit.append(
                Some(task.id.clone()),
                None,
                AuditDecision::OverrideGranted,
                format!("single-source override accepted ({distinct}/{required} sources)"),
                vec![RuleId::from_raw("pol_provenance_required")],
            )?;
        }
        self.audit.append(
            Some(task.id.clone()),
            None,
            AuditDecision::TierAssigned,
            assessment.rationale.clone(),
            assessment.policy_refs.clone(),
        )?;

        info!(
            task_id = %task.id,
            tier = %assessment.tier,
            "Task admitted"
        );
        Ok(task)
    }

    /// Records a human's disposition of an escalated task.
    ///
    /// Implements: REQ-GOV-003/F-002, the only path out of `ESCALATED`.
    pub fn resolve_escalation(
        &self,
        task_id: &TaskId,
        decision: EscalationDecision,
        approver: &str,
        reason: Option<String>,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        let approved = decision == EscalationDecision::Approve;
        let task = self.tasks.update(task_id, |task| {
            task.resolve_escalation(approved, approver, reason.clone())
        })?;

        self.audit.append(
            Some(task_id.clone()),
            None,
            AuditDecision::EscalationResolved,
            format!(
                "escalation {} by '{approver}'",
                if approved { "approved" } else { "rejected" }
            ),
            vec![RuleId::from_raw("pol_irreversible_needs_human")],
        )?;

        if !approved {
            self.record_terminal(task_id, AuditDecision::Rejected)?;
        }
        Ok(task)
    }

    /// Cancels a `Pending` task directly. `Running` tasks are cancelled
    /// cooperatively by the pipeline when it observes the cancel token.
    pub fn cancel_pending(
        &self,
        task_id: &TaskId,
        reason: &str,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        let task = self.tasks.update(task_id, |task| {
            task.rationale = Some(format!("cancelled: {reason}"));
            task.transition(TaskStatus::Rejected, Some(format!("cancelled: {reason}")))
        })?;
        self.audit.append(
            Some(task_id.clone()),
            None,
            AuditDecision::Cancelled,
            format!("cancelled before start: {reason}"),
            vec![],
        )?;
        Ok(task)
    }

    /// Copies the terminal rationale of a task into the audit trail.
    pub(crate) fn record_terminal(
        &self,
        task_id: &TaskId,
        decision: AuditDecision,
    ) -> Result<(), GovernanceError> {
        let task = self.tasks.get(task_id)?;
        let rationale = task
            .rationale
            .clone()
            .or_else(|| {
                task.transitions
                    .last()
                    .and_then(|transition| transition.reason.clone())
            })
            .unwrap_or_else(|| format!("task reached {}", task.status));
        self.audit
            .append(Some(task_id.clone()), None, decision, rationale, vec![])?;
        Ok(())
    }

    /// The governor's view of a task.
    pub fn get_task(&self, task_id: &TaskId) -> Result<Arc<TaskRecord>, GovernanceError> {
        Ok(self.tasks.get(task_id)?)
    }

    /// Risk tier for an already-admitted task; used by routing.
    pub fn tier_of(&self, task_id: &TaskId) -> Result<RiskTier, GovernanceError> {
        Ok(self.tasks.get(task_id)?.risk_tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn governor() -> Governor {
        let config = Arc::new(CoreConfig::default());
        let policy = Arc::new(PolicyStore::new(
            crate::policy::loader::embedded_default_rules().unwrap(),
        ));
        Governor::new(
            config,
            policy,
            Arc::new(ProvenanceLedger::new()),
            Arc::new(AuditLog::new()),
            Arc::new(TaskStore::new()),
        )
    }

    fn draft(source: &str, confidence: f64) -> ProvenanceDraft {
        ProvenanceDraft {
            source: source.to_string(),
            timestamp: Utc::now(),
            confidence,
            content_ref: "input".to_string(),
        }
    }

    #[test]
    fn one_source_without_override_is_refused_and_no_task_exists() {
        let governor = governor();
        let err = governor
            .submit("Summarize input", vec![draft("only", 0.9)], SubmitOptions::default())
            .unwrap_err();
        assert!(matches!(err, GovernanceError::InsufficientProvenance { .. }));
        assert_eq!(governor.tasks.total_count(), 0);
        // The refusal is audited without a task id.
        assert_eq!(governor.audit.len(), 1);
    }

    #[test]
    fn override_admits_and_is_itself_audited() {
        let governor = governor();
        let task = governor
            .submit(
                "Summarize input",
                vec![draft("only", 0.9)],
                SubmitOptions {
                    allow_single_source: true,
                    ..SubmitOptions::default()
                },
            )
            .unwrap();
        let entries = governor.audit.entries_for_task(&task.id);
        assert!(entries
            .iter()
            .any(|e| e.decision == AuditDecision::OverrideGranted));
    }

    #[test]
    fn malformed_provenance_is_rejected_before_counting_sources() {
        let governor = governor();
        let err = governor
            .submit(
                "Summarize input",
                vec![draft("a", 0.9), draft("b", 7.0)],
                SubmitOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, GovernanceError::MalformedProvenance(_)));
        assert_eq!(governor.tasks.total_count(), 0);
    }

    #[test]
    fn store_mutation_goal_is_the_submission_blocker() {
        let governor = governor();
        let err = governor
            .submit(
                "Modify the policy rule set",
                vec![draft("a", 0.9), draft("b", 0.8)],
                SubmitOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, GovernanceError::PolicyConflict { .. }));
        assert_eq!(governor.tasks.total_count(), 0);
    }

    #[test]
    fn admission_audits_resolve_against_the_policy_store() {
        let governor = governor();
        let task = governor
            .submit(
                "Wire $5,000 payment",
                vec![draft("a", 0.9), draft("b", 0.8), draft("c", 0.7)],
                SubmitOptions::default(),
            )
            .unwrap();
        assert_eq!(task.risk_tier, RiskTier::High);

        let snapshot = governor.policy.snapshot();
        for entry in governor.audit.entries_for_task(&task.id) {
            assert!(
                snapshot.resolves_all(&entry.policy_refs),
                "dangling refs in {:?}",
                entry
            );
        }
    }

    #[test]
    fn resolving_a_non_escalated_task_fails() {
        let governor = governor();
        let task = governor
            .submit(
                "Summarize input",
                vec![draft("a", 0.6), draft("b", 0.8)],
                SubmitOptions::default(),
            )
            .unwrap();
        let err = governor
            .resolve_escalation(&task.id, EscalationDecision::Approve, "operator", None)
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::Task(crate::task::TaskError::NotEscalated { .. })
        ));
    }
}
