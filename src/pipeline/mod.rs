//! Pipeline runner: fixed-order stage execution with gates and budgets.
//!
//! Implements: REQ-GOV-002 (Stage Pipeline), REQ-GOV-001/F-004 (Routing)
//!
//! The runner drives one task through its tier's stage sequence. Between
//! stages it checks the cancel token and the step budget; around the
//! Produce stage it enforces the HIGH-tier human gate; after Review it
//! lets Reconcile loop the task back to Produce within the retry bound.
//! Escalations park the task and return; resumption is a fresh call after
//! a human approves, never an automatic clear.
//!
//! Each stage runs against an owned copy of the task record (the stage's
//! atomic unit of work); the copy is committed to the store when the unit
//! completes, so cancellation never leaves state half-written.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{AuditDecision, AuditLog};
use crate::config::CoreConfig;
use crate::episodic::{EpisodeRecord, EpisodicLog};
use crate::error::GovernanceError;
use crate::policy::PolicyStore;
use crate::provenance::ProvenanceLedger;
use crate::stage::{
    Collaborators, ComplianceStage, Disposition, GatherStage, PlanStage, ProduceStage,
    ReconcileStage, ReviewStage, Stage, StageContext, StageError, StageKind, sequence_for,
};
use crate::task::{
    BudgetBreach, ComplianceOutcome, RiskTier, TaskId, TaskRecord, TaskStatus, TaskStore,
};

/// Drives tasks through their stage sequences.
pub struct PipelineRunner {
    config: Arc<CoreConfig>,
    policy: Arc<PolicyStore>,
    ledger: Arc<ProvenanceLedger>,
    audit: Arc<AuditLog>,
    tasks: Arc<TaskStore>,
    episodic: Arc<EpisodicLog>,
    /// Cancellation reasons keyed by task, written by the caller that
    /// cancels and read once when the runner finalizes the task. The
    /// reason rides outside the record so a stage commit cannot race it.
    cancel_reasons: Arc<dashmap::DashMap<TaskId, String>>,
    plan: PlanStage,
    gather: GatherStage,
    produce: ProduceStage,
    review: ReviewStage,
    reconcile: ReconcileStage,
    compliance: ComplianceStage,
}

impl PipelineRunner {
    /// Creates a runner over the shared stores and collaborator set.
    #[must_use]
    pub fn new(
        config: Arc<CoreConfig>,
        policy: Arc<PolicyStore>,
        ledger: Arc<ProvenanceLedger>,
        audit: Arc<AuditLog>,
        tasks: Arc<TaskStore>,
        episodic: Arc<EpisodicLog>,
        collaborators: Collaborators,
        cancel_reasons: Arc<dashmap::DashMap<TaskId, String>>,
    ) -> Self {
        Self {
            config,
            policy,
            ledger,
            audit,
            tasks,
            episodic,
            cancel_reasons,
            plan: PlanStage,
            gather: GatherStage::new(collaborators.clone()),
            produce: ProduceStage::new(collaborators.clone()),
            review: ReviewStage,
            reconcile: ReconcileStage,
            compliance: ComplianceStage,
        }
    }

    fn stage_for(&self, kind: StageKind) -> &dyn Stage {
        match kind {
            StageKind::Plan => &self.plan,
            StageKind::Gather => &self.gather,
            StageKind::Produce => &self.produce,
            StageKind::Review => &self.review,
            StageKind::Reconcile => &self.reconcile,
            StageKind::Compliance => &self.compliance,
        }
    }

    /// Runs a freshly admitted task from the first stage.
    pub async fn run(
        &self,
        task_id: &TaskId,
        cancel: CancellationToken,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        let mut task = (*self.tasks.get(task_id)?).clone();
        if task.status.is_terminal() {
            // Cancelled (or otherwise closed) between admission and the
            // worker becoming free; nothing left to run.
            return Ok(self.tasks.get(task_id)?);
        }
        if task.status == TaskStatus::Pending {
            task.transition(TaskStatus::Running, Some("pipeline started".into()))?;
            self.tasks.commit(task.clone())?;
        }
        self.drive(task, 0, cancel).await
    }

    /// Resumes a task whose escalation a human approved.
    ///
    /// The task is already back in `Running` (the resolution moved it);
    /// execution restarts at the stage recorded when it parked.
    pub async fn resume(
        &self,
        task_id: &TaskId,
        cancel: CancellationToken,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        let task = (*self.tasks.get(task_id)?).clone();
        if task.status.is_terminal() {
            return Ok(self.tasks.get(task_id)?);
        }
        let resume_from = task
            .escalation
            .as_ref()
            .map(|e| e.resume_from)
            .unwrap_or(StageKind::Plan);
        let sequence = sequence_for(task.risk_tier);
        let start = sequence
            .iter()
            .position(|s| *s == resume_from)
            .unwrap_or(0);
        self.drive(task, start, cancel).await
    }

    async fn drive(
        &self,
        mut task: TaskRecord,
        start_index: usize,
        cancel: CancellationToken,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        let sequence = sequence_for(task.risk_tier);
        let mut index = start_index;
        let mut lessons: Vec<String> = Vec::new();
        let policy = self.policy.snapshot();

        while index < sequence.len() {
            // Cooperative cancellation: between atomic units only.
            if cancel.is_cancelled() {
                return self.finalize_cancelled(task, lessons).await;
            }

            let kind = sequence[index];

            // HIGH-tier human gate before Produce. A previously approved
            // resolution on the record satisfies the gate.
            if kind == StageKind::Produce
                && task.risk_tier == RiskTier::High
                && !has_approved_resolution(&task)
            {
                return self
                    .park(
                        task,
                        "HIGH-tier task requires human approval before Produce",
                        None,
                        StageKind::Produce,
                        lessons,
                    )
                    .await;
            }

            task.current_stage = Some(kind);

            // One step per stage transition; a breach halts immediately.
            if let Err(breach) = task.charge_step() {
                return self.finalize_budget_halt(task, breach, lessons).await;
            }
            let outcome = {
                let mut ctx =
                    StageContext::new(kind, &mut task, &self.ledger, policy.clone(), &self.config);
                let result = self.stage_for(kind).run(&mut ctx).await;
                let tool_calls = ctx.tool_calls();
                match result {
                    Ok(outcome) => {
                        if tool_calls > 0 {
                            if let Err(breach) = task.charge_tool_calls(tool_calls) {
                                self.audit.append(
                                    Some(task.id.clone()),
                                    Some(kind),
                                    AuditDecision::StageCompleted,
                                    outcome.summary.clone(),
                                    outcome.policy_refs.clone(),
                                )?;
                                return self.finalize_budget_halt(task, breach, lessons).await;
                            }
                        }
                        outcome
                    }
                    Err(err) => {
                        return self.handle_stage_failure(task, kind, err, lessons).await;
                    }
                }
            };

            self.audit.append(
                Some(task.id.clone()),
                Some(kind),
                AuditDecision::StageCompleted,
                outcome.summary.clone(),
                outcome.policy_refs.clone(),
            )?;
            for warning in &outcome.warnings {
                self.audit.append(
                    Some(task.id.clone()),
                    Some(kind),
                    AuditDecision::Warning,
                    warning.clone(),
                    vec![],
                )?;
                lessons.push(format!("warning:{kind}"));
            }

            // Compliance verdicts decide the terminal path inline.
            if kind == StageKind::Compliance {
                match task.compliance.as_ref().map(|v| v.outcome) {
                    Some(ComplianceOutcome::Reject) => {
                        let reasons = task
                            .compliance
                            .as_ref()
                            .map(|v| v.reasons.join("; "))
                            .unwrap_or_default();
                        lessons.push("compliance:reject".into());
                        return self
                            .finalize_rejected(task, format!("compliance rejected: {reasons}"), lessons)
                            .await;
                    }
                    Some(ComplianceOutcome::Hold) => {
                        lessons.push("compliance:hold".into());
                        let reason = outcome
                            .escalation
                            .clone()
                            .unwrap_or_else(|| "compliance hold".into());
                        return self
                            .park(task, reason, Some(kind), StageKind::Compliance, lessons)
                            .await;
                    }
                    _ => {}
                }
            } else if let Some(disposition) = outcome.disposition {
                match disposition {
                    Disposition::Accept => {}
                    Disposition::Retry => {
                        lessons.push(lesson_for_retry(&task));
                        ensure_status(
                            &mut task,
                            TaskStatus::Running,
                            "reconcile granted a produce retry",
                        )?;
                        self.tasks.commit(task.clone())?;
                        index = sequence
                            .iter()
                            .position(|s| *s == StageKind::Produce)
                            .expect("produce in sequence");
                        continue;
                    }
                    Disposition::Escalate => {
                        lessons.push(lesson_for_retry(&task));
                        lessons.push("reconcile:escalate".into());
                        let reason = outcome
                            .escalation
                            .clone()
                            .unwrap_or_else(|| "reconcile escalation".into());
                        // Approval here means a human accepted the output
                        // despite review; execution resumes at Compliance.
                        return self
                            .park(task, reason, Some(kind), StageKind::Compliance, lessons)
                            .await;
                    }
                }
            } else if let Some(reason) = outcome.escalation.clone() {
                return self.park(task, reason, Some(kind), kind, lessons).await;
            }

            // Output lands in REVIEW status while verdicts are pending.
            if sequence.get(index + 1) == Some(&StageKind::Review) {
                ensure_status(&mut task, TaskStatus::Review, "output ready for review")?;
            }

            self.tasks.commit(task.clone())?;
            index += 1;
        }

        self.finalize_done(task, lessons).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Terminal paths
    // ─────────────────────────────────────────────────────────────────────

    async fn finalize_done(
        &self,
        mut task: TaskRecord,
        mut lessons: Vec<String>,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        let rationale = task
            .compliance
            .as_ref()
            .map(|v| format!("completed; compliance {}: {}", v.outcome, v.reasons.join("; ")))
            .unwrap_or_else(|| "completed".to_string());
        task.rationale = Some(rationale.clone());
        task.transition(TaskStatus::Done, Some(rationale.clone()))?;
        let task = self.tasks.commit(task)?;

        self.audit.append(
            Some(task.id.clone()),
            None,
            AuditDecision::Completed,
            rationale,
            vec![],
        )?;
        lessons.push(format!("done:{}", task.risk_tier));
        self.record_episode(&task, lessons)?;
        info!(task_id = %task.id, "Task completed");
        Ok(task)
    }

    async fn finalize_rejected(
        &self,
        mut task: TaskRecord,
        rationale: String,
        lessons: Vec<String>,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        task.rationale = Some(rationale.clone());
        task.transition(TaskStatus::Rejected, Some(rationale.clone()))?;
        let task = self.tasks.commit(task)?;

        self.audit.append(
            Some(task.id.clone()),
            None,
            AuditDecision::Rejected,
            rationale,
            vec![],
        )?;
        self.record_episode(&task, lessons)?;
        info!(task_id = %task.id, "Task rejected");
        Ok(task)
    }

    async fn finalize_cancelled(
        &self,
        mut task: TaskRecord,
        mut lessons: Vec<String>,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        let rationale = self
            .cancel_reasons
            .remove(&task.id)
            .map(|(_, reason)| format!("cancelled: {reason}"))
            .unwrap_or_else(|| "cancelled on external request".to_string());
        task.rationale = Some(rationale.clone());
        task.transition(TaskStatus::Rejected, Some(rationale.clone()))?;
        let task = self.tasks.commit(task)?;

        self.audit.append(
            Some(task.id.clone()),
            None,
            AuditDecision::Cancelled,
            rationale,
            vec![],
        )?;
        lessons.push("cancelled".into());
        self.record_episode(&task, lessons)?;
        Ok(task)
    }

    async fn finalize_budget_halt(
        &self,
        mut task: TaskRecord,
        breach: BudgetBreach,
        mut lessons: Vec<String>,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        let rationale = format!(
            "budget exceeded: {} {}/{}",
            breach.resource, breach.used, breach.limit
        );
        task.rationale = Some(rationale.clone());
        task.transition(TaskStatus::Rejected, Some(rationale.clone()))?;
        let task = self.tasks.commit(task)?;

        self.audit.append(
            Some(task.id.clone()),
            task.current_stage,
            AuditDecision::BudgetHalted,
            rationale.clone(),
            vec![crate::policy::RuleId::from_raw("pol_budget_discipline")],
        )?;
        self.audit.append(
            Some(task.id.clone()),
            None,
            AuditDecision::Rejected,
            rationale,
            vec![],
        )?;
        lessons.push(format!("budget_halted:{}", breach.resource));
        self.record_episode(&task, lessons)?;
        warn!(task_id = %task.id, resource = %breach.resource, "Budget halt");
        Err(GovernanceError::BudgetExceeded {
            task_id: task.id.clone(),
            resource: breach.resource,
            used: breach.used,
            limit: breach.limit,
        })
    }

    /// Parks the task in `ESCALATED`. Parked tasks are not terminal, so no
    /// episode is written here; the lessons accumulated so far are already
    /// in the audit trail.
    async fn park(
        &self,
        mut task: TaskRecord,
        reason: impl Into<String>,
        raised_by: Option<StageKind>,
        resume_from: StageKind,
        _lessons: Vec<String>,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        let reason = reason.into();
        task.park(reason.clone(), raised_by, resume_from)?;
        let task = self.tasks.commit(task)?;

        self.audit.append(
            Some(task.id.clone()),
            raised_by,
            AuditDecision::Escalated,
            reason.clone(),
            vec![crate::policy::RuleId::from_raw("pol_irreversible_needs_human")],
        )?;
        info!(task_id = %task.id, reason = %reason, "Task escalated; awaiting human disposition");
        Ok(task)
    }

    async fn handle_stage_failure(
        &self,
        task: TaskRecord,
        kind: StageKind,
        err: StageError,
        mut lessons: Vec<String>,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        self.audit.append(
            Some(task.id.clone()),
            Some(kind),
            AuditDecision::StageFailed,
            err.to_string(),
            vec![],
        )?;
        lessons.push(format!("stage_failed:{kind}"));

        // The governor's policy for typed stage failures: authority and
        // collaborator problems need a human; malformed inputs and missing
        // prerequisites terminate cleanly.
        match err {
            StageError::AuthorityViolation { stage, capability } => {
                lessons.push("authority_violation".into());
                let reason =
                    format!("authority violation: stage '{stage}' attempted '{capability}'");
                self.park(task, reason, Some(kind), kind, lessons).await
            }
            StageError::Collaborator { ref details, .. } => {
                let reason = format!("collaborator failure in '{kind}': {details}");
                self.park(task, reason, Some(kind), kind, lessons).await
            }
            StageError::Provenance(inner) => {
                self.finalize_rejected(
                    task,
                    format!("malformed provenance from '{kind}': {inner}"),
                    lessons,
                )
                .await
            }
            StageError::MissingPrerequisite { missing, .. } => {
                self.finalize_rejected(
                    task,
                    format!("stage '{kind}' missing prerequisite state: {missing}"),
                    lessons,
                )
                .await
            }
        }
    }

    fn record_episode(
        &self,
        task: &TaskRecord,
        lessons: Vec<String>,
    ) -> Result<(), GovernanceError> {
        let stages_run: Vec<StageKind> = sequence_for(task.risk_tier)
            .iter()
            .copied()
            .filter(|kind| stage_ran(task, *kind))
            .collect();
        let duration_ms = (chrono::Utc::now() - task.created_at)
            .num_milliseconds()
            .max(0) as u64;
        self.episodic.append(EpisodeRecord {
            task_id: task.id.clone(),
            timestamp: chrono::Utc::now(),
            risk_tier: task.risk_tier,
            outcome: task.status,
            stages_run,
            lessons,
            duration_ms,
        })?;
        Ok(())
    }
}

/// Whether the task record shows evidence the stage executed.
fn stage_ran(task: &TaskRecord, kind: StageKind) -> bool {
    match kind {
        StageKind::Plan => task.spec.is_some(),
        StageKind::Gather => task.spec.is_some(),
        StageKind::Produce => task.output.is_some(),
        StageKind::Review => task.review.is_some(),
        StageKind::Reconcile => task.review.is_some(),
        StageKind::Compliance => task.compliance.is_some(),
    }
}

fn has_approved_resolution(task: &TaskRecord) -> bool {
    task.escalation
        .as_ref()
        .and_then(|e| e.resolution.as_ref())
        .is_some_and(|r| r.approved)
}

fn ensure_status(
    task: &mut TaskRecord,
    target: TaskStatus,
    reason: &str,
) -> Result<(), crate::task::TaskError> {
    if task.status == target {
        return Ok(());
    }
    task.transition(target, Some(reason.to_string()))
}

fn lesson_for_retry(task: &TaskRecord) -> String {
    let unsupported = task
        .review
        .as_ref()
        .is_some_and(|v| v.required_changes.iter().any(|c| c.contains("unsupported claim")));
    if unsupported {
        "review_failed:unsupported_claim".to_string()
    } else {
        "review_failed".to_string()
    }
}
