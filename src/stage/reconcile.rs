//! Reconcile stage: accept, retry, or escalate after review.
//!
//! Implements: REQ-GOV-002/F-007
//!
//! Reconcile reads the review verdict and decides what happens next. It
//! never re-runs Review and never touches content. Retries are bounded by
//! policy; exhausting them forces escalation, never a silent failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Stage, StageContext, StageError, StageKind, StageOutcome};
use crate::policy::RuleId;

/// Reconcile's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Disposition {
    /// Output accepted; proceed to Compliance
    Accept,
    /// Send the task back to Produce
    Retry,
    /// Retry budget exhausted; park for a human
    Escalate,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "ACCEPT"),
            Self::Retry => write!(f, "RETRY"),
            Self::Escalate => write!(f, "ESCALATE"),
        }
    }
}

/// The Reconcile stage.
#[derive(Debug, Default)]
pub struct ReconcileStage;

#[async_trait]
impl Stage for ReconcileStage {
    fn kind(&self) -> StageKind {
        StageKind::Reconcile
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
        let verdict = ctx
            .task()
            .review
            .clone()
            .ok_or(StageError::MissingPrerequisite {
                stage: StageKind::Reconcile,
                missing: "review verdict",
            })?;

        if verdict.passed {
            let mut outcome = StageOutcome::done("review approved output; accepted");
            outcome.disposition = Some(Disposition::Accept);
            return Ok(outcome);
        }

        let retries_used = ctx.task().produce_attempts.saturating_sub(1);
        let max_retries = ctx.config().retry.max_produce_retries;

        if retries_used < max_retries {
            let mut outcome = StageOutcome::done(format!(
                "review failed; retry {} of {} granted",
                retries_used + 1,
                max_retries
            ));
            outcome.disposition = Some(Disposition::Retry);
            Ok(outcome)
        } else {
            let reason = format!(
                "retry limit reached ({max_retries}); unresolved: {}",
                verdict.required_changes.join("; ")
            );
            let mut outcome = StageOutcome::done(reason.clone())
                .with_refs(vec![RuleId::from_raw("pol_conservative_ties")])
                .escalate(reason);
            outcome.disposition = Some(Disposition::Escalate);
            Ok(outcome)
        }
    }
}
