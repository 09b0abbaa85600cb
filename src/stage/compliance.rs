//! Compliance stage: APPROVE / HOLD / REJECT for outbound actions.
//!
//! Implements: REQ-GOV-002/F-008
//!
//! The gate scans the goal and produced output for legal, financial,
//! contractual, and public-statement exposure, and re-verifies the output's
//! integrity digest. Exposure holds for human review unless an approved
//! human resolution is already on record for the task; a digest mismatch is
//! an outright reject. Compliance originates nothing.

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

use super::{Stage, StageContext, StageError, StageKind, StageOutcome};
use crate::policy::RuleId;
use crate::task::{ComplianceOutcome, ComplianceVerdict};

const LEGAL_MARKERS: &[&str] = &[
    "legal", "lawsuit", "regulation", "gdpr", "hipaa", "privacy", "pii",
];
const FINANCIAL_MARKERS: &[&str] = &[
    "money", "payment", "invoice", "tax", "bank", "wire", "transfer", "pay",
];
const CONTRACTUAL_MARKERS: &[&str] = &["contract", "agreement", "terms", "sign", "commitment"];
const PUBLIC_MARKERS: &[&str] = &["publish", "post", "tweet", "announce", "press release"];

fn contains_any(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| text.contains(m))
}

/// The Compliance stage.
#[derive(Debug, Default)]
pub struct ComplianceStage;

#[async_trait]
impl Stage for ComplianceStage {
    fn kind(&self) -> StageKind {
        StageKind::Compliance
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
        let output = ctx
            .task()
            .output
            .clone()
            .ok_or(StageError::MissingPrerequisite {
                stage: StageKind::Compliance,
                missing: "produced output",
            })?;

        let scanned = format!(
            "{} {}",
            ctx.task().goal.to_lowercase(),
            output.content.to_lowercase()
        );
        let human_approved = ctx
            .task()
            .escalation
            .as_ref()
            .and_then(|e| e.resolution.as_ref())
            .is_some_and(|r| r.approved);

        let mut hold_reasons = Vec::new();
        let mut reject_reasons = Vec::new();
        let mut policy_refs = vec![RuleId::from_raw("pol_outbound_exposure")];

        // Integrity: the digest written at Produce must still match.
        let mut hasher = Sha256::new();
        hasher.update(output.content.as_bytes());
        for citation in &output.citations {
            hasher.update(citation.as_str().as_bytes());
        }
        if format!("{:x}", hasher.finalize()) != output.digest {
            reject_reasons.push("output integrity digest mismatch".to_string());
        }

        if contains_any(&scanned, LEGAL_MARKERS) {
            hold_reasons.push("legal exposure detected".to_string());
        }
        if contains_any(&scanned, FINANCIAL_MARKERS) {
            hold_reasons.push("financial action requires explicit human approval".to_string());
        }
        if contains_any(&scanned, CONTRACTUAL_MARKERS) {
            hold_reasons.push("contractual commitment requires explicit human approval".to_string());
        }
        if contains_any(&scanned, PUBLIC_MARKERS) {
            hold_reasons.push("public statement requires explicit human approval".to_string());
        }
        if ctx.task().impact.irreversible {
            policy_refs.push(RuleId::from_raw("pol_irreversible_needs_human"));
            hold_reasons.push("irreversible action requires explicit human approval".to_string());
        }

        let (outcome_kind, reasons) = if !reject_reasons.is_empty() {
            reject_reasons.extend(hold_reasons);
            (ComplianceOutcome::Reject, reject_reasons)
        } else if !hold_reasons.is_empty() && !human_approved {
            (ComplianceOutcome::Hold, hold_reasons)
        } else if !hold_reasons.is_empty() {
            // Exposure present, but a human already approved this task.
            let mut reasons = vec!["human approval on record".to_string()];
            reasons.extend(hold_reasons);
            (ComplianceOutcome::Approve, reasons)
        } else {
            (
                ComplianceOutcome::Approve,
                vec!["all compliance checks passed".to_string()],
            )
        };

        ctx.set_compliance(ComplianceVerdict {
            outcome: outcome_kind,
            reasons: reasons.clone(),
            decided_at: Utc::now(),
        })?;

        let summary = format!("compliance verdict {outcome_kind}: {}", reasons.join("; "));
        let mut outcome = StageOutcome::done(summary).with_refs(policy_refs);
        if outcome_kind == ComplianceOutcome::Hold {
            outcome = outcome.escalate(format!("compliance hold: {}", reasons.join("; ")));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::policy::PolicyStore;
    use crate::provenance::ProvenanceLedger;
    use crate::task::{Budget, ImpactFlags, RiskTier, TaskRecord, TaskStatus};
    use std::sync::Arc;

    fn harness(goal: &str) -> (ProvenanceLedger, Arc<crate::policy::PolicySnapshot>, CoreConfig, TaskRecord)
    {
        let ledger = ProvenanceLedger::new();
        let policy = Arc::new(PolicyStore::new(
            crate::policy::loader::embedded_default_rules().unwrap(),
        ))
        .snapshot();
        let config = CoreConfig::default();
        let task = TaskRecord::new(
            goal,
            RiskTier::Low,
            ImpactFlags::default(),
            Budget {
                max_steps: 12,
                max_tool_calls: 5,
            },
            vec![],
        );
        (ledger, policy, config, task)
    }

    async fn write_output(task: &mut TaskRecord, ledger: &ProvenanceLedger, policy: Arc<crate::policy::PolicySnapshot>, config: &CoreConfig, content: &str) {
        let mut ctx = StageContext::new(StageKind::Produce, task, ledger, policy, config);
        ctx.set_output(content.to_string(), vec![]).unwrap();
    }

    #[tokio::test]
    async fn clean_output_is_approved() {
        let (ledger, policy, config, mut task) = harness("Summarize input");
        write_output(&mut task, &ledger, policy.clone(), &config, "a plain summary").await;

        let mut ctx = StageContext::new(StageKind::Compliance, &mut task, &ledger, policy, &config);
        let outcome = ComplianceStage.run(&mut ctx).await.unwrap();
        assert!(outcome.escalation.is_none());
        assert_eq!(
            task.compliance.unwrap().outcome,
            ComplianceOutcome::Approve
        );
    }

    #[tokio::test]
    async fn financial_exposure_holds_without_prior_approval() {
        let (ledger, policy, config, mut task) = harness("Wire the payment");
        write_output(&mut task, &ledger, policy.clone(), &config, "wire instructions").await;

        let mut ctx = StageContext::new(StageKind::Compliance, &mut task, &ledger, policy, &config);
        let outcome = ComplianceStage.run(&mut ctx).await.unwrap();
        assert!(outcome.escalation.is_some());
        assert_eq!(task.compliance.unwrap().outcome, ComplianceOutcome::Hold);
    }

    #[tokio::test]
    async fn prior_human_approval_satisfies_the_hold() {
        let (ledger, policy, config, mut task) = harness("Wire the payment");
        task.transition(TaskStatus::Running, None).unwrap();
        task.park("human gate", None, StageKind::Produce).unwrap();
        task.resolve_escalation(true, "operator", None).unwrap();
        write_output(&mut task, &ledger, policy.clone(), &config, "wire instructions").await;

        let mut ctx = StageContext::new(StageKind::Compliance, &mut task, &ledger, policy, &config);
        let outcome = ComplianceStage.run(&mut ctx).await.unwrap();
        assert!(outcome.escalation.is_none());
        let verdict = task.compliance.unwrap();
        assert_eq!(verdict.outcome, ComplianceOutcome::Approve);
        assert!(verdict.reasons[0].contains("human approval"));
    }

    #[tokio::test]
    async fn tampered_output_is_rejected() {
        let (ledger, policy, config, mut task) = harness("Summarize input");
        write_output(&mut task, &ledger, policy.clone(), &config, "summary").await;
        task.output.as_mut().unwrap().content = "tampered".to_string();

        let mut ctx = StageContext::new(StageKind::Compliance, &mut task, &ledger, policy, &config);
        ComplianceStage.run(&mut ctx).await.unwrap();
        assert_eq!(task.compliance.unwrap().outcome, ComplianceOutcome::Reject);
    }
}
