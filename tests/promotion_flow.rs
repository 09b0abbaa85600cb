//! Promotion ceremony end-to-end: repeated episodic patterns become
//! human-gated proposals, and only approval reaches the policy store.

use chrono::Utc;

use stagegate::audit::AuditDecision;
use stagegate::governor::{EscalationDecision, SubmitOptions};
use stagegate::policy::loader::embedded_default_rules;
use stagegate::promotion::ProposalStatus;
use stagegate::provenance::ProvenanceDraft;
use stagegate::stage::Collaborators;
use stagegate::{CoreConfig, GovernanceCore, GovernanceError, TaskStatus};

fn core() -> GovernanceCore {
    GovernanceCore::with_rules(
        CoreConfig::default(),
        embedded_default_rules().unwrap(),
        Collaborators::default(),
    )
    .unwrap()
}

fn source(name: &str) -> ProvenanceDraft {
    ProvenanceDraft {
        source: name.to_string(),
        timestamp: Utc::now(),
        confidence: 0.8,
        content_ref: "input".to_string(),
    }
}

/// Drives a HIGH-tier task to escalation and rejects it, leaving an episode
/// with the `escalation_rejected` lesson behind.
async fn run_rejected_escalation(core: &GovernanceCore, goal: &str) {
    let task_id = core
        .submit(
            goal,
            vec![source("a"), source("b"), source("c")],
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let task = core.wait_until_settled(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Escalated);
    core.resolve_escalation(
        &task_id,
        EscalationDecision::Reject,
        "operator",
        Some("declined".to_string()),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn repeated_patterns_become_proposals_and_approval_promotes_them() {
    let core = core();

    // One occurrence is not a pattern.
    run_rejected_escalation(&core, "Wire the vendor payment").await;
    assert!(core.scan_promotions().unwrap().is_empty());

    // Two distinct tasks make the pattern promotable.
    run_rejected_escalation(&core, "Transfer the deposit").await;
    let drafted = core.scan_promotions().unwrap();
    assert_eq!(drafted.len(), 1);
    let proposal = &drafted[0];
    assert_eq!(proposal.pattern, "escalation_rejected");
    assert_eq!(proposal.evidence.len(), 2);
    assert!(!proposal.rationale.is_empty());
    assert!(!proposal.impact.is_empty());
    assert!(!proposal.rollback.is_empty());

    // Round-trip: the promoted rule text matches the draft exactly.
    let before = core.policy().snapshot().rules().len();
    let rule = core.approve_proposal(&proposal.id, "operator").unwrap();
    assert_eq!(rule.text, proposal.rule_text);
    let snapshot = core.policy().snapshot();
    assert_eq!(snapshot.rules().len(), before + 1);
    assert_eq!(snapshot.get(&rule.id).unwrap().text, proposal.rule_text);

    assert_eq!(
        core.list_proposals()[0].status,
        ProposalStatus::Approved
    );
}

#[tokio::test]
async fn approval_token_is_mandatory_and_rejection_keeps_the_store_clean() {
    let core = core();
    run_rejected_escalation(&core, "Wire the vendor payment").await;
    run_rejected_escalation(&core, "Transfer the deposit").await;
    let drafted = core.scan_promotions().unwrap();
    let proposal = &drafted[0];
    let before = core.policy().snapshot().rules().len();

    // A blank approver is no approval.
    let err = core.approve_proposal(&proposal.id, "  ").unwrap_err();
    assert!(matches!(err, GovernanceError::ApprovalRequired { .. }));
    assert_eq!(core.policy().snapshot().rules().len(), before);

    // Rejection records its reason and never touches the store.
    core.reject_proposal(&proposal.id, "pattern too coarse").unwrap();
    assert_eq!(core.policy().snapshot().rules().len(), before);
    assert_eq!(
        core.list_proposals()[0].status,
        ProposalStatus::Rejected
    );
    assert!(core
        .export_audit(&Default::default())
        .iter()
        .any(|e| e.decision == AuditDecision::ProposalRejected
            && e.rationale.contains("pattern too coarse")));
}
