//! Review stage: verifies output against spec and provenance.
//!
//! Implements: REQ-GOV-002/F-006, REQ-LED-001/F-003
//!
//! Review writes a pass/fail verdict with required changes. It never edits
//! the output. Checks, in order: every citation resolves in the ledger (an
//! unresolved citation is an unsupported claim and fails the verdict), the
//! output covers the spec's deliverables, and the backing record set is
//! examined for source dominance and staleness (both recorded, neither
//! blocking on its own).

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{Stage, StageContext, StageError, StageKind, StageOutcome};
use crate::policy::RuleId;
use crate::provenance::ProvenanceLedger;
use crate::task::ReviewVerdict;

/// The Review stage.
#[derive(Debug, Default)]
pub struct ReviewStage;

#[async_trait]
impl Stage for ReviewStage {
    fn kind(&self) -> StageKind {
        StageKind::Review
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
        let output = ctx
            .task()
            .output
            .clone()
            .ok_or(StageError::MissingPrerequisite {
                stage: StageKind::Review,
                missing: "produced output",
            })?;
        let spec = ctx
            .task()
            .spec
            .clone()
            .ok_or(StageError::MissingPrerequisite {
                stage: StageKind::Review,
                missing: "task spec",
            })?;

        let mut notes = Vec::new();
        let mut required_changes = Vec::new();
        let mut warnings = Vec::new();
        let mut policy_refs = vec![RuleId::from_raw("pol_provenance_required")];

        // Every citation must trace to a ledger record.
        let mut cited = Vec::new();
        for citation in &output.citations {
            match ctx.record(citation) {
                Some(record) => cited.push(record),
                None => {
                    required_changes.push(format!(
                        "unsupported claim: citation '{citation}' resolves to no ledger record"
                    ));
                }
            }
        }

        // Output with no citations at all supports nothing it says.
        if output.citations.is_empty() {
            required_changes
                .push("output cites no provenance records for its claims".to_string());
        }

        if output.content.trim().is_empty() {
            required_changes.push("output is empty".to_string());
        }

        for deliverable in &spec.deliverables {
            if !output.content.contains(deliverable.as_str()) {
                required_changes.push(format!("missing deliverable: {deliverable}"));
            }
        }

        // Dominance: recorded, not blocking.
        let share = ctx.config().provenance.dominance_share;
        if let Some(report) = ProvenanceLedger::dominance(&cited, share) {
            if report.dominant {
                warnings.push(format!(
                    "source dominance: '{}' supplies {:.0}% of backing records",
                    report.source,
                    report.share * 100.0
                ));
            }
        }

        // Single-source confidence cap.
        if !cited.is_empty() && ProvenanceLedger::distinct_sources(&cited) == 1 {
            notes.push("single-source backing; output treated as low confidence".to_string());
            policy_refs.push(RuleId::from_raw("pol_single_source_cap"));
        }

        // Stale records are flagged for the trail.
        let stale_after = Duration::days(ctx.config().provenance.stale_after_days);
        let now = Utc::now();
        for record in &cited {
            if record.is_stale(stale_after, now) {
                notes.push(format!("stale source: '{}' ({})", record.source, record.id));
            }
        }

        let passed = required_changes.is_empty();
        if passed && notes.is_empty() {
            notes.push("meets spec deliverables with resolved citations".to_string());
        }

        let summary = if passed {
            format!("review passed with {} note(s)", notes.len())
        } else {
            format!("review failed: {}", required_changes.join("; "))
        };

        ctx.set_review(ReviewVerdict {
            passed,
            notes,
            required_changes,
            decided_at: Utc::now(),
        })?;

        let mut outcome = StageOutcome::done(summary).with_refs(policy_refs);
        for warning in warnings {
            outcome = outcome.with_warning(warning);
        }
        Ok(outcome)
    }
}
