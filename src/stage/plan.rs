//! Plan stage: turns a goal into a structured spec with success criteria.
//!
//! Implements: REQ-GOV-002/F-003
//!
//! Plan writes the spec fields and nothing else. It gathers no facts and
//! produces no output; both are outside its grants and would surface as
//! authority violations.

use async_trait::async_trait;

use super::{Stage, StageContext, StageError, StageKind, StageOutcome};
use crate::task::TaskSpec;

/// Phrases that make a success criterion uncheckable. A spec whose criteria
/// lean on these is flagged non-falsifiable and gets a warning in the trail.
const VAGUE_MARKERS: &[&str] = &["good", "great", "nice", "better", "high quality", "engaging"];

/// The Plan stage.
#[derive(Debug, Default)]
pub struct PlanStage;

#[async_trait]
impl Stage for PlanStage {
    fn kind(&self) -> StageKind {
        StageKind::Plan
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
        let goal = ctx.task().goal.clone();

        let deliverables = identify_deliverables(&goal);
        let success_criteria = define_success_criteria(&deliverables);
        let constraints = vec![
            "every claim cites an admitted provenance record".to_string(),
            "output stays within the spec's deliverables".to_string(),
        ];

        let estimated_steps = 4 + 2 * deliverables.len() as u32;
        let estimated_tool_calls = 2;
        let falsifiable = !success_criteria.is_empty()
            && success_criteria
                .iter()
                .all(|c| !VAGUE_MARKERS.iter().any(|m| c.to_lowercase().contains(m)));

        let spec = TaskSpec {
            deliverables: deliverables.clone(),
            success_criteria,
            constraints,
            estimated_steps,
            estimated_tool_calls,
            falsifiable,
        };
        ctx.set_spec(spec)?;

        let mut outcome = StageOutcome::done(format!(
            "spec written: {} deliverable(s), {} estimated step(s)",
            deliverables.len(),
            estimated_steps
        ));
        if !falsifiable {
            outcome = outcome.with_warning("success criteria are not all falsifiable");
        }
        Ok(outcome)
    }
}

fn identify_deliverables(goal: &str) -> Vec<String> {
    let lowered = goal.to_lowercase();
    let mut deliverables = Vec::new();
    for (marker, deliverable) in [
        ("summar", "written summary of the cited inputs"),
        ("report", "structured report"),
        ("email", "draft email body"),
        ("plan", "step-by-step plan"),
        ("list", "itemized list"),
        ("review", "written assessment"),
    ] {
        if lowered.contains(marker) {
            deliverables.push(deliverable.to_string());
        }
    }
    if deliverables.is_empty() {
        deliverables.push(format!("completed artifact for: {goal}"));
    }
    deliverables
}

fn define_success_criteria(deliverables: &[String]) -> Vec<String> {
    let mut criteria: Vec<String> = deliverables
        .iter()
        .map(|d| format!("output contains: {d}"))
        .collect();
    criteria.push("every non-trivial claim cites at least one provenance record".to_string());
    criteria
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::policy::PolicyStore;
    use crate::provenance::ProvenanceLedger;
    use crate::task::{Budget, ImpactFlags, RiskTier, TaskRecord};
    use std::sync::Arc;

    #[tokio::test]
    async fn plan_writes_a_falsifiable_spec() {
        let ledger = ProvenanceLedger::new();
        let policy = Arc::new(PolicyStore::new(
            crate::policy::loader::embedded_default_rules().unwrap(),
        ))
        .snapshot();
        let config = CoreConfig::default();
        let mut task = TaskRecord::new(
            "Summarize input",
            RiskTier::Low,
            ImpactFlags::default(),
            Budget {
                max_steps: 12,
                max_tool_calls: 5,
            },
            vec![],
        );

        let mut ctx = StageContext::new(StageKind::Plan, &mut task, &ledger, policy, &config);
        let outcome = PlanStage.run(&mut ctx).await.unwrap();
        assert!(outcome.warnings.is_empty());

        let spec = task.spec.expect("spec written");
        assert!(spec.falsifiable);
        assert!(spec.deliverables[0].contains("summary"));
        assert!(!spec.success_criteria.is_empty());
    }
}
