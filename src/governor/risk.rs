//! Deterministic risk assessment.
//!
//! Implements: REQ-GOV-001/F-003
//!
//! Assessment is pure rule evaluation over the policy snapshot and the
//! submission: no model calls, no randomness, same inputs → same tier.
//! Signals combine conservatively: the tier is the maximum any fired
//! signal implies, a policy conflict forces HIGH outright, and a projected
//! budget breach escalates one tier above the otherwise-computed result.
//! When several signals fire, the configured precedence decides which one
//! names the audit rationale.

use crate::config::{CoreConfig, RiskSignal};
use crate::policy::{PolicySnapshot, RuleId};
use crate::stage::sequence_for;
use crate::task::{Budget, ImpactFlags, RiskTier};

/// A detected conflict between the goal and policy invariants.
#[derive(Debug, Clone)]
pub struct ConflictFinding {
    /// Rules in conflict
    pub rule_refs: Vec<RuleId>,
    /// Why
    pub reason: String,
    /// True when the conflict is itself the submission's blocker (the goal
    /// asks for something no tier may run, e.g. mutating the rule store)
    pub blocks_submission: bool,
}

/// Outcome of one assessment.
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    /// The assigned tier
    pub tier: RiskTier,
    /// Signal that won the tie-break, if any fired
    pub winning_signal: Option<RiskSignal>,
    /// Audit rationale for the tier decision
    pub rationale: String,
    /// Rules the assessment applied
    pub policy_refs: Vec<RuleId>,
    /// Non-blocking conflict, if one was detected
    pub conflict: Option<ConflictFinding>,
}

/// Scans the goal for conflicts with policy invariants.
///
/// A goal that asks to mutate the rule store conflicts with the append-only
/// invariant and blocks the submission outright; policy changes go through
/// the promotion ceremony, not task routing. A goal that asks to bypass
/// review or approval conflicts with the capability-bound invariant and
/// forces the HIGH tier instead.
#[must_use]
pub fn detect_conflict(goal: &str) -> Option<ConflictFinding> {
    let lowered = goal.to_lowercase();

    let mentions_rules = ["policy", "rule set", "invariant", "rule store"]
        .iter()
        .any(|m| lowered.contains(m));
    let mentions_mutation = ["modify", "edit", "delete", "rewrite", "remove"]
        .iter()
        .any(|m| lowered.contains(m));
    if mentions_rules && mentions_mutation {
        return Some(ConflictFinding {
            rule_refs: vec![RuleId::from_raw("pol_no_store_mutation")],
            reason: "goal requests a rule-store mutation; changes pass the promotion ceremony only"
                .to_string(),
            blocks_submission: true,
        });
    }

    let bypass = ["skip review", "skip validation", "without approval", "bypass"]
        .iter()
        .any(|m| lowered.contains(m));
    if bypass {
        return Some(ConflictFinding {
            rule_refs: vec![RuleId::from_raw("pol_capability_bounds")],
            reason: "goal requests bypassing a mandatory gate".to_string(),
            blocks_submission: false,
        });
    }

    None
}

/// Assesses a goal against the policy snapshot.
///
/// Implements: REQ-GOV-001/F-003
#[must_use]
pub fn assess(
    goal: &str,
    impact: ImpactFlags,
    config: &CoreConfig,
    policy: &PolicySnapshot,
    budget: Budget,
) -> RiskAssessment {
    let lowered = goal.to_lowercase();
    let mut fired: Vec<(RiskSignal, RiskTier, String, Vec<RuleId>)> = Vec::new();

    // Irreversible / financial / legal impact: declared markers are
    // authoritative; the high-keyword table catches undeclared ones.
    let keyword_hit = config
        .risk
        .high_keywords
        .iter()
        .find(|kw| lowered.contains(kw.as_str()));
    if impact.any() || keyword_hit.is_some() {
        let detail = if impact.any() {
            "declared impact markers".to_string()
        } else {
            format!("impact verb '{}'", keyword_hit.expect("checked above"))
        };
        fired.push((
            RiskSignal::IrreversibleImpact,
            RiskTier::High,
            format!("irreversible/financial impact ({detail})"),
            vec![RuleId::from_raw("pol_irreversible_needs_human")],
        ));
    }

    // Policy conflict forces HIGH regardless of other signals.
    let conflict = detect_conflict(goal);
    if let Some(finding) = &conflict {
        fired.push((
            RiskSignal::PolicyConflict,
            RiskTier::High,
            format!("policy conflict: {}", finding.reason),
            finding.rule_refs.clone(),
        ));
    }

    // Keyword heuristic score.
    if let Some(kw) = config
        .risk
        .medium_keywords
        .iter()
        .find(|kw| lowered.contains(kw.as_str()))
    {
        fired.push((
            RiskSignal::Heuristic,
            RiskTier::Medium,
            format!("medium-risk verb '{kw}'"),
            vec![RuleId::from_raw("pol_action_verbs")],
        ));
    }

    // Conservative combination: the strongest fired tier wins.
    let mut tier = fired
        .iter()
        .map(|(_, t, _, _)| *t)
        .max()
        .unwrap_or(RiskTier::Low);

    // Projected budget breach escalates one tier, capped at HIGH.
    let projected_steps =
        sequence_for(tier).len() as u32 + config.retry.max_produce_retries;
    let projected_tool_calls = 2;
    if projected_steps > budget.max_steps || projected_tool_calls > budget.max_tool_calls {
        fired.push((
            RiskSignal::BudgetBreach,
            tier.escalate_one(),
            format!(
                "projected use ({projected_steps} steps, {projected_tool_calls} tool calls) breaches budget ({}/{})",
                budget.max_steps, budget.max_tool_calls
            ),
            vec![RuleId::from_raw("pol_budget_discipline")],
        ));
        tier = tier.escalate_one();
    }

    // Tie-break: the configured precedence names the rationale.
    let winning = config
        .risk
        .precedence
        .iter()
        .find(|signal| fired.iter().any(|(s, _, _, _)| s == *signal))
        .copied();

    let mut policy_refs: Vec<RuleId> = fired.iter().flat_map(|(_, _, _, r)| r.clone()).collect();
    policy_refs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    policy_refs.dedup();
    policy_refs.retain(|id| policy.get(id).is_some());

    let rationale = match winning {
        Some(signal) => {
            let detail = fired
                .iter()
                .find(|(s, _, _, _)| *s == signal)
                .map(|(_, _, d, _)| d.clone())
                .unwrap_or_default();
            format!("tier {tier} via {signal}: {detail}")
        }
        None => format!("tier {tier}: no risk signals fired"),
    };

    RiskAssessment {
        tier,
        winning_signal: winning,
        rationale,
        policy_refs,
        conflict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyStore;

    fn snapshot() -> std::sync::Arc<PolicySnapshot> {
        PolicyStore::new(crate::policy::loader::embedded_default_rules().unwrap()).snapshot()
    }

    fn budget() -> Budget {
        Budget {
            max_steps: 12,
            max_tool_calls: 5,
        }
    }

    #[test]
    fn benign_goal_is_low() {
        let config = CoreConfig::default();
        let assessment = assess(
            "Summarize input",
            ImpactFlags::default(),
            &config,
            &snapshot(),
            budget(),
        );
        assert_eq!(assessment.tier, RiskTier::Low);
        assert!(assessment.winning_signal.is_none());
    }

    #[test]
    fn financial_verbs_force_high() {
        let config = CoreConfig::default();
        let assessment = assess(
            "Wire $5,000 payment",
            ImpactFlags::default(),
            &config,
            &snapshot(),
            budget(),
        );
        assert_eq!(assessment.tier, RiskTier::High);
        assert_eq!(
            assessment.winning_signal,
            Some(RiskSignal::IrreversibleImpact)
        );
        assert!(assessment.rationale.contains("impact verb"));
    }

    #[test]
    fn conflict_dominates_tier_regardless_of_other_signals() {
        let config = CoreConfig::default();
        let assessment = assess(
            "Compose the digest but skip review",
            ImpactFlags::default(),
            &config,
            &snapshot(),
            budget(),
        );
        assert_eq!(assessment.tier, RiskTier::High);
        let conflict = assessment.conflict.expect("conflict detected");
        assert!(!conflict.blocks_submission);
    }

    #[test]
    fn store_mutation_goals_block_submission() {
        let finding = detect_conflict("Please modify the policy rule set").unwrap();
        assert!(finding.blocks_submission);
        assert_eq!(finding.rule_refs[0].as_str(), "pol_no_store_mutation");
    }

    #[test]
    fn budget_breach_escalates_one_tier() {
        let config = CoreConfig::default();
        // Tight budget: medium goal escalates to high.
        let assessment = assess(
            "Update the calendar",
            ImpactFlags::default(),
            &config,
            &snapshot(),
            Budget {
                max_steps: 3,
                max_tool_calls: 5,
            },
        );
        assert_eq!(assessment.tier, RiskTier::High);

        // Low goal escalates to medium only.
        let assessment = assess(
            "Summarize input",
            ImpactFlags::default(),
            &config,
            &snapshot(),
            Budget {
                max_steps: 3,
                max_tool_calls: 5,
            },
        );
        assert_eq!(assessment.tier, RiskTier::Medium);
        assert_eq!(assessment.winning_signal, Some(RiskSignal::BudgetBreach));
    }

    #[test]
    fn declared_markers_beat_keyword_absence() {
        let config = CoreConfig::default();
        let assessment = assess(
            "Summarize input",
            ImpactFlags {
                irreversible: true,
                ..ImpactFlags::default()
            },
            &config,
            &snapshot(),
            budget(),
        );
        assert_eq!(assessment.tier, RiskTier::High);
        assert!(assessment.rationale.contains("declared impact markers"));
    }

    #[test]
    fn all_assessment_refs_resolve_in_the_snapshot() {
        let config = CoreConfig::default();
        let snap = snapshot();
        for goal in [
            "Summarize input",
            "Wire $5,000 payment",
            "Update the calendar without approval",
        ] {
            let assessment = assess(goal, ImpactFlags::default(), &config, &snap, budget());
            assert!(snap.resolves_all(&assessment.policy_refs), "goal: {goal}");
        }
    }
}
