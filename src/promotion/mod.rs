//! Promotion pipeline: episodic patterns → human-gated policy rules.
//!
//! Implements: REQ-PRM-001 (Promotion Ceremony)
//!
//! `scan` drafts proposals from repeated episodic outcomes and never writes
//! the policy store. `approve`, given a valid human approval token, is the
//! only path by which the store gains a rule. Proposals live between
//! drafting and disposition; pruning always records a reason in the audit
//! trail, never a silent drop.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{AuditDecision, AuditLog};
use crate::config::PromotionConfig;
use crate::episodic::EpisodicLog;
use crate::error::GovernanceError;
use crate::policy::{PolicyRule, PolicyStore, RuleKind};
use crate::task::TaskId;

// ============================================================================
// Identifiers & tokens
// ============================================================================

/// Identifier of a promotion proposal (`prop_` prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(String);

impl ProposalId {
    #[must_use]
    pub fn new() -> Self {
        Self(format!("prop_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Wraps a known ID.
    #[must_use]
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Evidence that a human approved a promotion. Construction validates the
/// approver identity; an absent or invalid token fails `approve` with an
/// approval-required error.
#[derive(Debug, Clone)]
pub struct ApprovalToken {
    approver: String,
}

impl ApprovalToken {
    /// Creates a token for a named approver. Returns `None` for an empty
    /// identity; an anonymous approval is no approval.
    #[must_use]
    pub fn new(approver: impl Into<String>) -> Option<Self> {
        let approver = approver.into();
        if approver.trim().is_empty() {
            None
        } else {
            Some(Self { approver })
        }
    }

    /// The approver's identity.
    #[must_use]
    pub fn approver(&self) -> &str {
        &self.approver
    }
}

// ============================================================================
// Proposals
// ============================================================================

/// Lifecycle status of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProposalStatus {
    /// Awaiting human disposition
    Pending,
    /// Approved; its rule is in the policy store
    Approved,
    /// Rejected by a human
    Rejected,
    /// Expired before disposition
    Expired,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Approved => write!(f, "APPROVED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// A candidate policy rule with its supporting evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionProposal {
    /// Proposal identifier
    pub id: ProposalId,
    /// Pattern key the scan matched
    pub pattern: String,
    /// Kind of the candidate rule
    pub rule_kind: RuleKind,
    /// Drafted rule text, promoted verbatim on approval
    pub rule_text: String,
    /// Tasks whose episodes evidence the pattern (≥ the configured minimum)
    pub evidence: Vec<TaskId>,
    /// Why the pattern is worth promoting
    pub rationale: String,
    /// What changes if the rule is adopted
    pub impact: String,
    /// How to back the rule out (a superseding rule; the store is append-only)
    pub rollback: String,
    /// Current status
    pub status: ProposalStatus,
    /// Who decided, once decided
    pub decided_by: Option<String>,
    /// When the proposal was drafted
    pub created_at: DateTime<Utc>,
    /// When a pending proposal expires
    pub expires_at: DateTime<Utc>,
}

/// Errors raised by promotion queue operations.
#[derive(Debug, Error)]
pub enum PromotionError {
    /// Unknown proposal.
    #[error("proposal '{proposal_id}' not found")]
    NotFound {
        /// The missing ID
        proposal_id: ProposalId,
    },

    /// The proposal already has a disposition.
    #[error("proposal '{proposal_id}' already decided ({status})")]
    AlreadyDecided {
        /// The proposal
        proposal_id: ProposalId,
        /// Its status
        status: ProposalStatus,
    },

    /// The proposal expired before disposition.
    #[error("proposal '{proposal_id}' expired before disposition")]
    Expired {
        /// The proposal
        proposal_id: ProposalId,
    },
}

// ============================================================================
// Queue
// ============================================================================

/// Append-managed queue of promotion proposals.
pub struct PromotionQueue {
    config: PromotionConfig,
    policy: Arc<PolicyStore>,
    audit: Arc<AuditLog>,
    proposals: DashMap<ProposalId, Arc<PromotionProposal>>,
    order: Mutex<Vec<ProposalId>>,
    seen_patterns: DashMap<String, ProposalId>,
}

impl fmt::Debug for PromotionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromotionQueue")
            .field("proposals", &self.proposals.len())
            .finish()
    }
}

impl PromotionQueue {
    /// Creates a queue over the policy store and audit trail.
    #[must_use]
    pub fn new(config: PromotionConfig, policy: Arc<PolicyStore>, audit: Arc<AuditLog>) -> Self {
        Self {
            config,
            policy,
            audit,
            proposals: DashMap::new(),
            order: Mutex::new(Vec::new()),
            seen_patterns: DashMap::new(),
        }
    }

    /// Scans episodic history for promotable patterns and drafts proposals.
    ///
    /// Implements: REQ-PRM-001/F-001
    ///
    /// A pattern is promotable when it occurs in at least the configured
    /// minimum of distinct task episodes and no proposal for it exists yet.
    /// Drafting never touches the policy store.
    pub fn scan(&self, episodic: &EpisodicLog) -> Result<Vec<Arc<PromotionProposal>>, GovernanceError> {
        let mut occurrences: std::collections::HashMap<String, Vec<TaskId>> =
            std::collections::HashMap::new();
        for episode in episodic.all() {
            for lesson in &episode.lessons {
                let tasks = occurrences.entry(lesson.clone()).or_default();
                if !tasks.contains(&episode.task_id) {
                    tasks.push(episode.task_id.clone());
                }
            }
        }

        let mut drafted = Vec::new();
        let mut patterns: Vec<_> = occurrences.into_iter().collect();
        patterns.sort_by(|a, b| a.0.cmp(&b.0));
        for (pattern, evidence) in patterns {
            if evidence.len() < self.config.min_occurrences {
                continue;
            }
            if self.seen_patterns.contains_key(&pattern) {
                continue;
            }

            let count = evidence.len();
            let proposal = Arc::new(PromotionProposal {
                id: ProposalId::new(),
                pattern: pattern.clone(),
                rule_kind: RuleKind::Heuristic,
                rule_text: draft_rule_text(&pattern, count),
                evidence,
                rationale: format!(
                    "pattern '{pattern}' observed in {count} distinct task episodes"
                ),
                impact: "risk assessment and review gain a standing signal for similar tasks"
                    .to_string(),
                rollback: "append a superseding rule; the store is append-only".to_string(),
                status: ProposalStatus::Pending,
                decided_by: None,
                created_at: Utc::now(),
                expires_at: Utc::now() + Duration::days(self.config.proposal_ttl_days),
            });

            self.audit.append(
                None,
                None,
                AuditDecision::ProposalDrafted,
                format!("proposal '{}' drafted for pattern '{pattern}'", proposal.id),
                vec![],
            )?;

            self.seen_patterns.insert(pattern, proposal.id.clone());
            self.order
                .lock()
                .expect("proposal order lock poisoned")
                .push(proposal.id.clone());
            self.proposals.insert(proposal.id.clone(), proposal.clone());
            drafted.push(proposal);
        }
        Ok(drafted)
    }

    /// Lists proposals in drafting order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<PromotionProposal>> {
        let order = self.order.lock().expect("proposal order lock poisoned");
        order
            .iter()
            .filter_map(|id| self.proposals.get(id).map(|p| p.clone()))
            .collect()
    }

    /// Looks up one proposal.
    pub fn get(&self, id: &ProposalId) -> Result<Arc<PromotionProposal>, PromotionError> {
        self.proposals
            .get(id)
            .map(|p| p.clone())
            .ok_or_else(|| PromotionError::NotFound {
                proposal_id: id.clone(),
            })
    }

    /// Applies a proposal with a human approval token.
    ///
    /// Implements: REQ-PRM-001/F-004, the only path by which the policy
    /// store gains a rule. The promoted rule's text matches the proposal's
    /// drafted text exactly.
    pub fn approve(
        &self,
        id: &ProposalId,
        token: Option<&ApprovalToken>,
    ) -> Result<Arc<PolicyRule>, GovernanceError> {
        let token = token.ok_or_else(|| GovernanceError::ApprovalRequired {
            proposal_id: id.clone(),
        })?;

        let proposal = self.get(id)?;
        self.check_pending(&proposal)?;

        let rule = self
            .policy
            .append(proposal.rule_kind, proposal.rule_text.clone())?;

        let mut updated = (*proposal).clone();
        updated.status = ProposalStatus::Approved;
        updated.decided_by = Some(token.approver().to_string());
        self.proposals.insert(id.clone(), Arc::new(updated));

        self.audit.append(
            None,
            None,
            AuditDecision::ProposalApproved,
            format!(
                "proposal '{id}' approved by '{}'; rule '{}' promoted",
                token.approver(),
                rule.id
            ),
            vec![rule.id.clone()],
        )?;
        Ok(rule)
    }

    /// Rejects a proposal with a recorded reason.
    pub fn reject(&self, id: &ProposalId, reason: &str) -> Result<(), GovernanceError> {
        let proposal = self.get(id)?;
        self.check_pending(&proposal)?;

        let mut updated = (*proposal).clone();
        updated.status = ProposalStatus::Rejected;
        self.proposals.insert(id.clone(), Arc::new(updated));

        self.audit.append(
            None,
            None,
            AuditDecision::ProposalRejected,
            format!("proposal '{id}' rejected: {reason}"),
            vec![],
        )?;
        Ok(())
    }

    /// Expires pending proposals past their TTL. Each expiry is audited;
    /// nothing is silently dropped.
    pub fn prune_expired(&self) -> Result<usize, GovernanceError> {
        let now = Utc::now();
        let overdue: Vec<Arc<PromotionProposal>> = self
            .list()
            .into_iter()
            .filter(|p| p.status == ProposalStatus::Pending && now > p.expires_at)
            .collect();

        let mut pruned = 0;
        for proposal in overdue {
            let mut updated = (*proposal).clone();
            updated.status = ProposalStatus::Expired;
            self.proposals
                .insert(proposal.id.clone(), Arc::new(updated));
            self.audit.append(
                None,
                None,
                AuditDecision::ProposalPruned,
                format!(
                    "proposal '{}' expired {} day(s) after drafting without disposition",
                    proposal.id, self.config.proposal_ttl_days
                ),
                vec![],
            )?;
            pruned += 1;
        }
        Ok(pruned)
    }

    /// Counts proposals by status.
    #[must_use]
    pub fn summary(&self) -> std::collections::HashMap<ProposalStatus, usize> {
        let mut counts = std::collections::HashMap::new();
        for proposal in self.list() {
            *counts.entry(proposal.status).or_insert(0) += 1;
        }
        counts
    }

    fn check_pending(&self, proposal: &PromotionProposal) -> Result<(), PromotionError> {
        if proposal.status != ProposalStatus::Pending {
            return Err(PromotionError::AlreadyDecided {
                proposal_id: proposal.id.clone(),
                status: proposal.status,
            });
        }
        if Utc::now() > proposal.expires_at {
            return Err(PromotionError::Expired {
                proposal_id: proposal.id.clone(),
            });
        }
        Ok(())
    }
}

fn draft_rule_text(pattern: &str, count: usize) -> String {
    match pattern {
        "review_failed:unsupported_claim" => format!(
            "Outputs have cited unadmitted records in {count} recent tasks; \
             weight citation verification ahead of content checks during review."
        ),
        p if p.starts_with("budget_halted") => format!(
            "Budget halts recurred in {count} recent tasks; \
             treat projected resource use near the quota as a medium-risk signal."
        ),
        p if p.starts_with("compliance:hold") => format!(
            "Compliance holds recurred in {count} recent tasks; \
             treat outbound exposure in similar goals as high-risk at assessment."
        ),
        _ => format!(
            "Pattern '{pattern}' recurred in {count} recent task episodes; \
             treat it as a standing signal when assessing similar tasks."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episodic::EpisodeRecord;
    use crate::stage::StageKind;
    use crate::task::{RiskTier, TaskStatus};

    fn queue() -> (PromotionQueue, Arc<PolicyStore>, Arc<AuditLog>, EpisodicLog) {
        let policy = Arc::new(PolicyStore::new(
            crate::policy::loader::embedded_default_rules().unwrap(),
        ));
        let audit = Arc::new(AuditLog::new());
        let queue = PromotionQueue::new(PromotionConfig::default(), policy.clone(), audit.clone());
        (queue, policy, audit, EpisodicLog::new())
    }

    fn episode(task: &str, lessons: &[&str]) -> EpisodeRecord {
        EpisodeRecord {
            task_id: TaskId::from_raw(task),
            timestamp: Utc::now(),
            risk_tier: RiskTier::Medium,
            outcome: TaskStatus::Rejected,
            stages_run: vec![StageKind::Plan, StageKind::Produce, StageKind::Review],
            lessons: lessons.iter().map(|s| s.to_string()).collect(),
            duration_ms: 5,
        }
    }

    #[test]
    fn scan_needs_the_minimum_occurrences() {
        let (queue, _, _, episodic) = queue();
        episodic
            .append(episode("task_1", &["review_failed:unsupported_claim"]))
            .unwrap();
        assert!(queue.scan(&episodic).unwrap().is_empty());

        episodic
            .append(episode("task_2", &["review_failed:unsupported_claim"]))
            .unwrap();
        let drafted = queue.scan(&episodic).unwrap();
        assert_eq!(drafted.len(), 1);
        assert_eq!(drafted[0].evidence.len(), 2);

        // Re-scanning does not duplicate the proposal.
        assert!(queue.scan(&episodic).unwrap().is_empty());
    }

    #[test]
    fn repeat_lessons_from_one_task_do_not_count_twice() {
        let (queue, _, _, episodic) = queue();
        episodic
            .append(episode("task_1", &["review_failed"]))
            .unwrap();
        episodic
            .append(episode("task_1", &["review_failed"]))
            .unwrap();
        assert!(queue.scan(&episodic).unwrap().is_empty());
    }

    #[test]
    fn approval_promotes_the_drafted_text_verbatim() {
        let (queue, policy, _, episodic) = queue();
        episodic.append(episode("task_1", &["compliance:hold"])).unwrap();
        episodic.append(episode("task_2", &["compliance:hold"])).unwrap();
        let drafted = queue.scan(&episodic).unwrap();
        let proposal = &drafted[0];

        let token = ApprovalToken::new("operator").unwrap();
        let rule = queue.approve(&proposal.id, Some(&token)).unwrap();
        assert_eq!(rule.text, proposal.rule_text);
        assert!(policy.snapshot().get(&rule.id).is_some());

        // Second approval is refused.
        let err = queue.approve(&proposal.id, Some(&token)).unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::Promotion(PromotionError::AlreadyDecided { .. })
        ));
    }

    #[test]
    fn approval_without_a_token_is_refused() {
        let (queue, policy, _, episodic) = queue();
        episodic.append(episode("task_1", &["budget_halted:steps"])).unwrap();
        episodic.append(episode("task_2", &["budget_halted:steps"])).unwrap();
        let drafted = queue.scan(&episodic).unwrap();
        let before = policy.snapshot().rules().len();

        let err = queue.approve(&drafted[0].id, None).unwrap_err();
        assert!(matches!(err, GovernanceError::ApprovalRequired { .. }));
        assert_eq!(policy.snapshot().rules().len(), before);

        // An anonymous token cannot be constructed at all.
        assert!(ApprovalToken::new("   ").is_none());
    }

    #[test]
    fn rejected_proposals_never_reach_the_store() {
        let (queue, policy, audit, episodic) = queue();
        episodic.append(episode("task_1", &["cancelled"])).unwrap();
        episodic.append(episode("task_2", &["cancelled"])).unwrap();
        let drafted = queue.scan(&episodic).unwrap();
        let before = policy.snapshot().rules().len();

        queue.reject(&drafted[0].id, "not a useful signal").unwrap();
        assert_eq!(policy.snapshot().rules().len(), before);
        assert_eq!(
            queue.get(&drafted[0].id).unwrap().status,
            ProposalStatus::Rejected
        );
        assert!(audit
            .export(&crate::audit::AuditFilter::default())
            .iter()
            .any(|e| e.decision == AuditDecision::ProposalRejected));
    }

    #[test]
    fn expiry_is_audited_not_silent() {
        let (queue, _, audit, episodic) = queue();
        episodic.append(episode("task_1", &["cancelled"])).unwrap();
        episodic.append(episode("task_2", &["cancelled"])).unwrap();
        let drafted = queue.scan(&episodic).unwrap();

        // Force the proposal past its TTL.
        let mut expired = (*drafted[0]).clone();
        expired.expires_at = Utc::now() - Duration::days(1);
        queue
            .proposals
            .insert(expired.id.clone(), Arc::new(expired));

        let pruned = queue.prune_expired().unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(
            queue.get(&drafted[0].id).unwrap().status,
            ProposalStatus::Expired
        );
        assert!(audit
            .export(&crate::audit::AuditFilter::default())
            .iter()
            .any(|e| e.decision == AuditDecision::ProposalPruned));

        let token = ApprovalToken::new("operator").unwrap();
        let err = queue.approve(&drafted[0].id, Some(&token)).unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::Promotion(PromotionError::AlreadyDecided { .. })
        ));
    }
}
