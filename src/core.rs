//! `GovernanceCore`: the external surface of the orchestration core.
//!
//! Implements: REQ-GOV-001/§6 (External Interfaces)
//!
//! Submissions fan out to background pipeline executions bounded by the
//! configured worker limit; a parked (`ESCALATED`) task holds no worker and
//! resumes only through [`GovernanceCore::resolve_escalation`]. The four
//! durable logs (policy, provenance, audit, episodic) journal under the
//! configured state directory, or stay in memory when none is set.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::audit::{AuditEntry, AuditFilter, AuditLog};
use crate::config::CoreConfig;
use crate::episodic::{EpisodeRecord, EpisodicLog};
use crate::error::GovernanceError;
use crate::governor::{EscalationDecision, Governor, SubmitOptions};
use crate::pipeline::PipelineRunner;
use crate::policy::{PolicyRule, PolicyStore};
use crate::promotion::{ApprovalToken, PromotionProposal, PromotionQueue, ProposalId};
use crate::provenance::{ProvenanceDraft, ProvenanceLedger};
use crate::stage::Collaborators;
use crate::task::{RiskTier, TaskError, TaskId, TaskRecord, TaskStatus, TaskStore};

/// Snapshot answer to a status query.
#[derive(Debug, Clone)]
pub struct TaskStatusView {
    /// The task
    pub task_id: TaskId,
    /// Stage currently (or last) holding control
    pub stage: Option<crate::stage::StageKind>,
    /// Assigned risk tier
    pub risk_tier: RiskTier,
    /// Lifecycle outcome
    pub outcome: TaskStatus,
    /// Terminal rationale, when one exists
    pub rationale: Option<String>,
    /// Most recent audit entries for the task, oldest first
    pub latest_audit_entries: Vec<Arc<AuditEntry>>,
}

/// How many audit entries a status query returns.
const STATUS_AUDIT_TAIL: usize = 10;

struct CoreInner {
    config: Arc<CoreConfig>,
    policy: Arc<PolicyStore>,
    ledger: Arc<ProvenanceLedger>,
    audit: Arc<AuditLog>,
    tasks: Arc<TaskStore>,
    episodic: Arc<EpisodicLog>,
    governor: Governor,
    pipeline: PipelineRunner,
    promotion: PromotionQueue,
    workers: Arc<Semaphore>,
    cancel_tokens: DashMap<TaskId, CancellationToken>,
    cancel_reasons: Arc<DashMap<TaskId, String>>,
}

/// The governance orchestration core.
#[derive(Clone)]
pub struct GovernanceCore {
    inner: Arc<CoreInner>,
}

impl std::fmt::Debug for GovernanceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceCore")
            .field("tasks", &self.inner.tasks.total_count())
            .field("active", &self.inner.tasks.active_count())
            .finish()
    }
}

impl GovernanceCore {
    /// Builds a core from configuration, loading the seed rule set through
    /// the standard priority chain (file → env → embedded).
    pub fn new(
        config: CoreConfig,
        collaborators: Collaborators,
    ) -> Result<Self, GovernanceError> {
        let (rules, source) = crate::policy::loader::load_rules()?;
        info!(?source, "Seed rule set loaded");
        Self::with_rules(config, rules, collaborators)
    }

    /// Builds a core with an explicit seed rule set.
    pub fn with_rules(
        config: CoreConfig,
        seed_rules: Vec<crate::policy::PolicyRule>,
        collaborators: Collaborators,
    ) -> Result<Self, GovernanceError> {
        config.validate()?;
        let config = Arc::new(config);

        let (policy, ledger, audit, episodic) = match &config.state_dir {
            Some(dir) => (
                Arc::new(PolicyStore::with_journal(seed_rules, dir)?),
                Arc::new(ProvenanceLedger::with_journal(dir)?),
                Arc::new(AuditLog::with_journal(dir)?),
                Arc::new(EpisodicLog::with_journal(dir)?),
            ),
            None => (
                Arc::new(PolicyStore::new(seed_rules)),
                Arc::new(ProvenanceLedger::new()),
                Arc::new(AuditLog::new()),
                Arc::new(EpisodicLog::new()),
            ),
        };

        let tasks = Arc::new(TaskStore::new());
        let governor = Governor::new(
            config.clone(),
            policy.clone(),
            ledger.clone(),
            audit.clone(),
            tasks.clone(),
        );
        let cancel_reasons = Arc::new(DashMap::new());
        let pipeline = PipelineRunner::new(
            config.clone(),
            policy.clone(),
            ledger.clone(),
            audit.clone(),
            tasks.clone(),
            episodic.clone(),
            collaborators,
            cancel_reasons.clone(),
        );
        let promotion = PromotionQueue::new(
            config.promotion.clone(),
            policy.clone(),
            audit.clone(),
        );
        let workers = Arc::new(Semaphore::new(config.concurrency.max_workers));

        Ok(Self {
            inner: Arc::new(CoreInner {
                config,
                policy,
                ledger,
                audit,
                tasks,
                episodic,
                governor,
                pipeline,
                promotion,
                workers,
                cancel_tokens: DashMap::new(),
                cancel_reasons,
            }),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Submission / status / escalation
    // ─────────────────────────────────────────────────────────────────────

    /// Submits a goal with supporting provenance. On admission the task ID
    /// returns immediately and the pipeline runs in the background under
    /// the worker limit.
    ///
    /// Implements: REQ-GOV-001/F-002
    pub async fn submit(
        &self,
        goal: &str,
        provenance: Vec<ProvenanceDraft>,
        options: SubmitOptions,
    ) -> Result<TaskId, GovernanceError> {
        let task = self.inner.governor.submit(goal, provenance, options)?;
        self.spawn_leg(task.id.clone(), Leg::Start);
        Ok(task.id.clone())
    }

    /// Current stage, tier, outcome, and recent audit entries for a task.
    ///
    /// Terminal tasks answer identically on every call.
    pub fn get_status(&self, task_id: &TaskId) -> Result<TaskStatusView, GovernanceError> {
        let task = self.inner.tasks.get(task_id)?;
        Ok(TaskStatusView {
            task_id: task.id.clone(),
            stage: task.current_stage,
            risk_tier: task.risk_tier,
            outcome: task.status,
            rationale: task.rationale.clone(),
            latest_audit_entries: self.inner.audit.latest_for_task(task_id, STATUS_AUDIT_TAIL),
        })
    }

    /// Records a human's disposition of an escalated task. Approval resumes
    /// the pipeline from the parked stage; rejection terminates the task.
    ///
    /// Implements: REQ-GOV-003/F-002
    pub async fn resolve_escalation(
        &self,
        task_id: &TaskId,
        decision: EscalationDecision,
        approver: &str,
        reason: Option<String>,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        let task = self
            .inner
            .governor
            .resolve_escalation(task_id, decision, approver, reason)?;

        match decision {
            EscalationDecision::Approve => {
                self.spawn_leg(task_id.clone(), Leg::Resume);
            }
            EscalationDecision::Reject => {
                self.record_episode_for_terminal(&task, vec!["escalation_rejected".into()])?;
            }
        }
        Ok(task)
    }

    /// Cancels a `Pending` or `Running` task. Cancellation is cooperative:
    /// the current stage finishes its atomic unit before the task lands in
    /// `Rejected` with the cancellation reason.
    pub fn cancel(&self, task_id: &TaskId, reason: &str) -> Result<(), GovernanceError> {
        let task = self.inner.tasks.get(task_id)?;
        match task.status {
            TaskStatus::Pending => {
                let task = self.inner.governor.cancel_pending(task_id, reason)?;
                self.record_episode_for_terminal(&task, vec!["cancelled".into()])?;
                Ok(())
            }
            TaskStatus::Running | TaskStatus::Review => {
                self.inner
                    .cancel_reasons
                    .insert(task_id.clone(), reason.to_string());
                if let Some(token) = self.inner.cancel_tokens.get(task_id) {
                    token.cancel();
                }
                Ok(())
            }
            TaskStatus::Escalated => Err(GovernanceError::Task(TaskError::ParkedAwaitingHuman {
                task_id: task_id.clone(),
            })),
            status => Err(GovernanceError::Task(TaskError::AlreadyTerminal {
                task_id: task_id.clone(),
                status,
            })),
        }
    }

    /// Waits until a task is terminal or parked.
    pub async fn wait_until_settled(
        &self,
        task_id: &TaskId,
    ) -> Result<Arc<TaskRecord>, GovernanceError> {
        Ok(self.inner.tasks.wait_until_settled(task_id).await?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Promotion interface
    // ─────────────────────────────────────────────────────────────────────

    /// Scans episodic history and drafts new proposals.
    pub fn scan_promotions(&self) -> Result<Vec<Arc<PromotionProposal>>, GovernanceError> {
        self.inner.promotion.scan(&self.inner.episodic)
    }

    /// Lists proposals in drafting order.
    #[must_use]
    pub fn list_proposals(&self) -> Vec<Arc<PromotionProposal>> {
        self.inner.promotion.list()
    }

    /// Approves a proposal; the named approver is the approval token.
    pub fn approve_proposal(
        &self,
        proposal_id: &ProposalId,
        approver: &str,
    ) -> Result<Arc<PolicyRule>, GovernanceError> {
        let token = ApprovalToken::new(approver);
        self.inner.promotion.approve(proposal_id, token.as_ref())
    }

    /// Rejects a proposal with a recorded reason.
    pub fn reject_proposal(
        &self,
        proposal_id: &ProposalId,
        reason: &str,
    ) -> Result<(), GovernanceError> {
        self.inner.promotion.reject(proposal_id, reason)
    }

    /// Expires pending proposals past their TTL.
    pub fn prune_expired_proposals(&self) -> Result<usize, GovernanceError> {
        self.inner.promotion.prune_expired()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Exports & accessors
    // ─────────────────────────────────────────────────────────────────────

    /// Filterable read access to the audit stream.
    #[must_use]
    pub fn export_audit(&self, filter: &AuditFilter) -> Vec<Arc<AuditEntry>> {
        self.inner.audit.export(filter)
    }

    /// The policy store.
    #[must_use]
    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.inner.policy
    }

    /// The provenance ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<ProvenanceLedger> {
        &self.inner.ledger
    }

    /// The episodic history.
    #[must_use]
    pub fn episodic(&self) -> &Arc<EpisodicLog> {
        &self.inner.episodic
    }

    /// The configuration the core runs under.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    fn spawn_leg(&self, task_id: TaskId, leg: Leg) {
        let inner = self.inner.clone();
        let token = CancellationToken::new();
        inner.cancel_tokens.insert(task_id.clone(), token.clone());

        tokio::spawn(async move {
            // A parked task holds no worker: the permit is acquired per leg
            // and released the moment the leg returns.
            let _permit = inner
                .workers
                .clone()
                .acquire_owned()
                .await
                .expect("worker semaphore closed");

            let result = match leg {
                Leg::Start => inner.pipeline.run(&task_id, token).await,
                Leg::Resume => inner.pipeline.resume(&task_id, token).await,
            };
            if let Err(err) = result {
                // Budget halts land here: the task is already terminal and
                // audited, the error is the caller-visible classification.
                error!(task_id = %task_id, error = %err, "Pipeline leg ended with error");
            }
            inner.cancel_tokens.remove(&task_id);
            // A cancel that raced the leg's completion leaves its reason
            // behind; drop it so a later leg cannot pick it up.
            inner.cancel_reasons.remove(&task_id);
        });
    }

    fn record_episode_for_terminal(
        &self,
        task: &TaskRecord,
        lessons: Vec<String>,
    ) -> Result<(), GovernanceError> {
        let duration_ms = (chrono::Utc::now() - task.created_at)
            .num_milliseconds()
            .max(0) as u64;
        self.inner.episodic.append(EpisodeRecord {
            task_id: task.id.clone(),
            timestamp: chrono::Utc::now(),
            risk_tier: task.risk_tier,
            outcome: task.status,
            stages_run: Vec::new(),
            lessons,
            duration_ms,
        })?;
        Ok(())
    }
}

enum Leg {
    Start,
    Resume,
}
