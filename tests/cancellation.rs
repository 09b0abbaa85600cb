//! Cooperative cancellation: the in-flight stage finishes its atomic unit,
//! then the task lands in REJECTED with the cancellation reason.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;

use stagegate::governor::SubmitOptions;
use stagegate::policy::loader::embedded_default_rules;
use stagegate::provenance::{ProvenanceDraft, ProvenanceRecord};
use stagegate::stage::{Collaborators, ContentProducer, DraftOutput, TemplateProducer};
use stagegate::task::TaskSpec;
use stagegate::{CoreConfig, GovernanceCore, GovernanceError, TaskStatus};

/// Producer that parks inside Produce until the test releases it, so the
/// test can cancel while a stage is provably in flight.
struct GatedProducer {
    entered: Arc<Semaphore>,
    release: Arc<Semaphore>,
}

#[async_trait]
impl ContentProducer for GatedProducer {
    async fn produce(
        &self,
        goal: &str,
        spec: &TaskSpec,
        sources: &[Arc<ProvenanceRecord>],
        attempt: u32,
    ) -> Result<DraftOutput, String> {
        self.entered.add_permits(1);
        let _permit = self.release.acquire().await.map_err(|e| e.to_string())?;
        TemplateProducer.produce(goal, spec, sources, attempt).await
    }
}

fn source(name: &str) -> ProvenanceDraft {
    ProvenanceDraft {
        source: name.to_string(),
        timestamp: Utc::now(),
        confidence: 0.8,
        content_ref: "input".to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_running_task_finishes_the_atomic_unit_first() {
    let entered = Arc::new(Semaphore::new(0));
    let release = Arc::new(Semaphore::new(0));
    let core = GovernanceCore::with_rules(
        CoreConfig::default(),
        embedded_default_rules().unwrap(),
        Collaborators {
            producer: Arc::new(GatedProducer {
                entered: entered.clone(),
                release: release.clone(),
            }),
            gatherer: Arc::new(stagegate::stage::NoopGatherer),
        },
    )
    .unwrap();

    let task_id = core
        .submit(
            "Summarize input",
            vec![source("a"), source("b")],
            SubmitOptions::default(),
        )
        .await
        .unwrap();

    // Wait until the Produce stage is in flight, then cancel.
    let _entered = entered.acquire().await.unwrap();
    core.cancel(&task_id, "superseded by a newer request").unwrap();
    release.add_permits(1);

    let task = core.wait_until_settled(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Rejected);
    assert_eq!(
        task.rationale.as_deref(),
        Some("cancelled: superseded by a newer request")
    );
    // The atomic unit completed: the produced output was committed, not
    // torn, before the cancellation took effect.
    assert!(task.output.is_some());
}

#[tokio::test]
async fn cancel_pending_never_starts_the_pipeline() {
    // A single worker, so a second admitted task stays Pending.
    let mut config = CoreConfig::default();
    config.concurrency.max_workers = 1;
    let entered = Arc::new(Semaphore::new(0));
    let release = Arc::new(Semaphore::new(0));
    let core = GovernanceCore::with_rules(
        config,
        embedded_default_rules().unwrap(),
        Collaborators {
            producer: Arc::new(GatedProducer {
                entered: entered.clone(),
                release: release.clone(),
            }),
            gatherer: Arc::new(stagegate::stage::NoopGatherer),
        },
    )
    .unwrap();

    // First task occupies the only worker inside Produce.
    let busy = core
        .submit(
            "Summarize input one",
            vec![source("a"), source("b")],
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let _entered = entered.acquire().await.unwrap();

    // Second task is admitted but cannot start; cancel it while Pending.
    let waiting = core
        .submit(
            "Summarize input two",
            vec![source("a"), source("b")],
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(core.get_status(&waiting).unwrap().outcome, TaskStatus::Pending);
    core.cancel(&waiting, "no longer needed").unwrap();

    let status = core.get_status(&waiting).unwrap();
    assert_eq!(status.outcome, TaskStatus::Rejected);
    assert!(status.rationale.unwrap().contains("no longer needed"));

    // The busy task is unaffected and completes once released.
    release.add_permits(1);
    let task = core.wait_until_settled(&busy).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
}

#[tokio::test]
async fn terminal_tasks_cannot_be_cancelled() {
    let core = GovernanceCore::with_rules(
        CoreConfig::default(),
        embedded_default_rules().unwrap(),
        Collaborators::default(),
    )
    .unwrap();
    let task_id = core
        .submit(
            "Summarize input",
            vec![source("a"), source("b")],
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    core.wait_until_settled(&task_id).await.unwrap();

    let err = core.cancel(&task_id, "too late").unwrap_err();
    assert!(matches!(
        err,
        GovernanceError::Task(stagegate::task::TaskError::AlreadyTerminal { .. })
    ));
}
