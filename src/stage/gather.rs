//! Gather stage: appends provenance records through the ledger's gates.
//!
//! Implements: REQ-GOV-002/F-004
//!
//! Gather is the only stage granted ledger appends. It never speculates:
//! every record it admits passed the creation-time validation (source,
//! timestamp, confidence), and records the collaborator fails to source
//! simply do not exist as far as the pipeline is concerned.

use async_trait::async_trait;

use super::{Collaborators, Stage, StageContext, StageError, StageKind, StageOutcome};

/// The Gather stage.
pub struct GatherStage {
    collaborators: Collaborators,
}

impl GatherStage {
    /// Creates the stage with its collaborator set.
    #[must_use]
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }
}

#[async_trait]
impl Stage for GatherStage {
    fn kind(&self) -> StageKind {
        StageKind::Gather
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
        let spec = ctx
            .task()
            .spec
            .clone()
            .ok_or(StageError::MissingPrerequisite {
                stage: StageKind::Gather,
                missing: "task spec",
            })?;
        let goal = ctx.task().goal.clone();
        let submitted = ctx.task().provenance.len();

        let drafts = self
            .collaborators
            .gatherer
            .gather(&goal, &spec)
            .await
            .map_err(|details| StageError::Collaborator {
                stage: StageKind::Gather,
                details,
            })?;
        ctx.note_tool_calls(1);

        let mut admitted = 0usize;
        for draft in drafts {
            // A malformed gathered record is a stage failure, not a
            // skip-and-continue: the gatherer is supposed to hand over
            // provenance that survives the gates.
            ctx.append_provenance(draft)?;
            admitted += 1;
        }

        Ok(StageOutcome::done(format!(
            "{admitted} record(s) gathered, {submitted} from submission"
        )))
    }
}
