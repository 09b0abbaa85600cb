//! Produce stage: writes output bound to the spec and gathered provenance.
//!
//! Implements: REQ-GOV-002/F-005
//!
//! Production itself happens in an external collaborator; this stage only
//! feeds it the spec and the admitted records, then binds the draft to the
//! task with an integrity digest. Produce cannot change the spec's scope;
//! spec writes are outside its grants.

use async_trait::async_trait;

use super::{Collaborators, Stage, StageContext, StageError, StageKind, StageOutcome};

/// The Produce stage.
pub struct ProduceStage {
    collaborators: Collaborators,
}

impl ProduceStage {
    /// Creates the stage with its collaborator set.
    #[must_use]
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }
}

#[async_trait]
impl Stage for ProduceStage {
    fn kind(&self) -> StageKind {
        StageKind::Produce
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, StageError> {
        let spec = ctx
            .task()
            .spec
            .clone()
            .ok_or(StageError::MissingPrerequisite {
                stage: StageKind::Produce,
                missing: "task spec",
            })?;
        let goal = ctx.task().goal.clone();
        let attempt = ctx.task().produce_attempts + 1;
        let sources = ctx.task_records();

        let draft = self
            .collaborators
            .producer
            .produce(&goal, &spec, &sources, attempt)
            .await
            .map_err(|details| StageError::Collaborator {
                stage: StageKind::Produce,
                details,
            })?;
        ctx.note_tool_calls(1);

        let citations = draft.citations.len();
        ctx.set_output(draft.content, draft.citations)?;

        Ok(StageOutcome::done(format!(
            "output written on attempt {attempt} with {citations} citation(s)"
        )))
    }
}
