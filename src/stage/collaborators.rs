//! External collaborator seams for the Gather and Produce stages.
//!
//! Natural-language generation and external research are not part of the
//! state machine. The stages call out through these adapter traits; the
//! built-in implementations are deterministic stand-ins suitable for tests
//! and for deployments where submitters supply all provenance up front.

use std::sync::Arc;

use async_trait::async_trait;

use crate::provenance::{ProvenanceDraft, ProvenanceRecord, RecordId};
use crate::task::TaskSpec;

/// Error string surfaced by a collaborator. Collaborators are outside the
/// trust boundary; their failures are data, not panics.
pub type CollaboratorError = String;

/// Draft output handed back by a content producer.
#[derive(Debug, Clone)]
pub struct DraftOutput {
    /// The drafted content
    pub content: String,
    /// Ledger records the draft claims support from
    pub citations: Vec<RecordId>,
}

/// Produces task output bound to a spec and gathered sources.
#[async_trait]
pub trait ContentProducer: Send + Sync {
    /// Drafts output for the spec, citing the given records.
    async fn produce(
        &self,
        goal: &str,
        spec: &TaskSpec,
        sources: &[Arc<ProvenanceRecord>],
        attempt: u32,
    ) -> Result<DraftOutput, CollaboratorError>;
}

/// Gathers additional provenanced sources for a goal.
#[async_trait]
pub trait SourceGatherer: Send + Sync {
    /// Returns candidate records; each is validated by the ledger's
    /// creation-time gates before admission.
    async fn gather(
        &self,
        goal: &str,
        spec: &TaskSpec,
    ) -> Result<Vec<ProvenanceDraft>, CollaboratorError>;
}

/// The collaborator set a pipeline runs with.
#[derive(Clone)]
pub struct Collaborators {
    /// Content producer used by the Produce stage
    pub producer: Arc<dyn ContentProducer>,
    /// Source gatherer used by the Gather stage
    pub gatherer: Arc<dyn SourceGatherer>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            producer: Arc::new(TemplateProducer),
            gatherer: Arc::new(NoopGatherer),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Collaborators")
    }
}

// ============================================================================
// Built-in implementations
// ============================================================================

/// Deterministic producer: renders the deliverables with one citation per
/// supplied source. Useful as a test double and as the no-model default.
#[derive(Debug, Default)]
pub struct TemplateProducer;

#[async_trait]
impl ContentProducer for TemplateProducer {
    async fn produce(
        &self,
        goal: &str,
        spec: &TaskSpec,
        sources: &[Arc<ProvenanceRecord>],
        attempt: u32,
    ) -> Result<DraftOutput, CollaboratorError> {
        let mut content = format!("Deliverable for goal: {goal}\n");
        for deliverable in &spec.deliverables {
            content.push_str(&format!("- {deliverable}\n"));
        }
        if attempt > 1 {
            content.push_str(&format!("(revision {attempt})\n"));
        }
        Ok(DraftOutput {
            content,
            citations: sources.iter().map(|r| r.id.clone()).collect(),
        })
    }
}

/// Gatherer that contributes nothing beyond submission provenance.
#[derive(Debug, Default)]
pub struct NoopGatherer;

#[async_trait]
impl SourceGatherer for NoopGatherer {
    async fn gather(
        &self,
        _goal: &str,
        _spec: &TaskSpec,
    ) -> Result<Vec<ProvenanceDraft>, CollaboratorError> {
        Ok(Vec::new())
    }
}
