//! Episodic history: append-only log of completed task outcomes.
//!
//! Every task that reaches a terminal state leaves one episode behind. The
//! promotion pipeline scans this log for repeated patterns; nothing else
//! reads it on the hot path.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::StageKind;
use crate::task::{RiskTier, TaskId, TaskStatus};

/// One recorded task outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRecord {
    /// Task the episode describes
    pub task_id: TaskId,
    /// When the episode was appended
    pub timestamp: DateTime<Utc>,
    /// Risk tier the task ran under
    pub risk_tier: RiskTier,
    /// Terminal status the task reached
    pub outcome: TaskStatus,
    /// Stages that actually executed
    pub stages_run: Vec<StageKind>,
    /// Normalized observations worth remembering (pattern keys for
    /// promotion scans), e.g. `review_failed:unsupported_claim`
    pub lessons: Vec<String>,
    /// Wall-clock duration from admission to terminal state
    pub duration_ms: u64,
}

/// Append-only episodic log.
pub struct EpisodicLog {
    episodes: RwLock<Vec<Arc<EpisodeRecord>>>,
    append_lock: Mutex<()>,
    journal: Option<crate::journal::JsonlJournal>,
}

impl fmt::Debug for EpisodicLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpisodicLog")
            .field("episodes", &self.len())
            .field("journaled", &self.journal.is_some())
            .finish()
    }
}

impl Default for EpisodicLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EpisodicLog {
    /// Creates an in-memory episodic log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            episodes: RwLock::new(Vec::new()),
            append_lock: Mutex::new(()),
            journal: None,
        }
    }

    /// Creates a log that journals to `<dir>/episodic.jsonl`.
    pub fn with_journal(dir: &std::path::Path) -> Result<Self, crate::journal::JournalError> {
        let journal = crate::journal::JsonlJournal::open(dir, "episodic")?;
        Ok(Self {
            episodes: RwLock::new(Vec::new()),
            append_lock: Mutex::new(()),
            journal: Some(journal),
        })
    }

    /// Appends one episode.
    pub fn append(&self, episode: EpisodeRecord) -> Result<(), crate::journal::JournalError> {
        let _guard = self
            .append_lock
            .lock()
            .expect("episodic append lock poisoned");
        if let Some(journal) = &self.journal {
            journal.append(&episode)?;
        }
        self.episodes
            .write()
            .expect("episodic lock poisoned")
            .push(Arc::new(episode));
        Ok(())
    }

    /// Snapshot of every episode, in append order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<EpisodeRecord>> {
        self.episodes
            .read()
            .expect("episodic lock poisoned")
            .clone()
    }

    /// Episodes appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.episodes.read().expect("episodic lock poisoned").len()
    }

    /// True if no episode was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episodes_accumulate_in_order() {
        let log = EpisodicLog::new();
        for i in 0..3 {
            log.append(EpisodeRecord {
                task_id: TaskId::from_raw(format!("task_{i}")),
                timestamp: Utc::now(),
                risk_tier: RiskTier::Low,
                outcome: TaskStatus::Done,
                stages_run: vec![StageKind::Plan, StageKind::Produce],
                lessons: vec![],
                duration_ms: 10,
            })
            .unwrap();
        }
        let all = log.all();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].task_id.as_str(), "task_2");
    }
}
