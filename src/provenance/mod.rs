//! Provenance ledger: append-only record of where every fact came from.
//!
//! Implements: REQ-LED-001 (Provenance Ledger)
//!
//! Every fact consumed by the stage pipeline resolves to at least one record
//! here. Records are validated at creation (source, timestamp, confidence:
//! all three, no later cleanup) and a successful append is irrevocable.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Tolerated clock skew for record timestamps. A record "from the future"
/// beyond this window is a creation-time rejection.
const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of one ledger record (`prov_` prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(format!("prov_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Wraps a known ID (journal recovery, tests).
    #[must_use]
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Records
// ============================================================================

/// An unvalidated candidate record, as handed in by a submitter or the
/// Gather stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceDraft {
    /// Where the fact came from (publication, feed, tool, person)
    pub source: String,
    /// When the source asserted it
    pub timestamp: DateTime<Utc>,
    /// Submitter's confidence in the fact, in [0, 1]
    pub confidence: f64,
    /// Opaque reference to the content the record backs
    pub content_ref: String,
}

/// A validated, persisted ledger record.
///
/// Implements: REQ-LED-001/F-001
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Ledger-assigned identifier
    pub id: RecordId,
    /// Where the fact came from
    pub source: String,
    /// When the source asserted it
    pub timestamp: DateTime<Utc>,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Opaque reference to the backed content
    pub content_ref: String,
    /// When the ledger accepted the record
    pub recorded_at: DateTime<Utc>,
}

impl ProvenanceRecord {
    /// True if the record is older than the given staleness threshold.
    ///
    /// Stale records are flagged on resolve, never removed; the ledger is
    /// append-only and history stays intact.
    #[must_use]
    pub fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        now - self.timestamp > stale_after
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Creation-time validation failures.
///
/// Implements: REQ-LED-001/F-002. A malformed record is rejected at append,
/// never admitted for later cleanup.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProvenanceError {
    /// Source field empty or whitespace.
    #[error("provenance record has an empty source")]
    EmptySource,

    /// Content reference missing.
    #[error("provenance record has an empty content_ref")]
    EmptyContentRef,

    /// Confidence outside [0, 1] (or not a number).
    #[error("provenance confidence {confidence} outside [0, 1]")]
    ConfidenceOutOfRange {
        /// Offending value
        confidence: f64,
    },

    /// Timestamp further in the future than tolerated clock skew.
    #[error("provenance timestamp {timestamp} is in the future")]
    FutureTimestamp {
        /// Offending value
        timestamp: DateTime<Utc>,
    },

    /// Durable journal append failed; the record was not admitted.
    #[error("provenance journal append failed: {reason}")]
    Journal {
        /// Underlying failure
        reason: String,
    },
}

// ============================================================================
// Ledger
// ============================================================================

/// Result of a source-dominance check over a set of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominanceReport {
    /// The most frequent source
    pub source: String,
    /// Share of the records that source supplies, in (0, 1]
    pub share: f64,
    /// Whether the share crossed the configured threshold
    pub dominant: bool,
}

/// Append-only provenance ledger.
///
/// Implements: REQ-LED-001
///
/// Reads never block on writes; the only coordination is the append's own
/// atomicity (journal line + index insert behind one lock).
pub struct ProvenanceLedger {
    records: DashMap<RecordId, Arc<ProvenanceRecord>>,
    by_content_ref: DashMap<String, Vec<RecordId>>,
    append_lock: Mutex<()>,
    journal: Option<crate::journal::JsonlJournal>,
}

impl fmt::Debug for ProvenanceLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvenanceLedger")
            .field("records", &self.records.len())
            .field("journaled", &self.journal.is_some())
            .finish()
    }
}

impl Default for ProvenanceLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvenanceLedger {
    /// Creates an in-memory ledger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            by_content_ref: DashMap::new(),
            append_lock: Mutex::new(()),
            journal: None,
        }
    }

    /// Creates a ledger that journals to `<dir>/provenance.jsonl`.
    pub fn with_journal(dir: &std::path::Path) -> Result<Self, crate::journal::JournalError> {
        let journal = crate::journal::JsonlJournal::open(dir, "provenance")?;
        Ok(Self {
            records: DashMap::new(),
            by_content_ref: DashMap::new(),
            append_lock: Mutex::new(()),
            journal: Some(journal),
        })
    }

    /// Validates a draft without admitting it.
    ///
    /// Implements: REQ-LED-001/F-002
    pub fn validate(draft: &ProvenanceDraft) -> Result<(), ProvenanceError> {
        if draft.source.trim().is_empty() {
            return Err(ProvenanceError::EmptySource);
        }
        if draft.content_ref.trim().is_empty() {
            return Err(ProvenanceError::EmptyContentRef);
        }
        if !(0.0..=1.0).contains(&draft.confidence) || draft.confidence.is_nan() {
            return Err(ProvenanceError::ConfidenceOutOfRange {
                confidence: draft.confidence,
            });
        }
        if draft.timestamp - Utc::now() > Duration::seconds(MAX_TIMESTAMP_SKEW_SECS) {
            return Err(ProvenanceError::FutureTimestamp {
                timestamp: draft.timestamp,
            });
        }
        Ok(())
    }

    /// Validates and appends a record. Success is irrevocable.
    ///
    /// Implements: REQ-LED-001/F-001, F-002
    pub fn append(&self, draft: ProvenanceDraft) -> Result<RecordId, ProvenanceError> {
        Self::validate(&draft)?;

        let record = Arc::new(ProvenanceRecord {
            id: RecordId::new(),
            source: draft.source,
            timestamp: draft.timestamp,
            confidence: draft.confidence,
            content_ref: draft.content_ref,
            recorded_at: Utc::now(),
        });

        {
            let _guard = self.append_lock.lock().expect("ledger append lock poisoned");
            if let Some(journal) = &self.journal {
                // Journal failure drops the append entirely; the in-memory
                // index must not get ahead of the durable log.
                if let Err(err) = journal.append(record.as_ref()) {
                    return Err(ProvenanceError::Journal {
                        reason: err.to_string(),
                    });
                }
            }
            self.by_content_ref
                .entry(record.content_ref.clone())
                .or_default()
                .push(record.id.clone());
            self.records.insert(record.id.clone(), record.clone());
        }

        tracing::debug!(
            record_id = %record.id,
            source = %record.source,
            confidence = record.confidence,
            "Provenance record appended"
        );
        Ok(record.id.clone())
    }

    /// Looks up one record by ID.
    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<Arc<ProvenanceRecord>> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Resolves every record backing a content reference.
    ///
    /// Implements: REQ-LED-001/F-003. Used by Review to verify that every
    /// claim in produced output traces to at least one record.
    #[must_use]
    pub fn resolve(&self, content_ref: &str) -> Vec<Arc<ProvenanceRecord>> {
        let ids = match self.by_content_ref.get(content_ref) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Number of distinct sources among the given records.
    #[must_use]
    pub fn distinct_sources(records: &[Arc<ProvenanceRecord>]) -> usize {
        let mut sources: Vec<&str> = records.iter().map(|r| r.source.as_str()).collect();
        sources.sort_unstable();
        sources.dedup();
        sources.len()
    }

    /// Computes which source dominates a record set.
    ///
    /// Implements: REQ-LED-001/F-004. Review records a warning when one
    /// source supplies more than `threshold` of the backing records. The
    /// warning never blocks by itself.
    #[must_use]
    pub fn dominance(
        records: &[Arc<ProvenanceRecord>],
        threshold: f64,
    ) -> Option<DominanceReport> {
        if records.is_empty() {
            return None;
        }
        let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        for record in records {
            *counts.entry(record.source.as_str()).or_insert(0) += 1;
        }
        let (source, count) = counts.into_iter().max_by_key(|(_, n)| *n)?;
        let share = count as f64 / records.len() as f64;
        Some(DominanceReport {
            source: source.to_string(),
            share,
            dominant: share > threshold,
        })
    }

    /// Total records admitted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no record was ever admitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(source: &str, confidence: f64, content_ref: &str) -> ProvenanceDraft {
        ProvenanceDraft {
            source: source.to_string(),
            timestamp: Utc::now(),
            confidence,
            content_ref: content_ref.to_string(),
        }
    }

    #[test]
    fn append_and_resolve_by_content_ref() {
        let ledger = ProvenanceLedger::new();
        ledger.append(draft("feed-a", 0.6, "claim-1")).unwrap();
        ledger.append(draft("feed-b", 0.8, "claim-1")).unwrap();
        ledger.append(draft("feed-a", 0.7, "claim-2")).unwrap();

        let backing = ledger.resolve("claim-1");
        assert_eq!(backing.len(), 2);
        assert_eq!(ProvenanceLedger::distinct_sources(&backing), 2);
        assert!(ledger.resolve("claim-9").is_empty());
    }

    #[test]
    fn malformed_records_are_creation_time_rejections() {
        let ledger = ProvenanceLedger::new();

        let err = ledger.append(draft("  ", 0.5, "x")).unwrap_err();
        assert_eq!(err, ProvenanceError::EmptySource);

        let err = ledger.append(draft("feed", 1.5, "x")).unwrap_err();
        assert!(matches!(err, ProvenanceError::ConfidenceOutOfRange { .. }));

        let err = ledger.append(draft("feed", 0.5, "")).unwrap_err();
        assert_eq!(err, ProvenanceError::EmptyContentRef);

        let mut future = draft("feed", 0.5, "x");
        future.timestamp = Utc::now() + Duration::hours(2);
        let err = ledger.append(future).unwrap_err();
        assert!(matches!(err, ProvenanceError::FutureTimestamp { .. }));

        assert!(ledger.is_empty());
    }

    #[test]
    fn dominance_flags_majority_source() {
        let ledger = ProvenanceLedger::new();
        ledger.append(draft("loud", 0.9, "c")).unwrap();
        ledger.append(draft("loud", 0.9, "c")).unwrap();
        ledger.append(draft("quiet", 0.9, "c")).unwrap();

        let report = ProvenanceLedger::dominance(&ledger.resolve("c"), 0.5).unwrap();
        assert_eq!(report.source, "loud");
        assert!(report.dominant);

        // An even split does not cross a majority threshold.
        let ledger = ProvenanceLedger::new();
        ledger.append(draft("a", 0.5, "c")).unwrap();
        ledger.append(draft("b", 0.5, "c")).unwrap();
        let report = ProvenanceLedger::dominance(&ledger.resolve("c"), 0.5).unwrap();
        assert!(!report.dominant);
    }

    #[test]
    fn stale_records_are_flagged_not_hidden() {
        let mut old = draft("archive", 0.9, "c");
        old.timestamp = Utc::now() - Duration::days(30);
        let ledger = ProvenanceLedger::new();
        let id = ledger.append(old).unwrap();
        let record = ledger.get(&id).unwrap();
        assert!(record.is_stale(Duration::days(7), Utc::now()));
        assert_eq!(ledger.resolve("c").len(), 1);
    }
}
