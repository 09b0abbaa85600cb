//! Policy rule store: immutable, versioned, append-only.
//!
//! Implements: REQ-POL-001 (Policy Store)
//!
//! The store holds the rule set every governance decision consults. Rules
//! are never edited or deleted; the only write path is an append that
//! produces a new store version, and the only caller of that path outside
//! the initial load is the promotion ceremony (REQ-PRM-001). Reads take a
//! consistent snapshot and never block on appends.

pub mod loader;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable identifier of a policy rule (`pol_` prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    /// Creates a new random rule ID.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("pol_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Wraps a known rule ID (seeded defaults, journal recovery).
    #[must_use]
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Rules
// ============================================================================

/// Category of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// A standing value the system optimizes for
    Value,
    /// A hard constraint no automated component may cross
    Invariant,
    /// A soft signal used in risk scoring
    Heuristic,
    /// A recorded preference between competing concerns
    Tradeoff,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value => write!(f, "value"),
            Self::Invariant => write!(f, "invariant"),
            Self::Heuristic => write!(f, "heuristic"),
            Self::Tradeoff => write!(f, "tradeoff"),
        }
    }
}

/// A single immutable policy rule.
///
/// Implements: REQ-POL-001/F-001
///
/// Once persisted, a rule is never mutated or deleted. New knowledge arrives
/// as new rules (new IDs) appended to a new store version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Stable rule identifier
    pub id: RuleId,
    /// Rule category
    pub kind: RuleKind,
    /// Human-readable rule text
    pub text: String,
    /// Store version that introduced this rule
    pub version: u64,
    /// When the rule was persisted
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by the policy store and its loader.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A referenced rule does not exist in any store version.
    #[error("unknown policy rule '{rule_id}'")]
    UnknownRule {
        /// The dangling reference
        rule_id: RuleId,
    },

    /// A rule with this ID already exists; rules are never replaced.
    #[error("policy rule '{rule_id}' already exists; rules are append-only")]
    DuplicateRule {
        /// The colliding ID
        rule_id: RuleId,
    },

    /// A configured rule file exists but could not be read or parsed.
    #[error("failed to load policy rules from '{path}': {reason}")]
    LoadError {
        /// Source path involved
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// Durable journal append failed.
    #[error(transparent)]
    Journal(#[from] crate::journal::JournalError),
}

// ============================================================================
// Store
// ============================================================================

/// Immutable view of one store version.
///
/// Snapshots are cheap to clone and safe to hold across stage execution: a
/// task assessed against version N keeps reading version N even while the
/// promotion ceremony appends version N+1.
#[derive(Debug)]
pub struct PolicySnapshot {
    version: u64,
    rules: Vec<Arc<PolicyRule>>,
    by_id: HashMap<RuleId, Arc<PolicyRule>>,
}

impl PolicySnapshot {
    fn from_rules(version: u64, rules: Vec<Arc<PolicyRule>>) -> Self {
        let by_id = rules
            .iter()
            .map(|rule| (rule.id.clone(), rule.clone()))
            .collect();
        Self {
            version,
            rules,
            by_id,
        }
    }

    /// Store version this snapshot was taken from.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// All rules, in append order.
    #[must_use]
    pub fn rules(&self) -> &[Arc<PolicyRule>] {
        &self.rules
    }

    /// Looks up a rule by ID.
    #[must_use]
    pub fn get(&self, id: &RuleId) -> Option<&Arc<PolicyRule>> {
        self.by_id.get(id)
    }

    /// True if every given reference resolves to a rule in this snapshot.
    #[must_use]
    pub fn resolves_all(&self, refs: &[RuleId]) -> bool {
        refs.iter().all(|id| self.by_id.contains_key(id))
    }

    /// Rules of one kind, in append order.
    pub fn of_kind(&self, kind: RuleKind) -> impl Iterator<Item = &Arc<PolicyRule>> {
        self.rules.iter().filter(move |rule| rule.kind == kind)
    }
}

/// The versioned policy store.
///
/// Implements: REQ-POL-001/F-002
///
/// Reads go through [`PolicyStore::snapshot`] and are lock-free; the append
/// path serializes behind a single mutex and publishes a whole new version
/// atomically. No in-place mutation exists.
pub struct PolicyStore {
    current: ArcSwap<PolicySnapshot>,
    append_lock: Mutex<()>,
    journal: Option<crate::journal::JsonlJournal>,
}

impl fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snap = self.current.load();
        f.debug_struct("PolicyStore")
            .field("version", &snap.version)
            .field("rules", &snap.rules.len())
            .field("journaled", &self.journal.is_some())
            .finish()
    }
}

impl PolicyStore {
    /// Creates a store seeded with the given rules as version 1.
    #[must_use]
    pub fn new(seed: Vec<PolicyRule>) -> Self {
        let rules: Vec<Arc<PolicyRule>> = seed.into_iter().map(Arc::new).collect();
        Self {
            current: ArcSwap::from_pointee(PolicySnapshot::from_rules(1, rules)),
            append_lock: Mutex::new(()),
            journal: None,
        }
    }

    /// Creates a store that also journals every rule to `<dir>/policy.jsonl`.
    ///
    /// The seed rules are journaled immediately so the durable log is a
    /// complete record of every version from creation.
    pub fn with_journal(
        seed: Vec<PolicyRule>,
        dir: &std::path::Path,
    ) -> Result<Self, PolicyError> {
        let journal = crate::journal::JsonlJournal::open(dir, "policy")?;
        for rule in &seed {
            journal.append(rule)?;
        }
        let rules: Vec<Arc<PolicyRule>> = seed.into_iter().map(Arc::new).collect();
        Ok(Self {
            current: ArcSwap::from_pointee(PolicySnapshot::from_rules(1, rules)),
            append_lock: Mutex::new(()),
            journal: Some(journal),
        })
    }

    /// Takes a consistent snapshot of the current version.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    /// Appends a rule, publishing a new store version.
    ///
    /// Implements: REQ-POL-001/F-002, REQ-PRM-001/F-004
    ///
    /// This is the only write path. Callers outside the initial load must be
    /// the promotion ceremony; nothing here re-checks that, but the ceremony
    /// is the only code handed an exclusive reference to the store's append
    /// capability by [`crate::core::GovernanceCore`].
    pub fn append(&self, kind: RuleKind, text: String) -> Result<Arc<PolicyRule>, PolicyError> {
        self.append_with_id(RuleId::new(), kind, text)
    }

    /// Appends a rule under a caller-chosen ID.
    pub fn append_with_id(
        &self,
        id: RuleId,
        kind: RuleKind,
        text: String,
    ) -> Result<Arc<PolicyRule>, PolicyError> {
        let _guard = self.append_lock.lock().expect("policy append lock poisoned");

        let prev = self.current.load_full();
        if prev.by_id.contains_key(&id) {
            return Err(PolicyError::DuplicateRule { rule_id: id });
        }

        let rule = Arc::new(PolicyRule {
            id,
            kind,
            text,
            version: prev.version + 1,
            created_at: Utc::now(),
        });

        if let Some(journal) = &self.journal {
            journal.append(rule.as_ref())?;
        }

        let mut rules = prev.rules.clone();
        rules.push(rule.clone());
        let next = PolicySnapshot::from_rules(prev.version + 1, rules);
        self.current.store(Arc::new(next));

        tracing::info!(
            rule_id = %rule.id,
            kind = %rule.kind,
            version = rule.version,
            "Policy rule appended"
        );
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Vec<PolicyRule> {
        loader::embedded_default_rules().expect("embedded rules parse")
    }

    #[test]
    fn snapshot_is_stable_across_appends() {
        let store = PolicyStore::new(seed());
        let before = store.snapshot();
        let count = before.rules().len();

        store
            .append(RuleKind::Heuristic, "drafts stay internal".to_string())
            .unwrap();

        // The old snapshot is untouched; a fresh one sees the append.
        assert_eq!(before.rules().len(), count);
        let after = store.snapshot();
        assert_eq!(after.rules().len(), count + 1);
        assert_eq!(after.version(), before.version() + 1);
    }

    #[test]
    fn duplicate_rule_id_is_rejected() {
        let store = PolicyStore::new(seed());
        let id = RuleId::from_raw("pol_twice");
        store
            .append_with_id(id.clone(), RuleKind::Value, "once".into())
            .unwrap();
        let err = store
            .append_with_id(id, RuleKind::Value, "twice".into())
            .unwrap_err();
        assert!(matches!(err, PolicyError::DuplicateRule { .. }));
    }

    #[test]
    fn resolves_all_spots_dangling_refs() {
        let store = PolicyStore::new(seed());
        let snap = store.snapshot();
        let known = snap.rules()[0].id.clone();
        assert!(snap.resolves_all(&[known.clone()]));
        assert!(!snap.resolves_all(&[known, RuleId::from_raw("pol_missing")]));
    }

    #[test]
    fn journaled_store_records_every_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::with_journal(seed(), dir.path()).unwrap();
        let seeded = store.snapshot().rules().len();
        store
            .append(RuleKind::Tradeoff, "prefer refusal over guesswork".into())
            .unwrap();

        let rows: Vec<PolicyRule> =
            crate::journal::read_all(&dir.path().join("policy.jsonl")).unwrap();
        assert_eq!(rows.len(), seeded + 1);
    }
}
