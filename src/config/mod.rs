//! Core configuration schema.
//!
//! Implements: REQ-CFG-001 (Configuration)
//!
//! Everything a deployment tunes lives here: budgets, retry bounds, worker
//! limits, risk keyword tables and signal precedence, provenance minimums,
//! and promotion ceremony knobs. Loading follows the file → env → embedded
//! priority chain in [`loader`].

pub mod loader;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configured file exists but could not be read or parsed.
    #[error("failed to load config from '{path}': {reason}")]
    LoadError {
        /// Source involved
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// Schema version not supported.
    #[error("unsupported config schema version {found} (expected {expected})")]
    UnsupportedSchema {
        /// Version found in the file
        found: u32,
        /// Version this build understands
        expected: u32,
    },

    /// A value failed semantic validation.
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue {
        /// Dotted field path
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Schema version this build understands.
pub const SCHEMA_VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Risk signals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Risk signals in tie-break precedence order. When several fire, the
/// earliest entry in `risk.precedence` wins the audit rationale; the tier
/// itself always resolves toward the more conservative result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSignal {
    /// Declared or detected irreversible / financial / legal impact
    IrreversibleImpact,
    /// Goal conflicts with a policy invariant
    PolicyConflict,
    /// Projected resource use breaches the declared budget
    BudgetBreach,
    /// Keyword heuristic score
    Heuristic,
}

impl std::fmt::Display for RiskSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::IrreversibleImpact => "irreversible_impact",
            Self::PolicyConflict => "policy_conflict",
            Self::BudgetBreach => "budget_breach",
            Self::Heuristic => "heuristic",
        };
        f.write_str(s)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cross-task concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum tasks executing stages at once. Parked tasks do not count.
    pub max_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// Per-task default budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Stage-transition step quota
    pub max_steps: u32,
    /// External tool-call quota
    pub max_tool_calls: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_steps: 12,
            max_tool_calls: 5,
        }
    }
}

/// Bounded-retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// How many times Reconcile may send a task back to Produce before the
    /// retry budget forces escalation.
    pub max_produce_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_produce_retries: 2,
        }
    }
}

/// Risk assessment knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Signal tie-break precedence, strongest first
    pub precedence: Vec<RiskSignal>,
    /// Action verbs scoring HIGH
    pub high_keywords: Vec<String>,
    /// Action verbs scoring MEDIUM
    pub medium_keywords: Vec<String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            precedence: vec![
                RiskSignal::IrreversibleImpact,
                RiskSignal::PolicyConflict,
                RiskSignal::BudgetBreach,
                RiskSignal::Heuristic,
            ],
            high_keywords: [
                "send", "post", "trade", "delete", "publish", "transfer", "wire", "pay",
            ]
            .map(String::from)
            .to_vec(),
            medium_keywords: ["modify", "update", "schedule", "compose"]
                .map(String::from)
                .to_vec(),
        }
    }
}

/// Provenance requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRules {
    /// Minimum distinct sources at submission (without an override)
    pub min_sources: usize,
    /// Share above which one source dominates an output's backing records
    pub dominance_share: f64,
    /// Days after which a record is flagged stale when resolved
    pub stale_after_days: i64,
}

impl Default for ProvenanceRules {
    fn default() -> Self {
        Self {
            min_sources: 2,
            dominance_share: 0.5,
            stale_after_days: 7,
        }
    }
}

/// Promotion ceremony knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionConfig {
    /// Minimum episodic occurrences before a pattern is promotable
    pub min_occurrences: usize,
    /// Days a pending proposal lives before it expires
    pub proposal_ttl_days: i64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            min_occurrences: 2,
            proposal_ttl_days: 14,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top level
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Schema version (must be 1)
    pub schema: u32,
    /// Directory for the four durable logs; in-memory when unset
    pub state_dir: Option<PathBuf>,
    /// Cross-task concurrency
    pub concurrency: ConcurrencyConfig,
    /// Per-task default budgets
    pub budgets: BudgetConfig,
    /// Bounded-retry policy
    pub retry: RetryConfig,
    /// Risk assessment knobs
    pub risk: RiskConfig,
    /// Provenance requirements
    pub provenance: ProvenanceRules,
    /// Promotion ceremony knobs
    pub promotion: PromotionConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            schema: SCHEMA_VERSION,
            state_dir: None,
            concurrency: ConcurrencyConfig::default(),
            budgets: BudgetConfig::default(),
            retry: RetryConfig::default(),
            risk: RiskConfig::default(),
            provenance: ProvenanceRules::default(),
            promotion: PromotionConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Semantic validation beyond what serde can express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema != SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedSchema {
                found: self.schema,
                expected: SCHEMA_VERSION,
            });
        }
        if self.concurrency.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "concurrency.max_workers",
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.provenance.dominance_share) {
            return Err(ConfigError::InvalidValue {
                field: "provenance.dominance_share",
                reason: format!("{} outside [0, 1]", self.provenance.dominance_share),
            });
        }
        if self.provenance.min_sources == 0 {
            return Err(ConfigError::InvalidValue {
                field: "provenance.min_sources",
                reason: "must be at least 1".into(),
            });
        }
        if self.risk.precedence.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "risk.precedence",
                reason: "must name at least one signal".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut config = CoreConfig::default();
        config.provenance.dominance_share = 1.5;
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidValue { field, .. } if field == "provenance.dominance_share"
        ));

        let mut config = CoreConfig::default();
        config.schema = 9;
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::UnsupportedSchema { .. }
        ));
    }
}
