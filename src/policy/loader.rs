//! Rule-set loading with priority: file → environment → embedded.
//!
//! Implements: REQ-POL-001/F-003 (Rule Loading)

use std::env;
use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use super::{PolicyError, PolicyRule, RuleId, RuleKind};

/// Where the active rule set came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    /// Rule file on disk
    File {
        /// Path the rules were read from
        path: String,
    },
    /// `STAGEGATE_RULES` environment variable
    Environment,
    /// Compiled-in default rule set
    Embedded,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    id: String,
    kind: RuleKind,
    text: String,
}

fn parse_rules(yaml: &str, origin: &str) -> Result<Vec<PolicyRule>, PolicyError> {
    let file: RuleFile = serde_yaml::from_str(yaml).map_err(|e| PolicyError::LoadError {
        path: origin.to_string(),
        reason: e.to_string(),
    })?;
    let now = Utc::now();
    Ok(file
        .rules
        .into_iter()
        .map(|entry| PolicyRule {
            id: RuleId::from_raw(entry.id),
            kind: entry.kind,
            text: entry.text.trim().to_string(),
            version: 1,
            created_at: now,
        })
        .collect())
}

/// Load the seed rule set with priority order.
///
/// Implements: REQ-POL-001/F-003
///
/// # Priority
/// 1. Rule file at `$STAGEGATE_RULE_FILE` (default: `/etc/stagegate/rules.yaml`)
/// 2. Environment variable `$STAGEGATE_RULES` (inline YAML)
/// 3. Embedded default rules
///
/// # Errors
/// Returns `PolicyError::LoadError` if a configured rule file exists but
/// cannot be read or parsed (fail-closed: a transient I/O error must not
/// silently fall through to the embedded set).
pub fn load_rules() -> Result<(Vec<PolicyRule>, RuleSource), PolicyError> {
    let file_path =
        env::var("STAGEGATE_RULE_FILE").unwrap_or_else(|_| "/etc/stagegate/rules.yaml".to_string());

    if Path::new(&file_path).exists() {
        info!(path = %file_path, "Loading policy rules from file");
        let content = fs::read_to_string(&file_path).map_err(|e| PolicyError::LoadError {
            path: file_path.clone(),
            reason: e.to_string(),
        })?;
        let rules = parse_rules(&content, &file_path)?;
        return Ok((rules, RuleSource::File { path: file_path }));
    }

    if let Ok(inline) = env::var("STAGEGATE_RULES") {
        info!("Loading policy rules from environment variable");
        let rules = parse_rules(&inline, "STAGEGATE_RULES")?;
        return Ok((rules, RuleSource::Environment));
    }

    warn!("Using embedded default policy rules");
    Ok((embedded_default_rules()?, RuleSource::Embedded))
}

/// The compiled-in default rule set.
///
/// Implements: REQ-POL-001/F-007
pub fn embedded_default_rules() -> Result<Vec<PolicyRule>, PolicyError> {
    parse_rules(include_str!("defaults.yaml"), "embedded")
}
