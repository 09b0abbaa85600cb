//! Configuration loading with priority: file → environment → embedded.
//!
//! Implements: REQ-CFG-001/F-002

use std::env;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

use super::{ConfigError, CoreConfig};

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Config file on disk
    File {
        /// Path the config was read from
        path: String,
    },
    /// `STAGEGATE_CONFIG_YAML` environment variable
    Environment,
    /// Compiled-in defaults
    Embedded,
}

fn parse(yaml: &str, origin: &str) -> Result<CoreConfig, ConfigError> {
    let config: CoreConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::LoadError {
        path: origin.to_string(),
        reason: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

/// Load configuration with priority order.
///
/// # Priority
/// 1. File at `$STAGEGATE_CONFIG` (default: `/etc/stagegate/config.yaml`)
/// 2. Inline document in `$STAGEGATE_CONFIG_YAML`
/// 3. Embedded defaults
///
/// # Errors
/// Returns `ConfigError::LoadError` if a configured file exists but cannot
/// be read or parsed. File-not-found falls through to the next tier;
/// unreadable-but-present fails closed.
pub fn load_config() -> Result<(CoreConfig, ConfigSource), ConfigError> {
    let file_path =
        env::var("STAGEGATE_CONFIG").unwrap_or_else(|_| "/etc/stagegate/config.yaml".to_string());

    if Path::new(&file_path).exists() {
        info!(path = %file_path, "Loading configuration from file");
        let content = fs::read_to_string(&file_path).map_err(|e| ConfigError::LoadError {
            path: file_path.clone(),
            reason: e.to_string(),
        })?;
        let config = parse(&content, &file_path)?;
        return Ok((config, ConfigSource::File { path: file_path }));
    }

    if let Ok(inline) = env::var("STAGEGATE_CONFIG_YAML") {
        info!("Loading configuration from environment variable");
        let config = parse(&inline, "STAGEGATE_CONFIG_YAML")?;
        return Ok((config, ConfigSource::Environment));
    }

    warn!("Using embedded default configuration");
    Ok((embedded_default_config()?, ConfigSource::Embedded))
}

/// The compiled-in default configuration.
pub fn embedded_default_config() -> Result<CoreConfig, ConfigError> {
    parse(include_str!("defaults.yaml"), "embedded")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn embedded_config_parses_and_validates() {
        let config = embedded_default_config().unwrap();
        assert_eq!(config.budgets.max_steps, 12);
        assert_eq!(config.retry.max_produce_retries, 2);
        assert_eq!(config.provenance.min_sources, 2);
    }

    #[test]
    #[serial]
    fn env_document_overrides_embedded() {
        unsafe {
            env::set_var("STAGEGATE_CONFIG", "/nonexistent/config.yaml");
            env::set_var(
                "STAGEGATE_CONFIG_YAML",
                "schema: 1\nbudgets:\n  max_steps: 3\n  max_tool_calls: 1\n",
            );
        }
        let (config, source) = load_config().unwrap();
        assert_eq!(source, ConfigSource::Environment);
        assert_eq!(config.budgets.max_steps, 3);
        // Unspecified sections keep their defaults.
        assert_eq!(config.retry.max_produce_retries, 2);
        unsafe {
            env::remove_var("STAGEGATE_CONFIG");
            env::remove_var("STAGEGATE_CONFIG_YAML");
        }
    }

    #[test]
    #[serial]
    fn present_but_invalid_file_fails_closed() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = fs::File::create(&path).unwrap();
        write!(f, "schema: 99").unwrap();

        unsafe {
            env::set_var("STAGEGATE_CONFIG", &path);
            env::remove_var("STAGEGATE_CONFIG_YAML");
        }
        let err = load_config().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedSchema { .. }));
        unsafe {
            env::remove_var("STAGEGATE_CONFIG");
        }
    }
}
