//! Operator configuration for the migration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedAlertingSection {
    /// Desired state: migrated when true, legacy when false.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for UnifiedAlertingSection {
    fn default() -> Self {
        Self { enabled: default_enabled() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyAlertingSection {
    /// Unset means "not configured", which is not the same as disabled.
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub unified_alerting: UnifiedAlertingSection,
    #[serde(default)]
    pub alerting: LegacyAlertingSection,
    /// Allow reverting to legacy alerting, deleting unified alerting data.
    #[serde(default)]
    pub force_migration: bool,
    /// Root of the `alerting/<org>/silences` files.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
}

fn default_enabled() -> bool {
    true
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            unified_alerting: UnifiedAlertingSection::default(),
            alerting: LegacyAlertingSection::default(),
            force_migration: false,
            data_path: default_data_path(),
        }
    }
}

impl MigrationConfig {
    /// Parse a YAML configuration file from a path
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed or validated.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(content.as_str())
    }

    /// Parse a YAML configuration from a string
    ///
    /// # Errors
    /// Returns an error when the document cannot be parsed or validated.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document means "all defaults".
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: MigrationConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Validation`] for an empty `data_path`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation("data_path cannot be empty".into()));
        }
        Ok(())
    }

    /// True only when legacy alerting is explicitly turned off.
    #[must_use]
    pub fn legacy_alerting_disabled(&self) -> bool {
        self.alerting.enabled == Some(false)
    }
}
