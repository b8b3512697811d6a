use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::reconcile::ReconcileMode;
use crate::version::Version;

pub const DEFAULT_VERSION_TABLE: &str = "schema_migrations";
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Table holding the applied-version rows. Interpolated into SQL, so it
    /// must be a plain identifier.
    pub version_table: String,
    /// Default chunk size for backfill steps.
    pub batch_size: usize,
    pub reconcile_mode: ReconcileMode,
    /// Applied versions that status reporting tolerates even though no
    /// registered migration carries them.
    pub known_unknown_versions: Vec<Version>,
    pub busy_timeout_ms: u64,
    /// When set, a backup of the database is written here before any run
    /// with pending work.
    pub backup_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version_table: DEFAULT_VERSION_TABLE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            reconcile_mode: ReconcileMode::default(),
            known_unknown_versions: Vec::new(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            backup_dir: None,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns `Parse` for malformed YAML or unknown fields, and `Invalid`
    /// when a value fails validation.
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = if input.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(input)?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `Read` when the file cannot be read, otherwise see
    /// [`EngineConfig::from_yaml_str`].
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&input)
    }

    /// # Errors
    /// Returns `Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier(&self.version_table)?;
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if let Some(version) = self
            .known_unknown_versions
            .iter()
            .find(|version| version.get() <= 0)
        {
            return Err(ConfigError::Invalid(format!(
                "known_unknown_versions contains non-positive version {version}"
            )));
        }
        Ok(())
    }
}

/// Accept `[A-Za-z_][A-Za-z0-9_]*`, at most 64 bytes.
///
/// # Errors
/// Returns `Invalid` for anything else.
pub fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_');
    let valid_rest = chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if !valid_start || !valid_rest || name.len() > 64 {
        return Err(ConfigError::Invalid(format!(
            "version_table {name:?} is not a plain SQL identifier"
        )));
    }
    Ok(())
}
