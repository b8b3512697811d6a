use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::version::{Direction, Version};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("migration version {0} is already registered")]
    Duplicate(Version),
    #[error("migration version {0} is invalid: versions must be positive")]
    InvalidVersion(Version),
    #[error("migration {0} has an empty name")]
    EmptyName(Version),
}

/// Where inside a transactional step execution a failure happened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Begin,
    Step,
    Bookkeeping,
    Commit,
}

impl StepPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Step => "step",
            Self::Bookkeeping => "bookkeeping",
            Self::Commit => "commit",
        }
    }
}

impl Display for StepPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a `VersionStore` after it has rolled the step's
/// transaction back.
#[derive(Debug, thiserror::Error)]
#[error("{phase} failed: {source}")]
pub struct StepFailure {
    pub phase: StepPhase,
    #[source]
    pub source: BoxError,
}

impl StepFailure {
    pub fn new(phase: StepPhase, source: impl Into<BoxError>) -> Self {
        Self {
            phase,
            source: source.into(),
        }
    }

    pub fn begin(source: impl Into<BoxError>) -> Self {
        Self::new(StepPhase::Begin, source)
    }

    pub fn step(source: impl Into<BoxError>) -> Self {
        Self::new(StepPhase::Step, source)
    }

    pub fn bookkeeping(source: impl Into<BoxError>) -> Self {
        Self::new(StepPhase::Bookkeeping, source)
    }

    pub fn commit(source: impl Into<BoxError>) -> Self {
        Self::new(StepPhase::Commit, source)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to resolve applied versions: {source}")]
    Resolution {
        #[source]
        source: BoxError,
    },
    #[error("migration {version} ({name}) failed in {direction} {phase}: {source}")]
    Step {
        version: Version,
        name: String,
        direction: Direction,
        phase: StepPhase,
        #[source]
        source: BoxError,
    },
    #[error("applied versions have a gap: {missing:?} are unapplied below {current}")]
    MissingPredecessors {
        current: Version,
        missing: Vec<Version>,
    },
    #[error("failed to prepare run: {source}")]
    Prepare {
        #[source]
        source: BoxError,
    },
    #[error("migration version {0} is not registered")]
    UnknownVersion(Version),
    #[error("migration version {0} has already been applied")]
    AlreadyApplied(Version),
    #[error("no pending migration to apply")]
    NothingPending,
}

impl EngineError {
    pub(crate) fn resolution(source: impl Into<BoxError>) -> Self {
        Self::Resolution {
            source: source.into(),
        }
    }

    pub(crate) fn prepare(source: impl Into<BoxError>) -> Self {
        Self::Prepare {
            source: source.into(),
        }
    }

    /// Version of the migration whose step failed, if this is a step failure.
    #[must_use]
    pub fn failed_version(&self) -> Option<Version> {
        match self {
            Self::Step { version, .. } => Some(*version),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch size must be at least 1, got {0}")]
    InvalidBatchSize(usize),
    #[error("batch {batch_index} (items from offset {offset}) failed: {source}")]
    Apply {
        batch_index: usize,
        offset: usize,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconcileError {
    #[error("strict reconciliation rejected {count} record(s); first: {first}")]
    Rejected { count: usize, first: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
