use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::StepFailure;
use crate::registry::MigrationDescriptor;
use crate::version::{Direction, Version};

/// One row of the Version Store. Written in the same transaction as the
/// forward step it records and deleted only by that version's reverse step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedVersionRecord {
    pub version: Version,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
}

/// Persistent bookkeeping of applied versions inside the target database,
/// plus the transaction plumbing steps run in.
pub trait VersionStore {
    /// Transaction handle passed to migration steps.
    type Handle: 'static;

    /// All applied versions, ascending.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    fn applied_versions(&mut self) -> anyhow::Result<Vec<AppliedVersionRecord>>;

    /// Highest applied version, or `Version::ZERO` when nothing is applied.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    fn current_version(&mut self) -> anyhow::Result<Version> {
        Ok(self
            .applied_versions()?
            .iter()
            .map(|record| record.version)
            .max()
            .unwrap_or(Version::ZERO))
    }

    /// Run one step of `descriptor` inside a single transaction and, in that
    /// same transaction, insert (forward) or delete (reverse) its version row.
    ///
    /// Implementations must roll the transaction back on any failure so that
    /// neither the step's changes nor the bookkeeping survive.
    ///
    /// # Errors
    /// Returns the phase that failed and its cause.
    fn execute_step(
        &mut self,
        descriptor: &MigrationDescriptor<Self::Handle>,
        direction: Direction,
    ) -> Result<(), StepFailure>;

    /// Called once per run that has pending work, before the first step.
    ///
    /// # Errors
    /// Returns an error to abort the run before anything is executed.
    fn before_run(&mut self, _pending: &[Version], _direction: Direction) -> anyhow::Result<()> {
        Ok(())
    }
}
