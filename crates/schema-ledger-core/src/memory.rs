//! In-memory `VersionStore` used to exercise the engine without a database.
//!
//! A step sees a private copy of the store state through `MemoryTx`; the copy
//! replaces the committed state only after the step and its bookkeeping both
//! succeed, which gives the same all-or-nothing behavior as a real transaction.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use time::OffsetDateTime;

use crate::error::StepFailure;
use crate::registry::MigrationDescriptor;
use crate::store::{AppliedVersionRecord, VersionStore};
use crate::version::{Direction, Version};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct MemoryState {
    applied: BTreeMap<Version, AppliedVersionRecord>,
    tables: BTreeMap<String, Vec<String>>,
}

/// Transaction handle for `InMemoryVersionStore`. Tables are named lists of
/// string rows.
#[derive(Debug)]
pub struct MemoryTx {
    state: RefCell<MemoryState>,
}

impl MemoryTx {
    pub fn create_table(&self, table: &str) {
        self.state
            .borrow_mut()
            .tables
            .entry(table.to_string())
            .or_default();
    }

    /// # Errors
    /// Returns an error when the table does not exist.
    pub fn drop_table(&self, table: &str) -> anyhow::Result<()> {
        self.state
            .borrow_mut()
            .tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| anyhow!("no such table: {table}"))
    }

    /// # Errors
    /// Returns an error when the table does not exist.
    pub fn insert(&self, table: &str, row: impl Into<String>) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("no such table: {table}"))?;
        rows.push(row.into());
        Ok(())
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Option<Vec<String>> {
        self.state.borrow().tables.get(table).cloned()
    }

    #[must_use]
    pub fn has_table(&self, table: &str) -> bool {
        self.state.borrow().tables.contains_key(table)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryVersionStore {
    state: MemoryState,
    version_writes: usize,
    failing_bookkeeping: BTreeSet<Version>,
    unreadable: bool,
    prepared_runs: Vec<(Direction, Vec<Version>)>,
}

impl InMemoryVersionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the Version Store write for `version` fail after its step ran.
    pub fn fail_bookkeeping_for(&mut self, version: Version) {
        self.failing_bookkeeping.insert(version);
    }

    pub fn clear_faults(&mut self) {
        self.failing_bookkeeping.clear();
        self.unreadable = false;
    }

    /// Make every read of applied versions fail, as a lost connection would.
    pub fn set_unreadable(&mut self, unreadable: bool) {
        self.unreadable = unreadable;
    }

    /// Number of committed inserts and deletes against the version rows.
    #[must_use]
    pub fn version_writes(&self) -> usize {
        self.version_writes
    }

    /// Runs announced through `before_run`, oldest first.
    #[must_use]
    pub fn prepared_runs(&self) -> &[(Direction, Vec<Version>)] {
        &self.prepared_runs
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Option<Vec<String>> {
        self.state.tables.get(table).cloned()
    }

    /// Record versions as applied without running their steps.
    pub fn seed_applied(&mut self, versions: impl IntoIterator<Item = Version>) {
        for version in versions {
            self.state.applied.insert(
                version,
                AppliedVersionRecord {
                    version,
                    name: format!("seeded {version}"),
                    applied_at: OffsetDateTime::UNIX_EPOCH,
                },
            );
        }
    }

    /// Compare committed data and version rows, ignoring timestamps.
    #[must_use]
    pub fn same_contents(&self, other: &Self) -> bool {
        let versions = |store: &Self| store.state.applied.keys().copied().collect::<Vec<_>>();
        versions(self) == versions(other) && self.state.tables == other.state.tables
    }
}

impl VersionStore for InMemoryVersionStore {
    type Handle = MemoryTx;

    fn applied_versions(&mut self) -> anyhow::Result<Vec<AppliedVersionRecord>> {
        if self.unreadable {
            return Err(anyhow!("version store is unreachable"));
        }
        Ok(self.state.applied.values().cloned().collect())
    }

    fn execute_step(
        &mut self,
        descriptor: &MigrationDescriptor<MemoryTx>,
        direction: Direction,
    ) -> Result<(), StepFailure> {
        let tx = MemoryTx {
            state: RefCell::new(self.state.clone()),
        };

        descriptor
            .step(direction)
            .run(&tx)
            .map_err(StepFailure::step)?;

        if self.failing_bookkeeping.contains(&descriptor.version) {
            return Err(StepFailure::bookkeeping(anyhow!(
                "simulated version store failure for {}",
                descriptor.version
            )));
        }

        {
            let mut state = tx.state.borrow_mut();
            match direction {
                Direction::Forward => {
                    if state.applied.contains_key(&descriptor.version) {
                        return Err(StepFailure::bookkeeping(anyhow!(
                            "version {} is already recorded",
                            descriptor.version
                        )));
                    }
                    state.applied.insert(
                        descriptor.version,
                        AppliedVersionRecord {
                            version: descriptor.version,
                            name: descriptor.name.clone(),
                            applied_at: OffsetDateTime::now_utc(),
                        },
                    );
                }
                Direction::Reverse => {
                    if state.applied.remove(&descriptor.version).is_none() {
                        return Err(StepFailure::bookkeeping(anyhow!(
                            "version {} is not recorded",
                            descriptor.version
                        )));
                    }
                }
            }
        }

        self.state = tx.state.into_inner();
        self.version_writes += 1;
        Ok(())
    }

    fn before_run(&mut self, pending: &[Version], direction: Direction) -> anyhow::Result<()> {
        self.prepared_runs.push((direction, pending.to_vec()));
        Ok(())
    }
}
