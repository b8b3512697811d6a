use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span};
use ulid::Ulid;

use crate::error::EngineError;
use crate::registry::{MigrationDescriptor, Registry};
use crate::status::{compare_versions, MigrationStatus};
use crate::store::{AppliedVersionRecord, VersionStore};
use crate::version::{Direction, Version};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Resolving,
    Executing {
        version: Version,
        direction: Direction,
    },
    Committed {
        version: Version,
        direction: Direction,
    },
    Failed {
        version: Version,
        direction: Direction,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: Ulid,
    pub direction: Direction,
    pub from_version: Version,
    pub to_version: Version,
    pub executed: Vec<Version>,
}

impl RunReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.executed.is_empty()
    }
}

/// Snapshot of the store taken while resolving.
struct Resolved {
    current: Version,
    pending: Vec<Version>,
}

/// Sequencing engine: applies registered migrations one transaction at a
/// time, strictly in ascending version order, and halts on the first failure.
///
/// Not meant for concurrent use against one database; callers serialize
/// runners externally.
pub struct Runner<'a, S: VersionStore> {
    registry: &'a Registry<S::Handle>,
    store: &'a mut S,
    state: RunnerState,
    known_unknowns: Vec<Version>,
}

impl<'a, S: VersionStore> Runner<'a, S> {
    pub fn new(registry: &'a Registry<S::Handle>, store: &'a mut S) -> Self {
        Self {
            registry,
            store,
            state: RunnerState::Idle,
            known_unknowns: Vec::new(),
        }
    }

    /// Applied versions that `status` should not report as unknown.
    #[must_use]
    pub fn with_known_unknowns(mut self, versions: impl IntoIterator<Item = Version>) -> Self {
        self.known_unknowns = versions.into_iter().collect();
        self
    }

    #[must_use]
    pub fn state(&self) -> RunnerState {
        self.state
    }

    #[must_use]
    pub fn registry(&self) -> &'a Registry<S::Handle> {
        self.registry
    }

    #[must_use]
    pub fn store(&self) -> &S {
        self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        self.store
    }

    /// # Errors
    /// Returns a resolution error when the Version Store cannot be read.
    pub fn current_version(&mut self) -> Result<Version, EngineError> {
        self.store
            .current_version()
            .map_err(EngineError::resolution)
    }

    /// # Errors
    /// Returns a resolution error when the Version Store cannot be read.
    pub fn applied_versions(&mut self) -> Result<Vec<AppliedVersionRecord>, EngineError> {
        self.store
            .applied_versions()
            .map_err(EngineError::resolution)
    }

    /// Compare registered and applied versions without changing anything.
    ///
    /// # Errors
    /// Returns a resolution error when the Version Store cannot be read.
    pub fn status(&mut self) -> Result<MigrationStatus, EngineError> {
        let applied = self
            .applied_versions()?
            .into_iter()
            .map(|record| record.version)
            .collect::<Vec<_>>();
        Ok(compare_versions(
            &self.registry.versions(),
            &applied,
            &self.known_unknowns,
        ))
    }

    /// Registered versions that a `run_to_latest` would apply, ascending.
    ///
    /// # Errors
    /// Returns a resolution error, or `MissingPredecessors` when the applied
    /// versions are not a prefix of the registry.
    pub fn pending(&mut self) -> Result<Vec<Version>, EngineError> {
        Ok(self.resolve()?.pending)
    }

    /// The version `run_one_step` would apply next, if any.
    ///
    /// # Errors
    /// See [`Runner::pending`].
    pub fn next_pending(&mut self) -> Result<Option<Version>, EngineError> {
        Ok(self.resolve()?.pending.first().copied())
    }

    /// Apply exactly the next pending version. Returns `None` when already up
    /// to date.
    ///
    /// # Errors
    /// Returns the first resolution, preparation, or step failure; a failed step
    /// leaves its version unrecorded.
    pub fn run_one_step(&mut self) -> Result<Option<Version>, EngineError> {
        let run_id = Ulid::new();
        let span = info_span!("migrate_one", %run_id);
        let _guard = span.enter();

        let Some(descriptor) = self.resolve_next()? else {
            info!("schema is up to date; nothing to apply");
            return Ok(None);
        };
        self.prepare(&[descriptor.version], Direction::Forward)?;
        self.execute(descriptor, Direction::Forward)?;
        self.state = RunnerState::Idle;
        Ok(Some(descriptor.version))
    }

    /// Apply every pending version in ascending order.
    ///
    /// # Errors
    /// See [`Runner::run_one_step`]. Versions committed before a failure stay
    /// applied.
    pub fn run_to_latest(&mut self) -> Result<RunReport, EngineError> {
        self.run_forward(None)
    }

    /// Apply every pending version `<= target`.
    ///
    /// # Errors
    /// See [`Runner::run_one_step`].
    pub fn run_to(&mut self, target: Version) -> Result<RunReport, EngineError> {
        self.run_forward(Some(target))
    }

    /// Invoke reverse steps for every applied version greater than
    /// `to_version`, newest first.
    ///
    /// # Errors
    /// Returns `UnknownVersion` before touching anything if an applied version
    /// to be rolled back is not registered, or the first step failure.
    pub fn run_down(&mut self, to_version: Version) -> Result<RunReport, EngineError> {
        let run_id = Ulid::new();
        let span = info_span!("migrate", %run_id, direction = "reverse");
        let _guard = span.enter();

        self.state = RunnerState::Resolving;
        let applied = self
            .applied_versions()
            .inspect_err(|_| self.state = RunnerState::Idle)?;
        let from_version = applied
            .iter()
            .map(|record| record.version)
            .max()
            .unwrap_or(Version::ZERO);

        let mut targets = applied
            .iter()
            .map(|record| record.version)
            .filter(|version| *version > to_version)
            .collect::<Vec<_>>();
        targets.sort_unstable_by(|lhs, rhs| rhs.cmp(lhs));

        let mut descriptors = Vec::with_capacity(targets.len());
        for version in &targets {
            let Some(descriptor) = self.registry.get(*version) else {
                self.state = RunnerState::Idle;
                return Err(EngineError::UnknownVersion(*version));
            };
            descriptors.push(descriptor);
        }

        if descriptors.is_empty() {
            self.state = RunnerState::Idle;
            info!(current = %from_version, target = %to_version, "nothing to roll back");
            return Ok(RunReport {
                run_id,
                direction: Direction::Reverse,
                from_version,
                to_version: from_version,
                executed: Vec::new(),
            });
        }

        self.prepare(&targets, Direction::Reverse)?;
        info!(
            current = %from_version,
            target = %to_version,
            steps = targets.len(),
            "rolling back migrations"
        );

        let mut executed = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            self.execute(descriptor, Direction::Reverse)?;
            executed.push(descriptor.version);
        }
        self.state = RunnerState::Idle;

        let to_version = self.current_version()?;
        Ok(RunReport {
            run_id,
            direction: Direction::Reverse,
            from_version,
            to_version,
            executed,
        })
    }

    /// Roll back only the most recently applied version.
    ///
    /// # Errors
    /// See [`Runner::run_down`].
    pub fn run_down_one_step(&mut self) -> Result<Option<Version>, EngineError> {
        let applied = self.applied_versions()?;
        let mut versions = applied
            .iter()
            .map(|record| record.version)
            .collect::<Vec<_>>();
        versions.sort_unstable();
        let Some(latest) = versions.pop() else {
            return Ok(None);
        };
        let previous = versions.pop().unwrap_or(Version::ZERO);
        self.run_down(previous)?;
        Ok(Some(latest))
    }

    fn run_forward(&mut self, target: Option<Version>) -> Result<RunReport, EngineError> {
        let run_id = Ulid::new();
        let span = info_span!("migrate", %run_id, direction = "forward");
        let _guard = span.enter();

        let Resolved {
            current: from_version,
            pending,
        } = self.resolve()?;
        let pending = pending
            .into_iter()
            .filter(|version| target.map_or(true, |target| *version <= target))
            .collect::<Vec<_>>();

        if pending.is_empty() {
            self.state = RunnerState::Idle;
            info!(current = %from_version, "schema is up to date; nothing to apply");
            return Ok(RunReport {
                run_id,
                direction: Direction::Forward,
                from_version,
                to_version: from_version,
                executed: Vec::new(),
            });
        }

        self.prepare(&pending, Direction::Forward)?;
        info!(current = %from_version, steps = pending.len(), "applying migrations");

        let mut executed = Vec::with_capacity(pending.len());
        while let Some(descriptor) = self.resolve_next()? {
            if target.is_some_and(|target| descriptor.version > target) {
                break;
            }
            self.execute(descriptor, Direction::Forward)?;
            executed.push(descriptor.version);
        }
        self.state = RunnerState::Idle;

        let to_version = executed.last().copied().unwrap_or(from_version);
        info!(
            from = %from_version,
            to = %to_version,
            applied = executed.len(),
            "migration run finished"
        );
        Ok(RunReport {
            run_id,
            direction: Direction::Forward,
            from_version,
            to_version,
            executed,
        })
    }

    /// Read the store and compute pending versions, refusing to proceed when
    /// an earlier registered version is missing below the current one.
    fn resolve(&mut self) -> Result<Resolved, EngineError> {
        self.state = RunnerState::Resolving;
        let applied = match self.store.applied_versions() {
            Ok(applied) => applied,
            Err(err) => {
                self.state = RunnerState::Idle;
                return Err(EngineError::resolution(err));
            }
        };

        let applied = applied
            .into_iter()
            .map(|record| record.version)
            .collect::<BTreeSet<_>>();
        let current = applied.last().copied().unwrap_or(Version::ZERO);

        let missing = self
            .registry
            .ordered()
            .map(|descriptor| descriptor.version)
            .take_while(|version| *version < current)
            .filter(|version| !applied.contains(version))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            self.state = RunnerState::Idle;
            return Err(EngineError::MissingPredecessors { current, missing });
        }

        let pending = self
            .registry
            .ordered()
            .map(|descriptor| descriptor.version)
            .filter(|version| *version > current)
            .collect::<Vec<_>>();
        if pending.is_empty() {
            self.state = RunnerState::Idle;
        }
        Ok(Resolved { current, pending })
    }

    fn prepare(&mut self, pending: &[Version], direction: Direction) -> Result<(), EngineError> {
        self.store.before_run(pending, direction).map_err(|err| {
            self.state = RunnerState::Idle;
            EngineError::prepare(err)
        })
    }

    fn resolve_next(&mut self) -> Result<Option<&'a MigrationDescriptor<S::Handle>>, EngineError> {
        let resolved = self.resolve()?;
        Ok(self.registry.next(resolved.current))
    }

    fn execute(
        &mut self,
        descriptor: &'a MigrationDescriptor<S::Handle>,
        direction: Direction,
    ) -> Result<(), EngineError> {
        let version = descriptor.version;
        self.state = RunnerState::Executing { version, direction };
        info!(%version, name = %descriptor.name, %direction, "executing migration step");

        match self.store.execute_step(descriptor, direction) {
            Ok(()) => {
                self.state = RunnerState::Committed { version, direction };
                info!(%version, name = %descriptor.name, %direction, "migration step committed");
                Ok(())
            }
            Err(failure) => {
                self.state = RunnerState::Failed { version, direction };
                error!(
                    %version,
                    name = %descriptor.name,
                    %direction,
                    phase = %failure.phase,
                    error = %failure.source,
                    "migration step failed; transaction rolled back"
                );
                Err(EngineError::Step {
                    version,
                    name: descriptor.name.clone(),
                    direction,
                    phase: failure.phase,
                    source: failure.source,
                })
            }
        }
    }
}
