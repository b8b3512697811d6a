use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use crate::error::RegistryError;
use crate::version::Version;

/// Signature of a migration body. `H` is the transaction handle type of the
/// `VersionStore` the migration targets.
pub type StepFn<H> = dyn Fn(&H) -> anyhow::Result<()> + Send + Sync;

/// One direction of a migration: an opaque callable, or a documented no-op
/// for forward steps that cannot be undone.
pub struct Step<H> {
    body: Option<Box<StepFn<H>>>,
}

impl<H> Step<H> {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&H) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            body: Some(Box::new(body)),
        }
    }

    #[must_use]
    pub fn noop() -> Self {
        Self { body: None }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.body.is_none()
    }

    /// Execute the step against an open transaction handle.
    ///
    /// # Errors
    /// Returns whatever the migration body returns.
    pub fn run(&self, handle: &H) -> anyhow::Result<()> {
        match &self.body {
            Some(body) => body(handle),
            None => Ok(()),
        }
    }
}

impl<H> Debug for Step<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_noop() {
            f.write_str("Step(noop)")
        } else {
            f.write_str("Step(..)")
        }
    }
}

#[derive(Debug)]
pub struct MigrationDescriptor<H> {
    pub version: Version,
    pub name: String,
    pub forward: Step<H>,
    pub reverse: Step<H>,
}

impl<H> MigrationDescriptor<H> {
    pub fn new(
        version: impl Into<Version>,
        name: impl Into<String>,
        forward: Step<H>,
        reverse: Step<H>,
    ) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            forward,
            reverse,
        }
    }

    #[must_use]
    pub fn step(&self, direction: crate::version::Direction) -> &Step<H> {
        match direction {
            crate::version::Direction::Forward => &self.forward,
            crate::version::Direction::Reverse => &self.reverse,
        }
    }
}

/// Append-only set of migrations keyed by version.
///
/// All registration happens before the registry is handed to a `Runner`; the
/// runner only ever borrows it immutably, so a populated registry can be shared
/// between threads without locking.
pub struct Registry<H> {
    migrations: BTreeMap<Version, MigrationDescriptor<H>>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            migrations: BTreeMap::new(),
        }
    }
}

impl<H> Debug for Registry<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("versions", &self.versions())
            .finish()
    }
}

impl<H> Registry<H> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one migration.
    ///
    /// # Errors
    /// Returns an error for a non-positive or duplicate version, or an empty name.
    pub fn register(&mut self, descriptor: MigrationDescriptor<H>) -> Result<(), RegistryError> {
        let version = descriptor.version;
        if version.get() <= 0 {
            return Err(RegistryError::InvalidVersion(version));
        }
        if descriptor.name.trim().is_empty() {
            return Err(RegistryError::EmptyName(version));
        }
        if self.migrations.contains_key(&version) {
            return Err(RegistryError::Duplicate(version));
        }
        self.migrations.insert(version, descriptor);
        Ok(())
    }

    /// Register a migration from plain closures.
    ///
    /// # Errors
    /// See [`Registry::register`].
    pub fn register_fn<F, R>(
        &mut self,
        version: impl Into<Version>,
        name: impl Into<String>,
        forward: F,
        reverse: R,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&H) -> anyhow::Result<()> + Send + Sync + 'static,
        R: Fn(&H) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(MigrationDescriptor::new(
            version,
            name,
            Step::new(forward),
            Step::new(reverse),
        ))
    }

    /// Register a migration whose reverse step is a documented no-op.
    ///
    /// # Errors
    /// See [`Registry::register`].
    pub fn register_irreversible<F>(
        &mut self,
        version: impl Into<Version>,
        name: impl Into<String>,
        forward: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&H) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(MigrationDescriptor::new(version, name, Step::new(forward), Step::noop()))
    }

    /// All descriptors in ascending version order.
    pub fn ordered(&self) -> impl Iterator<Item = &MigrationDescriptor<H>> {
        self.migrations.values()
    }

    #[must_use]
    pub fn versions(&self) -> Vec<Version> {
        self.migrations.keys().copied().collect()
    }

    /// Smallest registered version strictly greater than `after`.
    #[must_use]
    pub fn next(&self, after: Version) -> Option<&MigrationDescriptor<H>> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.migrations
            .range((Excluded(after), Unbounded))
            .next()
            .map(|(_, descriptor)| descriptor)
    }

    #[must_use]
    pub fn get(&self, version: Version) -> Option<&MigrationDescriptor<H>> {
        self.migrations.get(&version)
    }

    #[must_use]
    pub fn contains(&self, version: Version) -> bool {
        self.migrations.contains_key(&version)
    }

    #[must_use]
    pub fn latest(&self) -> Option<Version> {
        self.migrations.keys().next_back().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
