//! Test driver that puts a database in the state immediately before one
//! migration, so a test can seed realistic data and then observe exactly what
//! that single migration does.

use crate::error::EngineError;
use crate::registry::Registry;
use crate::runner::Runner;
use crate::store::VersionStore;
use crate::version::Version;

pub struct Harness<'a, S: VersionStore> {
    runner: Runner<'a, S>,
}

impl<'a, S: VersionStore> Harness<'a, S> {
    pub fn new(registry: &'a Registry<S::Handle>, store: &'a mut S) -> Self {
        Self {
            runner: Runner::new(registry, store),
        }
    }

    /// Apply single steps until `target` is the next pending version, leaving
    /// it unapplied. Returns the resulting current version.
    ///
    /// # Errors
    /// Returns `UnknownVersion` when `target` is not registered,
    /// `AlreadyApplied` when it is already behind the current version, or the
    /// first step failure on the way.
    pub fn apply_up_to_but_excluding(&mut self, target: Version) -> Result<Version, EngineError> {
        if !self.runner.registry().contains(target) {
            return Err(EngineError::UnknownVersion(target));
        }

        loop {
            match self.runner.next_pending()? {
                Some(next) if next == target => break,
                Some(next) if next > target => return Err(EngineError::AlreadyApplied(target)),
                Some(_) => {
                    self.runner.run_one_step()?;
                }
                None => return Err(EngineError::AlreadyApplied(target)),
            }
        }

        self.runner.current_version()
    }

    /// Apply exactly one more version and return it.
    ///
    /// # Errors
    /// Returns `NothingPending` when everything is applied, or the step failure.
    pub fn apply_next(&mut self) -> Result<Version, EngineError> {
        self.runner
            .run_one_step()?
            .ok_or(EngineError::NothingPending)
    }

    pub fn runner(&mut self) -> &mut Runner<'a, S> {
        &mut self.runner
    }

    #[must_use]
    pub fn store(&self) -> &S {
        self.runner.store()
    }

    pub fn store_mut(&mut self) -> &mut S {
        self.runner.store_mut()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::memory::{InMemoryVersionStore, MemoryTx};

    fn registry(versions: &[i64]) -> Registry<MemoryTx> {
        let mut registry = Registry::new();
        for version in versions {
            let table = format!("t{version}");
            let reverse_table = table.clone();
            registry
                .register_fn(
                    *version,
                    format!("create {table}"),
                    move |tx: &MemoryTx| {
                        tx.create_table(&table);
                        tx.insert(&table, "seed")
                    },
                    move |tx: &MemoryTx| tx.drop_table(&reverse_table),
                )
                .unwrap_or_else(|err| panic!("register {version}: {err}"));
        }
        registry
    }

    #[test]
    fn stops_just_before_target_then_applies_it() -> anyhow::Result<()> {
        let registry = registry(&[1, 2, 3]);
        let mut store = InMemoryVersionStore::new();
        let mut harness = Harness::new(&registry, &mut store);

        assert_eq!(harness.apply_up_to_but_excluding(Version(3))?, Version(2));
        assert_eq!(harness.runner().current_version()?, Version(2));
        assert!(harness.store().rows("t3").is_none());

        assert_eq!(harness.apply_next()?, Version(3));
        assert_eq!(harness.runner().current_version()?, Version(3));

        let report = harness.runner().run_to_latest()?;
        assert!(report.is_noop());
        assert_eq!(harness.store().version_writes(), 3);
        Ok(())
    }

    #[test]
    fn first_version_as_target_applies_nothing() -> anyhow::Result<()> {
        let registry = registry(&[5, 6]);
        let mut store = InMemoryVersionStore::new();
        let mut harness = Harness::new(&registry, &mut store);
        assert_eq!(
            harness.apply_up_to_but_excluding(Version(5))?,
            Version::ZERO
        );
        assert_eq!(harness.store().version_writes(), 0);
        Ok(())
    }

    #[test]
    fn rejects_unregistered_and_already_applied_targets() -> anyhow::Result<()> {
        let registry = registry(&[1, 2, 3]);
        let mut store = InMemoryVersionStore::new();
        let mut harness = Harness::new(&registry, &mut store);

        assert!(matches!(
            harness.apply_up_to_but_excluding(Version(4)),
            Err(EngineError::UnknownVersion(Version(4)))
        ));

        harness.runner().run_to(Version(2))?;
        assert!(matches!(
            harness.apply_up_to_but_excluding(Version(1)),
            Err(EngineError::AlreadyApplied(Version(1)))
        ));

        harness.runner().run_to_latest()?;
        assert!(matches!(
            harness.apply_up_to_but_excluding(Version(3)),
            Err(EngineError::AlreadyApplied(Version(3)))
        ));
        assert!(matches!(
            harness.apply_next(),
            Err(EngineError::NothingPending)
        ));
        Ok(())
    }

    proptest! {
        #[test]
        fn property_single_step_matches_full_run(
            raw_versions in proptest::collection::btree_set(1_i64..10_000, 1..12),
            pick in any::<prop::sample::Index>(),
        ) {
            let versions = raw_versions.into_iter().collect::<Vec<_>>();
            let target = Version(versions[pick.index(versions.len())]);
            let registry = registry(&versions);

            let mut stepped = InMemoryVersionStore::new();
            {
                let mut harness = Harness::new(&registry, &mut stepped);
                prop_assert!(harness.apply_up_to_but_excluding(target).is_ok());
                prop_assert_eq!(harness.apply_next().ok(), Some(target));
            }

            let mut direct = InMemoryVersionStore::new();
            {
                let mut runner = Runner::new(&registry, &mut direct);
                prop_assert!(runner.run_to(target).is_ok());
            }

            prop_assert!(stepped.same_contents(&direct));
        }
    }
}
