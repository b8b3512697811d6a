//! Versioned, forward-only schema migration engine.
//!
//! Migrations are registered under unique positive versions and applied one
//! transaction at a time, in ascending order, against any datastore that
//! implements [`VersionStore`].

pub mod batch;
pub mod config;
pub mod error;
pub mod harness;
pub mod memory;
pub mod reconcile;
pub mod registry;
pub mod runner;
pub mod status;
pub mod store;
pub mod version;

pub use batch::{batch_process, batch_process_iter, BatchSummary};
pub use config::{validate_identifier, EngineConfig, DEFAULT_BATCH_SIZE, DEFAULT_VERSION_TABLE};
pub use error::{
    BatchError, BoxError, ConfigError, EngineError, ReconcileError, RegistryError, StepFailure,
    StepPhase,
};
pub use harness::Harness;
pub use memory::{InMemoryVersionStore, MemoryTx};
pub use reconcile::{
    reconcile, resolve_canonical, Anomaly, Assignment, Candidate, Reconciliation, ReconcileMode,
    Subject,
};
pub use registry::{MigrationDescriptor, Registry, Step, StepFn};
pub use runner::{RunReport, Runner, RunnerState};
pub use status::{compare_versions, MigrationStatus};
pub use store::{AppliedVersionRecord, VersionStore};
pub use version::{Direction, Version};
