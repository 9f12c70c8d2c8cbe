pub mod build;
pub mod classify;
pub mod config;
pub mod container;
pub mod errors;
pub mod scheduler;
pub mod steps;
pub mod store;

// Shared value types live in `buildyard-common`
pub use buildyard_common::{BuildState, JobType, MigrationPhase, StepConfig, Verdict};
