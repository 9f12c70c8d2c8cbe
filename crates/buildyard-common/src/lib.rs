//! Shared domain types for the buildyard build engine.
//!
//! These types are persisted in the build store and shown to operators, so
//! every enum round-trips through serde as `snake_case` strings.

mod state;
mod step;
mod verdict;

pub use state::{BuildState, MigrationPhase};
pub use step::{JobType, StepConfig};
pub use verdict::{Verdict, worst};

use thiserror::Error;

/// Error returned when parsing one of the domain enums from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
