//! Log-based result classification.
//!
//! A step's verdict comes from the content of its log, never from an exit
//! code. Precedence is fixed: error pattern, then warning pattern, then a
//! missing completion marker, then `ok`. A log that cannot be read is `ko`.
//!
//! ```
//! use buildyard::classify::{LogLevel, SeverityLevels};
//!
//! let levels = SeverityLevels::default();
//! let error = levels.regex_for(LogLevel::Error).unwrap().unwrap();
//! assert!(error.is_match("2024-03-01 10:00:00,123 42 ERROR db odoo.modules: boom"));
//! ```

mod levels;
mod parser;

pub use buildyard_common::{Verdict, worst};
pub use levels::{LogLevel, SeverityLevels};
pub use parser::{
    Cause, Classification, ClassifyRules, DEFAULT_COMPLETION_MARKER, LogDefaults, classify,
    matches_pattern, read_log,
};
