//! Severity-to-pattern mapping for standard server log lines.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Timestamp, milliseconds and pid that open every server log line.
const LINE_PREFIX: &str = r"^\d{4}-\d\d-\d\d \d\d:\d\d:\d\d,\d{3} \d+ ";

const TRACEBACK: &str = r"Traceback \(most recent call last\)";

/// How a category of log message affects the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Ignored
    #[default]
    None,
    /// Makes the step `warn`
    Warning,
    /// Makes the step `ko`
    Error,
}

/// Which message categories count as warnings and which as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityLevels {
    pub error: LogLevel,
    pub critical: LogLevel,
    pub traceback: LogLevel,
    pub warning: LogLevel,
    /// Failed test lines
    pub failed: LogLevel,
}

impl Default for SeverityLevels {
    fn default() -> Self {
        Self {
            error: LogLevel::Error,
            critical: LogLevel::Error,
            traceback: LogLevel::Error,
            warning: LogLevel::Warning,
            failed: LogLevel::None,
        }
    }
}

impl SeverityLevels {
    /// Regex source matching every category mapped to `level`, or `None`
    /// when no category maps there.
    pub fn pattern_for(&self, level: LogLevel) -> Option<String> {
        if level == LogLevel::None {
            return None;
        }

        let line_kinds: Vec<&str> = [
            (self.error, "ERROR"),
            (self.critical, "CRITICAL"),
            (self.warning, "WARNING"),
            (self.failed, "TEST.*FAIL"),
        ]
        .into_iter()
        .filter(|(l, _)| *l == level)
        .map(|(_, kind)| kind)
        .collect();

        let line_pattern = (!line_kinds.is_empty())
            .then(|| format!("{}(?:{})", LINE_PREFIX, line_kinds.join("|")));

        match (self.traceback == level, line_pattern) {
            (true, Some(lines)) => Some(format!("(?m)(?:{})|(?:{})", TRACEBACK, lines)),
            (true, None) => Some(TRACEBACK.to_string()),
            (false, Some(lines)) => Some(format!("(?m){}", lines)),
            (false, None) => None,
        }
    }

    pub fn regex_for(&self, level: LogLevel) -> Result<Option<Regex>, regex::Error> {
        self.pattern_for(level).map(|p| Regex::new(&p)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ERROR_LINE: &str = "2024-03-01 10:00:00,123 42 ERROR db odoo.modules: boom";
    const WARNING_LINE: &str = "2024-03-01 10:00:00,123 42 WARNING db odoo.models: careful";
    const CRITICAL_LINE: &str = "2024-03-01 10:00:00,123 42 CRITICAL db odoo.service: dead";

    #[test]
    fn test_default_error_pattern_matches_error_critical_traceback() {
        let re = SeverityLevels::default()
            .regex_for(LogLevel::Error)
            .unwrap()
            .unwrap();
        assert!(re.is_match(ERROR_LINE));
        assert!(re.is_match(CRITICAL_LINE));
        assert!(re.is_match("  Traceback (most recent call last):\n  File x"));
        assert!(!re.is_match(WARNING_LINE));
    }

    #[test]
    fn test_default_warning_pattern_matches_only_warning_lines() {
        let re = SeverityLevels::default()
            .regex_for(LogLevel::Warning)
            .unwrap()
            .unwrap();
        assert!(re.is_match(WARNING_LINE));
        assert!(!re.is_match(ERROR_LINE));
        assert!(!re.is_match("WARNING without a log prefix"));
    }

    #[test]
    fn test_prefix_is_anchored_per_line() {
        let re = SeverityLevels::default()
            .regex_for(LogLevel::Error)
            .unwrap()
            .unwrap();
        let log = format!("starting\n{}\nend", ERROR_LINE);
        assert!(re.is_match(&log));
        assert!(!re.is_match("prefix text 2024-03-01 10:00:00,123 42 ERROR x"));
    }

    #[test]
    fn test_level_with_no_category_has_no_pattern() {
        let levels = SeverityLevels {
            error: LogLevel::None,
            critical: LogLevel::None,
            traceback: LogLevel::None,
            warning: LogLevel::None,
            failed: LogLevel::None,
        };
        assert!(levels.pattern_for(LogLevel::Error).is_none());
        assert!(levels.pattern_for(LogLevel::Warning).is_none());
        assert!(levels.pattern_for(LogLevel::None).is_none());
    }

    #[test]
    fn test_traceback_only_level() {
        let levels = SeverityLevels {
            error: LogLevel::Warning,
            critical: LogLevel::Warning,
            traceback: LogLevel::Error,
            warning: LogLevel::None,
            failed: LogLevel::None,
        };
        assert_eq!(
            levels.pattern_for(LogLevel::Error).as_deref(),
            Some(r"Traceback \(most recent call last\)")
        );
        let warn = levels.regex_for(LogLevel::Warning).unwrap().unwrap();
        assert!(warn.is_match(ERROR_LINE));
    }

    #[test]
    fn test_failed_tests_can_be_promoted() {
        let levels = SeverityLevels {
            failed: LogLevel::Error,
            ..Default::default()
        };
        let re = levels.regex_for(LogLevel::Error).unwrap().unwrap();
        assert!(re.is_match("2024-03-01 10:00:00,123 42 TEST db odoo.tests: FAIL test_x"));
    }
}
