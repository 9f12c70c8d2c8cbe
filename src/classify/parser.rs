//! Verdict extraction from step logs.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use buildyard_common::{StepConfig, Verdict};

use super::levels::{LogLevel, SeverityLevels};
use crate::config::LogsSection;
use crate::errors::{ClassificationError, ConfigError};

/// Any of the lines a server prints when it loaded its modules or shut down cleanly.
pub const DEFAULT_COMPLETION_MARKER: &str =
    r"Modules loaded\.|modules\.loading: \d+ modules loaded in|Initiating shutdown";

static DEFAULT_MARKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_COMPLETION_MARKER).expect("default marker compiles"));

/// Why a log got its verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cause {
    Clean,
    ErrorMatched,
    WarningMatched,
    MarkerMissing,
    Unreadable { reason: String },
}

/// Verdict plus the evidence behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub verdict: Verdict,
    pub cause: Cause,
    /// The log line that triggered an error or warning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl Classification {
    fn new(verdict: Verdict, cause: Cause, excerpt: Option<String>) -> Self {
        Self {
            verdict,
            cause,
            excerpt,
        }
    }

    fn unreadable(err: &ClassificationError) -> Self {
        Self::new(
            Verdict::Ko,
            Cause::Unreadable {
                reason: err.to_string(),
            },
            None,
        )
    }
}

/// Read a whole log file. Logs are bounded, so no streaming.
pub fn read_log(log_file: &Path) -> Result<String, ClassificationError> {
    match std::fs::read(log_file) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ClassificationError::LogMissing {
                path: log_file.to_path_buf(),
            })
        }
        Err(source) => Err(ClassificationError::LogUnreadable {
            path: log_file.to_path_buf(),
            source,
        }),
    }
}

/// True if `pattern` is found anywhere in the file.
pub fn matches_pattern(log_file: &Path, pattern: &Regex) -> Result<bool, ClassificationError> {
    Ok(pattern.is_match(&read_log(log_file)?))
}

/// The full line around the first match of `pattern`.
fn first_matching_line(content: &str, pattern: &Regex) -> Option<String> {
    let m = pattern.find(content)?;
    let start = content[..m.start()].rfind('\n').map_or(0, |i| i + 1);
    let end = content[m.start()..]
        .find('\n')
        .map_or(content.len(), |i| m.start() + i);
    Some(content[start..end].trim_end().to_string())
}

/// Classify a step log.
///
/// `completion_marker` is `Some` only when the marker is required.
pub fn classify(
    log_file: &Path,
    error: Option<&Regex>,
    warning: Option<&Regex>,
    completion_marker: Option<&Regex>,
) -> Classification {
    let content = match read_log(log_file) {
        Ok(content) => content,
        Err(e) => return Classification::unreadable(&e),
    };

    if let Some(line) = error.and_then(|re| first_matching_line(&content, re)) {
        return Classification::new(Verdict::Ko, Cause::ErrorMatched, Some(line));
    }
    if let Some(line) = warning.and_then(|re| first_matching_line(&content, re)) {
        return Classification::new(Verdict::Warn, Cause::WarningMatched, Some(line));
    }
    if let Some(marker) = completion_marker
        && !marker.is_match(&content)
    {
        return Classification::new(Verdict::Ko, Cause::MarkerMissing, None);
    }
    Classification::new(Verdict::Ok, Cause::Clean, None)
}

/// Engine-wide classification defaults, compiled once per process.
#[derive(Debug, Clone)]
pub struct LogDefaults {
    pub error: Option<Regex>,
    pub warning: Option<Regex>,
    pub completion_marker: Regex,
}

impl Default for LogDefaults {
    fn default() -> Self {
        let levels = SeverityLevels::default();
        Self {
            error: levels
                .regex_for(LogLevel::Error)
                .expect("default error pattern compiles"),
            warning: levels
                .regex_for(LogLevel::Warning)
                .expect("default warning pattern compiles"),
            completion_marker: DEFAULT_MARKER_REGEX.clone(),
        }
    }
}

impl LogDefaults {
    pub fn from_section(section: &LogsSection) -> Result<Self, ConfigError> {
        let invalid = |kind: &'static str| {
            move |source| ConfigError::InvalidPattern {
                step: "[logs]".to_string(),
                kind,
                source,
            }
        };

        let completion_marker = match &section.completion_marker {
            Some(p) => Regex::new(p).map_err(invalid("completion marker"))?,
            None => DEFAULT_MARKER_REGEX.clone(),
        };

        Ok(Self {
            error: section
                .levels
                .regex_for(LogLevel::Error)
                .map_err(invalid("error"))?,
            warning: section
                .levels
                .regex_for(LogLevel::Warning)
                .map_err(invalid("warning"))?,
            completion_marker,
        })
    }
}

/// Rules resolved for one step: step overrides first, engine defaults otherwise.
#[derive(Debug, Clone)]
pub struct ClassifyRules {
    pub error: Option<Regex>,
    pub warning: Option<Regex>,
    /// Present only when the step requires it
    pub completion_marker: Option<Regex>,
}

impl ClassifyRules {
    pub fn for_step(step: &StepConfig, defaults: &LogDefaults) -> Result<Self, ConfigError> {
        let compile = |pattern: &Option<String>, kind: &'static str, fallback: Option<&Regex>| {
            match pattern {
                Some(p) => Regex::new(p)
                    .map(Some)
                    .map_err(|source| ConfigError::InvalidPattern {
                        step: step.name.clone(),
                        kind,
                        source,
                    }),
                None => Ok(fallback.cloned()),
            }
        };

        let error = compile(&step.error_pattern, "error", defaults.error.as_ref())?;
        let warning = compile(&step.warning_pattern, "warning", defaults.warning.as_ref())?;
        let marker = compile(
            &step.completion_marker,
            "completion marker",
            Some(&defaults.completion_marker),
        )?;

        Ok(Self {
            error,
            warning,
            completion_marker: marker.filter(|_| step.requires_completion_marker()),
        })
    }

    pub fn classify(&self, log_file: &Path) -> Classification {
        classify(
            log_file,
            self.error.as_ref(),
            self.warning.as_ref(),
            self.completion_marker.as_ref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildyard_common::JobType;
    use std::fs;

    const ERROR_LINE: &str = "2024-03-01 10:00:00,123 42 ERROR db odoo.modules: boom";
    const WARNING_LINE: &str = "2024-03-01 10:00:00,123 42 WARNING db odoo.models: careful";
    const LOADED: &str = "2024-03-01 10:00:00,123 42 INFO db odoo.modules.loading: 80 modules loaded in 3.2s";

    fn write_log(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("step.txt");
        fs::write(&path, content).unwrap();
        path
    }

    fn rules(marker: bool) -> ClassifyRules {
        let defaults = LogDefaults::default();
        ClassifyRules {
            error: defaults.error,
            warning: defaults.warning,
            completion_marker: marker.then_some(defaults.completion_marker),
        }
    }

    #[test]
    fn test_matches_pattern_scans_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(&dir, "line one\nline two\nneedle at the end");
        assert!(matches_pattern(&log, &Regex::new("needle").unwrap()).unwrap());
        assert!(!matches_pattern(&log, &Regex::new("haystack").unwrap()).unwrap());
    }

    #[test]
    fn test_matches_pattern_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = matches_pattern(&dir.path().join("nope.txt"), &Regex::new("x").unwrap())
            .unwrap_err();
        assert!(matches!(err, ClassificationError::LogMissing { .. }));
    }

    #[test]
    fn test_clean_log_with_marker_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(&dir, &format!("{}\nInitiating shutdown\n", LOADED));
        let result = rules(true).classify(&log);
        assert_eq!(result.verdict, Verdict::Ok);
        assert_eq!(result.cause, Cause::Clean);
        assert!(result.excerpt.is_none());
    }

    #[test]
    fn test_error_beats_warning() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(&dir, &format!("{}\n{}\n{}\n", WARNING_LINE, ERROR_LINE, LOADED));
        let result = rules(true).classify(&log);
        assert_eq!(result.verdict, Verdict::Ko);
        assert_eq!(result.cause, Cause::ErrorMatched);
        assert_eq!(result.excerpt.as_deref(), Some(ERROR_LINE));
    }

    #[test]
    fn test_warning_beats_missing_marker() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(&dir, &format!("{}\n", WARNING_LINE));
        let result = rules(true).classify(&log);
        assert_eq!(result.verdict, Verdict::Warn);
        assert_eq!(result.cause, Cause::WarningMatched);
        assert_eq!(result.excerpt.as_deref(), Some(WARNING_LINE));
    }

    #[test]
    fn test_missing_marker_is_ko_only_when_required() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(&dir, "nothing interesting\n");
        let required = rules(true).classify(&log);
        assert_eq!(required.verdict, Verdict::Ko);
        assert_eq!(required.cause, Cause::MarkerMissing);

        let optional = rules(false).classify(&log);
        assert_eq!(optional.verdict, Verdict::Ok);
    }

    #[test]
    fn test_missing_log_is_ko_with_distinct_cause() {
        let dir = tempfile::tempdir().unwrap();
        let result = rules(false).classify(&dir.path().join("absent.txt"));
        assert_eq!(result.verdict, Verdict::Ko);
        match result.cause {
            Cause::Unreadable { reason } => assert!(reason.contains("not found")),
            other => panic!("Expected Unreadable, got {:?}", other),
        }
    }

    #[test]
    fn test_marker_variants() {
        let dir = tempfile::tempdir().unwrap();
        for content in [
            "2024-03-01 10:00:00,123 42 INFO db odoo.modules.loading: Modules loaded.",
            "2024-03-01 10:00:00,123 42 INFO db odoo.service.server: Initiating shutdown",
            LOADED,
        ] {
            let log = write_log(&dir, content);
            assert_eq!(rules(true).classify(&log).verdict, Verdict::Ok, "{}", content);
        }
    }

    #[test]
    fn test_invalid_utf8_is_still_classified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary.txt");
        let mut bytes = vec![0xff, 0xfe, b'\n'];
        bytes.extend_from_slice(ERROR_LINE.as_bytes());
        fs::write(&path, bytes).unwrap();
        assert_eq!(rules(false).classify(&path).verdict, Verdict::Ko);
    }

    #[test]
    fn test_step_overrides_replace_defaults() {
        let step = StepConfig::new("lint", JobType::CustomParse, 1)
            .with_command("flake8")
            .with_error_pattern(r"E\d{3}")
            .with_warning_pattern(r"W\d{3}");
        let rules = ClassifyRules::for_step(&step, &LogDefaults::default()).unwrap();
        assert!(rules.completion_marker.is_none());

        let dir = tempfile::tempdir().unwrap();
        let log = write_log(&dir, "a.py:1:1: W291 trailing whitespace\n");
        assert_eq!(rules.classify(&log).verdict, Verdict::Warn);

        // Default patterns no longer apply
        let log = write_log(&dir, &format!("{}\n", ERROR_LINE));
        assert_eq!(rules.classify(&log).verdict, Verdict::Ok);
    }

    #[test]
    fn test_step_with_bad_pattern_is_config_error() {
        let step = StepConfig::new("tests", JobType::Install, 1).with_error_pattern("(oops");
        let err = ClassifyRules::for_step(&step, &LogDefaults::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { kind: "error", .. }));
    }

    #[test]
    fn test_install_step_requires_marker_by_default() {
        let step = StepConfig::new("install_odoo", JobType::Install, 1);
        let rules = ClassifyRules::for_step(&step, &LogDefaults::default()).unwrap();
        assert!(rules.completion_marker.is_some());
    }

    #[test]
    fn test_log_defaults_from_section() {
        let mut section = LogsSection::default();
        section.levels.warning = LogLevel::Error;
        section.completion_marker = Some("ALL DONE".to_string());
        let defaults = LogDefaults::from_section(&section).unwrap();
        assert!(defaults.warning.is_none());
        assert!(defaults.error.unwrap().is_match(WARNING_LINE));
        assert!(defaults.completion_marker.is_match("ALL DONE"));

        section.completion_marker = Some("[".to_string());
        assert!(LogDefaults::from_section(&section).is_err());
    }
}
