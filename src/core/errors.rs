//! TRG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, TriageError>;

/// Top-level error type for scenario triage.
#[derive(Debug, Error)]
pub enum TriageError {
    #[error("[TRG-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[TRG-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[TRG-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[TRG-1101] cannot find test runner executable (tried: {})", .tried.join(", "))]
    ExecutableNotFound { tried: Vec<String> },

    #[error("[TRG-1201] path '{path}' is outside project root {}", .root.display())]
    PathEscapesRoot { path: String, root: PathBuf },

    #[error("[TRG-1202] path '{path}' does not exist")]
    FeaturePathNotFound { path: String },

    #[error("[TRG-1203] invalid run_id format: {run_id:?}")]
    InvalidRunId { run_id: String },

    #[error("[TRG-1204] invalid argument: {details}")]
    InvalidArgument { details: String },

    #[error("[TRG-2001] test run {run_id} timed out after {seconds}s")]
    TimeoutExceeded { run_id: String, seconds: u64 },

    #[error("[TRG-2101] results file not found: {}", .path.display())]
    ResultsNotFound { run_id: String, path: PathBuf },

    #[error("[TRG-2102] results file is empty: {}", .path.display())]
    EmptyResults { run_id: String, path: PathBuf },

    #[error("[TRG-2103] invalid JSON in results {}: {details}", .path.display())]
    CorruptResults {
        run_id: String,
        path: PathBuf,
        details: String,
    },

    #[error("[TRG-2104] no run recorded with id {run_id}")]
    RunNotFound { run_id: String },

    #[error("[TRG-2105] no results found, run tests first")]
    NoRunsYet,

    #[error("[TRG-2106] run {run_id} produced no results: {reason}")]
    NoResultsFound { run_id: String, reason: String },

    #[error("[TRG-2201] no scenario matching '{query}' in run {run_id}")]
    ScenarioNotFound { query: String, run_id: String },

    #[error("[TRG-2202] no cached failure context with id {context_id}")]
    ContextNotFound { context_id: String },

    #[error("[TRG-2301] screenshot {} is {size} bytes, over the {limit} byte ceiling", .path.display())]
    ScreenshotTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("[TRG-2401] failure analysis failed: {details}")]
    AnalysisFailed { details: String },

    #[error("[TRG-3101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[TRG-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[TRG-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl TriageError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "TRG-1001",
            Self::MissingConfig { .. } => "TRG-1002",
            Self::ConfigParse { .. } => "TRG-1003",
            Self::ExecutableNotFound { .. } => "TRG-1101",
            Self::PathEscapesRoot { .. } => "TRG-1201",
            Self::FeaturePathNotFound { .. } => "TRG-1202",
            Self::InvalidRunId { .. } => "TRG-1203",
            Self::InvalidArgument { .. } => "TRG-1204",
            Self::TimeoutExceeded { .. } => "TRG-2001",
            Self::ResultsNotFound { .. } => "TRG-2101",
            Self::EmptyResults { .. } => "TRG-2102",
            Self::CorruptResults { .. } => "TRG-2103",
            Self::RunNotFound { .. } => "TRG-2104",
            Self::NoRunsYet => "TRG-2105",
            Self::NoResultsFound { .. } => "TRG-2106",
            Self::ScenarioNotFound { .. } => "TRG-2201",
            Self::ContextNotFound { .. } => "TRG-2202",
            Self::ScreenshotTooLarge { .. } => "TRG-2301",
            Self::AnalysisFailed { .. } => "TRG-2401",
            Self::Serialization { .. } => "TRG-3101",
            Self::Io { .. } => "TRG-3002",
            Self::Runtime { .. } => "TRG-3900",
        }
    }

    /// Whether this is an expected operational outcome ("no data yet",
    /// "not found", "timed out") rather than a fault that prevents the
    /// request from being serviced at all.
    #[must_use]
    pub const fn is_operational(&self) -> bool {
        matches!(
            self,
            Self::InvalidRunId { .. }
                | Self::InvalidArgument { .. }
                | Self::TimeoutExceeded { .. }
                | Self::ResultsNotFound { .. }
                | Self::EmptyResults { .. }
                | Self::CorruptResults { .. }
                | Self::RunNotFound { .. }
                | Self::NoRunsYet
                | Self::NoResultsFound { .. }
                | Self::ScenarioNotFound { .. }
                | Self::ContextNotFound { .. }
                | Self::ScreenshotTooLarge { .. }
                | Self::AnalysisFailed { .. }
        )
    }

    /// Run id the failing request was about, when known.
    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::TimeoutExceeded { run_id, .. }
            | Self::ResultsNotFound { run_id, .. }
            | Self::EmptyResults { run_id, .. }
            | Self::CorruptResults { run_id, .. }
            | Self::RunNotFound { run_id }
            | Self::NoResultsFound { run_id, .. }
            | Self::ScenarioNotFound { run_id, .. }
            | Self::InvalidRunId { run_id } => Some(run_id),
            _ => None,
        }
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for TriageError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for TriageError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

/// Self-describing failure payload handed back to tool callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_path: Option<PathBuf>,
}

impl ErrorReport {
    #[must_use]
    pub fn from_error(err: &TriageError) -> Self {
        let context_id = match err {
            TriageError::ContextNotFound { context_id } => Some(context_id.clone()),
            _ => None,
        };
        let results_path = match err {
            TriageError::ResultsNotFound { path, .. }
            | TriageError::EmptyResults { path, .. }
            | TriageError::CorruptResults { path, .. } => Some(path.clone()),
            _ => None,
        };
        Self {
            error: err.to_string(),
            code: err.code(),
            run_id: err.run_id().map(str::to_string),
            context_id,
            results_path,
        }
    }

    #[must_use]
    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_variant() -> Vec<TriageError> {
        vec![
            TriageError::InvalidConfig {
                details: String::new(),
            },
            TriageError::MissingConfig {
                path: PathBuf::new(),
            },
            TriageError::ConfigParse {
                context: "",
                details: String::new(),
            },
            TriageError::ExecutableNotFound { tried: Vec::new() },
            TriageError::PathEscapesRoot {
                path: String::new(),
                root: PathBuf::new(),
            },
            TriageError::FeaturePathNotFound {
                path: String::new(),
            },
            TriageError::InvalidRunId {
                run_id: String::new(),
            },
            TriageError::InvalidArgument {
                details: String::new(),
            },
            TriageError::TimeoutExceeded {
                run_id: String::new(),
                seconds: 1,
            },
            TriageError::ResultsNotFound {
                run_id: String::new(),
                path: PathBuf::new(),
            },
            TriageError::EmptyResults {
                run_id: String::new(),
                path: PathBuf::new(),
            },
            TriageError::CorruptResults {
                run_id: String::new(),
                path: PathBuf::new(),
                details: String::new(),
            },
            TriageError::RunNotFound {
                run_id: String::new(),
            },
            TriageError::NoRunsYet,
            TriageError::NoResultsFound {
                run_id: String::new(),
                reason: String::new(),
            },
            TriageError::ScenarioNotFound {
                query: String::new(),
                run_id: String::new(),
            },
            TriageError::ContextNotFound {
                context_id: String::new(),
            },
            TriageError::ScreenshotTooLarge {
                path: PathBuf::new(),
                size: 0,
                limit: 0,
            },
            TriageError::AnalysisFailed {
                details: String::new(),
            },
            TriageError::Serialization {
                context: "",
                details: String::new(),
            },
            TriageError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            TriageError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = every_variant();
        let codes: Vec<&str> = errors.iter().map(TriageError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn display_includes_code() {
        for err in every_variant() {
            let msg = err.to_string();
            assert!(
                msg.contains(err.code()),
                "display should contain error code {}: {msg}",
                err.code()
            );
        }
    }

    #[test]
    fn misconfiguration_is_not_operational() {
        assert!(
            !TriageError::ExecutableNotFound {
                tried: vec!["behave".to_string()]
            }
            .is_operational()
        );
        assert!(
            !TriageError::PathEscapesRoot {
                path: "../x".to_string(),
                root: PathBuf::from("/p"),
            }
            .is_operational()
        );
        assert!(TriageError::NoRunsYet.is_operational());
        assert!(
            TriageError::TimeoutExceeded {
                run_id: "run_1".to_string(),
                seconds: 5,
            }
            .is_operational()
        );
    }

    #[test]
    fn report_carries_run_id_and_path() {
        let err = TriageError::CorruptResults {
            run_id: "run_x".to_string(),
            path: PathBuf::from("/r/results_run_x.json"),
            details: "expected value at line 1".to_string(),
        };
        let report = ErrorReport::from_error(&err);
        assert_eq!(report.code, "TRG-2103");
        assert_eq!(report.run_id.as_deref(), Some("run_x"));
        assert!(report.error.contains("expected value at line 1"));
        assert_eq!(
            report.results_path,
            Some(PathBuf::from("/r/results_run_x.json"))
        );
    }

    #[test]
    fn report_omits_absent_fields() {
        let report = ErrorReport::from_error(&TriageError::NoRunsYet);
        let value = serde_json::to_value(&report).unwrap();
        assert!(value.get("run_id").is_none());
        assert!(value.get("context_id").is_none());
        assert_eq!(value["code"], "TRG-2105");
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: TriageError = json_err.into();
        assert_eq!(err.code(), "TRG-3101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: TriageError = toml_err.into();
        assert_eq!(err.code(), "TRG-1003");
    }
}
