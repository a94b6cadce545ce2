//! Serde model of the structured JSON report written by the test runner.
//!
//! Every field is optional or defaulted: the model has to accept both the
//! behave formatter's shape (`location: "path:line"`, string tags, float
//! second durations) and cucumber-style reports (`uri`, `line`, `id`, tag
//! objects). Anything that cannot be interpreted degrades to "absent".

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

/// One feature file in the report.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeatureReport {
    pub name: String,
    pub location: Option<String>,
    pub uri: Option<String>,
    pub tags: Vec<Tag>,
    pub elements: Vec<ElementReport>,
}

/// One element of a feature: a scenario, an expanded outline row, or a background.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ElementReport {
    #[serde(rename = "type")]
    pub kind: String,
    pub keyword: String,
    pub name: String,
    pub id: Option<String>,
    pub location: Option<String>,
    pub line: Option<u32>,
    pub tags: Vec<Tag>,
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StepReport {
    pub keyword: String,
    pub name: String,
    pub location: Option<String>,
    pub line: Option<u32>,
    #[serde(rename = "match")]
    pub matched: Option<StepMatch>,
    pub result: Option<StepResult>,
}

/// Where the runner bound a step to its implementation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StepMatch {
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StepResult {
    pub status: Option<String>,
    pub duration: Option<serde_json::Value>,
    pub error_message: Option<ErrorText>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ErrorText {
    Lines(Vec<String>),
    Text(String),
    Other(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Tag {
    Name(String),
    Object { name: String },
}

/// Normalized step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
    Undefined,
    Untested,
    /// Any status string this model does not recognize.
    Unknown,
}

impl StepStatus {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "passed" => Self::Passed,
            "failed" | "error" | "hook_error" => Self::Failed,
            "skipped" => Self::Skipped,
            "undefined" => Self::Undefined,
            "untested" | "pending" => Self::Untested,
            _ => Self::Unknown,
        }
    }

    /// Whether a step in this state keeps its scenario from counting as passed.
    #[must_use]
    pub const fn is_incomplete(self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::Undefined | Self::Untested | Self::Unknown
        )
    }
}

impl Tag {
    /// Tag text without a leading `@`.
    #[must_use]
    pub fn name(&self) -> &str {
        let raw = match self {
            Self::Name(name) | Self::Object { name } => name.as_str(),
        };
        raw.trim_start_matches('@')
    }
}

impl ErrorText {
    #[must_use]
    pub fn joined(&self) -> String {
        match self {
            Self::Lines(lines) => lines.join("\n"),
            Self::Text(text) => text.clone(),
            Self::Other(value) => value.to_string(),
        }
    }
}

impl StepReport {
    /// Status of this step; a missing result counts as undefined.
    #[must_use]
    pub fn status(&self) -> StepStatus {
        self.result
            .as_ref()
            .and_then(|r| r.status.as_deref())
            .map_or(StepStatus::Undefined, StepStatus::parse)
    }

    /// Duration in seconds, zero when absent or not numeric.
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.result
            .as_ref()
            .and_then(|r| r.duration.as_ref())
            .and_then(serde_json::Value::as_f64)
            .filter(|d| d.is_finite() && *d >= 0.0)
            .unwrap_or(0.0)
    }

    #[must_use]
    pub fn error_text(&self) -> Option<String> {
        self.result
            .as_ref()
            .and_then(|r| r.error_message.as_ref())
            .map(ErrorText::joined)
    }

    #[must_use]
    pub fn line_number(&self) -> Option<u32> {
        self.line
            .or_else(|| self.location.as_deref().and_then(|l| split_location(l).1))
    }

    /// `keyword text`, trimmed.
    #[must_use]
    pub fn display(&self) -> String {
        let keyword = self.keyword.trim();
        let name = self.name.trim();
        if keyword.is_empty() {
            name.to_string()
        } else {
            format!("{keyword} {name}").trim().to_string()
        }
    }
}

impl ElementReport {
    /// Plain scenarios and expanded outline rows; backgrounds and anything
    /// else are not counted.
    #[must_use]
    pub fn is_scenario(&self) -> bool {
        matches!(self.kind.as_str(), "scenario" | "scenario_outline")
    }

    /// Feature file and line of this element, falling back to the feature's.
    #[must_use]
    pub fn source(&self, feature: &FeatureReport) -> (String, Option<u32>) {
        let (file, line) = self
            .location
            .as_deref()
            .map(split_location)
            .unwrap_or_default();
        let file = if file.is_empty() {
            feature.file()
        } else {
            file
        };
        (file, self.line.or(line))
    }
}

impl FeatureReport {
    #[must_use]
    pub fn file(&self) -> String {
        self.location
            .as_deref()
            .map(|l| split_location(l).0)
            .filter(|f| !f.is_empty())
            .or_else(|| self.uri.clone())
            .unwrap_or_default()
    }
}

/// Split `path/to/file.feature:12` into its path and line.
#[must_use]
pub fn split_location(location: &str) -> (String, Option<u32>) {
    match location.rsplit_once(':') {
        Some((path, line)) => match line.trim().parse::<u32>() {
            Ok(n) => (path.to_string(), Some(n)),
            Err(_) => (location.to_string(), None),
        },
        None => (location.to_string(), None),
    }
}

/// Parse raw report text. Anything other than a list of features is an error.
pub fn parse_report(raw: &str) -> std::result::Result<Vec<FeatureReport>, serde_json::Error> {
    serde_json::from_str(raw)
}
