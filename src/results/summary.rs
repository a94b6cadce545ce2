//! Result parser / summarizer: raw report → normalized scenario results and
//! run-level counts.

#![allow(missing_docs)]

use std::collections::BTreeSet;

use serde::Serialize;

use crate::results::report::{FeatureReport, StepReport, StepStatus};

/// Marker appended to error text cut at `max_error_chars`.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Scenario-level status derived from its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    Skipped,
}

impl ScenarioStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// The first failing step of a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedStep {
    pub keyword: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Step implementation location reported by the runner (`steps/x.py:12`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

impl FailedStep {
    /// `keyword text`.
    #[must_use]
    pub fn display(&self) -> String {
        if self.keyword.is_empty() {
            self.text.clone()
        } else {
            format!("{} {}", self.keyword, self.text)
        }
    }
}

/// One step as it ran, in scenario order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub keyword: String,
    pub text: String,
    pub status: StepStatus,
}

/// One scenario within a run's report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub feature: String,
    pub name: String,
    pub feature_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub tags: BTreeSet<String>,
    pub status: ScenarioStatus,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<FailedStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip)]
    pub steps: Vec<StepOutcome>,
}

impl ScenarioResult {
    /// Stable identity within a report: `feature_file:line:name`.
    #[must_use]
    pub fn identity(&self) -> String {
        format!(
            "{}:{}:{}",
            self.feature_file,
            self.line.map_or_else(String::new, |l| l.to_string()),
            self.name
        )
    }
}

/// Normalized run summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total_scenarios: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<ScenarioResult>,
    pub duration_seconds: f64,
}

/// Derive a scenario's status from its steps, scanned in order.
///
/// The first failed step decides `failed`; otherwise the first incomplete
/// step (skipped, undefined, untested, unrecognized) decides `skipped`. A
/// scenario with no steps never ran and counts as skipped.
#[must_use]
pub fn derive_status(steps: &[StepReport]) -> ScenarioStatus {
    if steps.is_empty() {
        return ScenarioStatus::Skipped;
    }
    let mut status = ScenarioStatus::Passed;
    for step in steps {
        match step.status() {
            StepStatus::Failed => return ScenarioStatus::Failed,
            s if s.is_incomplete() && status == ScenarioStatus::Passed => {
                status = ScenarioStatus::Skipped;
            }
            _ => {}
        }
    }
    status
}

/// Cut `text` to at most `max_chars` characters, appending the marker when cut.
#[must_use]
pub fn truncate_error(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{TRUNCATION_MARKER}", &text[..byte_idx]),
        None => text.to_string(),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Converts raw reports into [`ScenarioResult`]s and [`RunSummary`]s.
#[derive(Debug, Clone, Copy)]
pub struct Summarizer {
    max_error_chars: usize,
}

impl Default for Summarizer {
    fn default() -> Self {
        Self {
            max_error_chars: 1_000,
        }
    }
}

impl Summarizer {
    #[must_use]
    pub const fn new(max_error_chars: usize) -> Self {
        Self { max_error_chars }
    }

    /// Every scenario in report order.
    #[must_use]
    pub fn scenarios(&self, report: &[FeatureReport]) -> Vec<ScenarioResult> {
        report
            .iter()
            .flat_map(|feature| {
                feature
                    .elements
                    .iter()
                    .filter(|element| element.is_scenario())
                    .map(move |element| (feature, element))
            })
            .map(|(feature, element)| {
                let status = derive_status(&element.steps);
                let failing = element
                    .steps
                    .iter()
                    .find(|step| step.status() == StepStatus::Failed);
                let (feature_file, line) = element.source(feature);
                let tags = feature
                    .tags
                    .iter()
                    .chain(&element.tags)
                    .map(|t| t.name().to_string())
                    .collect();
                ScenarioResult {
                    id: element.id.clone(),
                    feature: feature.name.clone(),
                    name: element.name.clone(),
                    feature_file,
                    line,
                    tags,
                    status,
                    duration_seconds: round2(
                        element.steps.iter().map(StepReport::duration_seconds).sum(),
                    ),
                    failed_step: failing.map(|step| FailedStep {
                        keyword: step.keyword.trim().to_string(),
                        text: step.name.trim().to_string(),
                        line: step.line_number(),
                        definition: step.matched.as_ref().and_then(|m| m.location.clone()),
                    }),
                    error_message: failing.map(|step| {
                        let raw = step
                            .error_text()
                            .unwrap_or_else(|| "Unknown error".to_string());
                        truncate_error(&raw, self.max_error_chars)
                    }),
                    steps: element
                        .steps
                        .iter()
                        .map(|step| StepOutcome {
                            keyword: step.keyword.trim().to_string(),
                            text: step.name.trim().to_string(),
                            status: step.status(),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Counts by status plus the failing scenarios.
    #[must_use]
    pub fn summarize(&self, report: &[FeatureReport]) -> RunSummary {
        let mut summary = RunSummary {
            total_scenarios: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            failures: Vec::new(),
            duration_seconds: 0.0,
        };
        let mut duration = 0.0;
        for scenario in self.scenarios(report) {
            summary.total_scenarios += 1;
            duration += scenario.duration_seconds;
            match scenario.status {
                ScenarioStatus::Passed => summary.passed += 1,
                ScenarioStatus::Skipped => summary.skipped += 1,
                ScenarioStatus::Failed => {
                    summary.failed += 1;
                    summary.failures.push(scenario);
                }
            }
        }
        summary.duration_seconds = round2(duration);
        summary
    }
}
