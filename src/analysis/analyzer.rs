//! Failure Analyzer: context resolution, categorization, screenshot embedding.

#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use crate::analysis::rules::{Evidence, FailureCategory, RuleTable};
use crate::analysis::suggestions::{Suggester, Suggestion};
use crate::core::config::Config;
use crate::core::errors::{Result, TriageError};
use crate::logger::activity::ActivityLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::results::summary::ScenarioStatus;
use crate::triage::context::{ContextBuilder, ContextRequest, FailureContext};
use crate::triage::screenshots::ScreenshotMatch;

/// Which context to analyze. Variants are listed in precedence order.
#[derive(Debug, Clone, Copy)]
pub enum AnalysisTarget<'a> {
    /// A context the caller already holds.
    Context(&'a FailureContext),
    /// A context previously built in this process.
    ContextId(&'a str),
    /// Build (or fetch) the context for a scenario.
    Identify(&'a ContextRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    pub context_id: String,
    pub run_id: String,
    pub scenario: String,
    pub category: FailureCategory,
    pub confidence: f64,
    pub likely_cause: String,
    pub evidence: Vec<String>,
    pub suggestions: Vec<Suggestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_match: Option<ScreenshotMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_base64: Option<String>,
    pub screenshot_too_large: bool,
    pub cached: bool,
}

#[derive(Debug)]
pub struct Analyzer {
    rules: RuleTable,
    suggester: Suggester,
    screenshot_max_bytes: u64,
    activity: ActivityLog,
}

impl Analyzer {
    #[must_use]
    pub fn new(config: &Config, activity: ActivityLog) -> Self {
        Self {
            rules: RuleTable::default(),
            suggester: Suggester {
                project_root: config.paths.project_root.clone(),
                pages_dir: config.paths.pages_dir.clone(),
                steps_dir: config.paths.steps_dir.clone(),
            },
            screenshot_max_bytes: config.triage.screenshot_max_bytes,
            activity,
        }
    }

    /// Resolve `target` to a context and diagnose it.
    pub fn analyze(
        &self,
        contexts: &ContextBuilder,
        target: AnalysisTarget<'_>,
        include_screenshot: bool,
    ) -> Result<Diagnosis> {
        match target {
            AnalysisTarget::Context(context) => self.diagnose(context, false, include_screenshot),
            AnalysisTarget::ContextId(id) => {
                let context = contexts
                    .cached(id)
                    .ok_or_else(|| TriageError::ContextNotFound {
                        context_id: id.to_string(),
                    })?;
                self.diagnose(&context, true, include_screenshot)
            }
            AnalysisTarget::Identify(request) => {
                let built = contexts.build(request)?;
                self.diagnose(&built.context, built.cached, include_screenshot)
            }
        }
    }

    /// Diagnose one context. The result depends only on the context and
    /// the files it points at.
    pub fn diagnose(
        &self,
        context: &FailureContext,
        cached: bool,
        include_screenshot: bool,
    ) -> Result<Diagnosis> {
        if context.scenario.status != ScenarioStatus::Failed {
            return Err(TriageError::AnalysisFailed {
                details: format!(
                    "scenario '{}' did not fail in run {} (status: {})",
                    context.scenario.name,
                    context.run_id,
                    context.scenario.status.as_str()
                ),
            });
        }

        let error = context.error.as_deref().unwrap_or_default();
        let step = context
            .failed_step
            .as_ref()
            .map(|s| s.display())
            .unwrap_or_default();
        let verdict = self.rules.evaluate(&Evidence {
            error,
            failed_step: &step,
            logs: &context.logs,
        });

        let mut evidence: Vec<String> = verdict.hits.iter().map(|h| h.evidence()).collect();
        if evidence.is_empty() {
            let first_line = error.lines().next().unwrap_or("no error text").trim();
            evidence.push(format!("unrecognized failure signature: {first_line}"));
        }
        let suggestions = self
            .suggester
            .suggest(verdict.category, context, verdict.confidence);

        let (screenshot_base64, screenshot_too_large) = match &context.screenshot_path {
            Some(path) if include_screenshot => self.embed(path),
            _ => (None, false),
        };

        let diagnosis = Diagnosis {
            context_id: context.context_id.clone(),
            run_id: context.run_id.clone(),
            scenario: context.scenario.name.clone(),
            category: verdict.category,
            confidence: verdict.confidence,
            likely_cause: verdict.likely_cause,
            evidence,
            suggestions,
            screenshot_path: context.screenshot_path.clone(),
            screenshot_match: context.screenshot_match,
            screenshot_base64,
            screenshot_too_large,
            cached,
        };

        let mut entry = LogEntry::new(EventType::AnalysisComplete, Severity::Info)
            .run(&diagnosis.run_id)
            .context(&diagnosis.context_id)
            .details(format!(
                "category={} confidence={:.2} suggestions={}",
                diagnosis.category.as_str(),
                diagnosis.confidence,
                diagnosis.suggestions.len()
            ));
        entry.ok = Some(true);
        self.activity.record(&entry);
        Ok(diagnosis)
    }

    /// Base64 of the screenshot when it fits under the ceiling. Oversized
    /// or unreadable images degrade to path-only.
    fn embed(&self, path: &std::path::Path) -> (Option<String>, bool) {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => return (None, false),
        };
        if size > self.screenshot_max_bytes {
            let err = TriageError::ScreenshotTooLarge {
                path: path.to_path_buf(),
                size,
                limit: self.screenshot_max_bytes,
            };
            self.activity.record(
                &LogEntry::new(EventType::Error, Severity::Warning)
                    .path(path)
                    .failure(&err),
            );
            return (None, true);
        }
        match fs::read(path) {
            Ok(bytes) => (Some(STANDARD.encode(bytes)), false),
            Err(_) => (None, false),
        }
    }
}
