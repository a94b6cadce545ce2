//! Tool surface: one method per exposed operation.
//!
//! Every method returns `Result<Outcome<T>>`. Expected outcomes such as "no
//! run yet" or "scenario not found" come back as `Ok(Outcome::Failure(..))`
//! so a programmatic caller can inspect them; faults that make the request
//! unserviceable (no runner executable, escaping path, unreadable reports
//! directory) stay `Err`.

#![allow(missing_docs)]

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analysis::analyzer::{AnalysisTarget, Analyzer, Diagnosis};
use crate::core::config::Config;
use crate::core::errors::{ErrorReport, Result, TriageError};
use crate::features::{CoverageReport, FeatureCatalog, FeatureFilter, FeatureListing};
use crate::logger::activity::ActivityLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::results::store::{ResultStore, RetentionReport, RunStatus, TestRun};
use crate::results::summary::{RunSummary, ScenarioResult, Summarizer};
use crate::runner::orchestrator::{Orchestrator, RunRequest};
use crate::runner::resolver::ExecutableResolver;
use crate::triage::context::{BuiltContext, ContextBuilder, ContextRequest, FailureContext};
use crate::triage::screenshots::{ScreenshotMatch, find_screenshot};

const DEFAULT_LIST_LIMIT: usize = 20;

// ──────────────────── payloads ────────────────────

/// Payload or structured failure, serialized without a wrapper.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outcome<T> {
    Ok(T),
    Failure(ErrorReport),
}

impl<T> Outcome<T> {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    #[must_use]
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    #[must_use]
    pub fn failure(self) -> Option<ErrorReport> {
        match self {
            Self::Ok(_) => None,
            Self::Failure(report) => Some(report),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResponse {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A run's summary merged with its persisted metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ResultsResponse {
    pub run_id: String,
    #[serde(flatten)]
    pub summary: RunSummary,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub dry_run: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureDetail {
    #[serde(flatten)]
    pub scenario: ScenarioResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_match: Option<ScreenshotMatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureDetails {
    pub run_id: String,
    pub failures: Vec<FailureDetail>,
    pub screenshot_dir: PathBuf,
    pub stdout_tail: String,
    pub stderr_tail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FailureQuery {
    pub scenario_name: Option<String>,
    pub run_id: Option<String>,
}

/// `analyze_failure` arguments. `context_id` takes precedence over the
/// scenario fields.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(flatten)]
    pub scenario: ContextRequest,
    #[serde(default = "default_true")]
    pub include_screenshot: bool,
}

impl Default for AnalyzeRequest {
    fn default() -> Self {
        Self {
            context_id: None,
            scenario: ContextRequest::default(),
            include_screenshot: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// One line of `serve` input.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListFeaturesArgs {
    feature_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunIdArgs {
    run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LimitArgs {
    limit: Option<usize>,
    keep: Option<usize>,
}

// ──────────────────── service ────────────────────

#[derive(Debug)]
pub struct TriageService {
    config: Config,
    store: ResultStore,
    catalog: FeatureCatalog,
    orchestrator: Orchestrator,
    contexts: ContextBuilder,
    analyzer: Analyzer,
    summarizer: Summarizer,
    activity: ActivityLog,
}

impl TriageService {
    /// Service writing its activity log where the config says.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let activity = ActivityLog::open(config.paths.activity_log.clone());
        Self::with_activity(config, activity)
    }

    #[must_use]
    pub fn with_activity(config: Config, activity: ActivityLog) -> Self {
        let store = ResultStore::new(config.paths.reports_dir.clone(), activity.clone());
        Self {
            catalog: FeatureCatalog::new(&config.paths.features_dir, &config.paths.project_root),
            orchestrator: Orchestrator::new(&config, store.clone(), activity.clone()),
            contexts: ContextBuilder::new(&config, store.clone(), activity.clone()),
            analyzer: Analyzer::new(&config, activity.clone()),
            summarizer: Summarizer::new(config.triage.max_error_chars),
            store,
            activity,
            config,
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: ExecutableResolver) -> Self {
        self.orchestrator = self.orchestrator.with_resolver(resolver);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Operational errors become a failure payload; the rest propagate.
    fn settle<T>(&self, result: Result<T>) -> Result<Outcome<T>> {
        match result {
            Ok(value) => Ok(Outcome::Ok(value)),
            Err(err) if err.is_operational() => {
                let mut entry = LogEntry::new(EventType::Error, Severity::Warning).failure(&err);
                if let Some(run_id) = err.run_id() {
                    entry = entry.run(run_id);
                }
                self.activity.record(&entry);
                Ok(Outcome::Failure(ErrorReport::from_error(&err)))
            }
            Err(err) => {
                self.activity
                    .record(&LogEntry::new(EventType::Error, Severity::Critical).failure(&err));
                Err(err)
            }
        }
    }

    fn run_by_id(&self, run_id: Option<&str>) -> Result<TestRun> {
        match run_id.map(str::trim).filter(|r| !r.is_empty()) {
            Some(run_id) => self.store.get(run_id),
            None => self.store.get_latest(),
        }
    }

    // ──────────────────── operations ────────────────────

    /// Feature files by area; `feature_type` is `api`, `ui`, or `all`.
    pub fn list_features(&self, feature_type: &str) -> Result<Outcome<FeatureListing>> {
        let listing = feature_type
            .parse::<FeatureFilter>()
            .and_then(|filter| self.catalog.list(filter));
        self.settle(listing)
    }

    /// Run the suite and wait for it.
    pub fn run_tests(&self, request: &RunRequest) -> Result<Outcome<RunResponse>> {
        let run = match self.orchestrator.start_run(request) {
            Ok(run) => run,
            Err(err) => return self.settle(Err(err)),
        };
        let mut error = run.error.clone();
        let summary = match run.results_path {
            Some(_) => match self.store.load_report(&run) {
                Ok(report) => Some(self.summarizer.summarize(&report)),
                Err(err) => {
                    error.get_or_insert_with(|| err.to_string());
                    None
                }
            },
            None => None,
        };
        Ok(Outcome::Ok(RunResponse {
            run_id: run.run_id,
            status: run.status,
            exit_code: run.exit_code,
            results_path: run.results_path,
            summary,
            stdout_tail: run.stdout_tail,
            stderr_tail: run.stderr_tail,
            duration_ms: run.duration_ms,
            error,
        }))
    }

    pub fn get_last_results(&self) -> Result<Outcome<ResultsResponse>> {
        let response = self.store.get_latest().and_then(|run| self.results_of(run));
        self.settle(response)
    }

    pub fn get_results(&self, run_id: &str) -> Result<Outcome<ResultsResponse>> {
        let response = self.store.get(run_id.trim()).and_then(|run| self.results_of(run));
        self.settle(response)
    }

    fn results_of(&self, run: TestRun) -> Result<ResultsResponse> {
        let report = self.store.report_for(&run)?;
        Ok(ResultsResponse {
            summary: self.summarizer.summarize(&report),
            run_id: run.run_id,
            status: run.status,
            exit_code: run.exit_code,
            stdout_tail: run.stdout_tail,
            stderr_tail: run.stderr_tail,
            dry_run: run.filters.dry_run,
            created_at: run.created_at,
            results_path: run.results_path,
        })
    }

    /// Failed scenarios of a run, optionally filtered by a case-insensitive
    /// name substring, each with its screenshot when one is found.
    pub fn get_failure_details(&self, query: &FailureQuery) -> Result<Outcome<FailureDetails>> {
        let details = self.run_by_id(query.run_id.as_deref()).and_then(|run| {
            let report = self.store.report_for(&run)?;
            let needle = query
                .scenario_name
                .as_deref()
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty());
            let failures = self
                .summarizer
                .summarize(&report)
                .failures
                .into_iter()
                .filter(|s| {
                    needle
                        .as_deref()
                        .is_none_or(|n| s.name.to_lowercase().contains(n))
                })
                .map(|scenario| {
                    let shot = find_screenshot(
                        &self.config.paths.screenshot_dir,
                        &scenario.name,
                        Some(&run.run_id),
                    );
                    FailureDetail {
                        screenshot_path: shot.as_ref().map(|s| s.path.clone()),
                        screenshot_match: shot.map(|s| s.matched),
                        scenario,
                    }
                })
                .collect();
            Ok(FailureDetails {
                run_id: run.run_id,
                failures,
                screenshot_dir: self.config.paths.screenshot_dir.clone(),
                stdout_tail: run.stdout_tail,
                stderr_tail: run.stderr_tail,
                results_path: run.results_path,
            })
        });
        self.settle(details)
    }

    pub fn get_test_coverage(&self) -> Result<Outcome<CoverageReport>> {
        self.settle(self.catalog.coverage())
    }

    pub fn build_context(&self, request: &ContextRequest) -> Result<Outcome<BuiltContext>> {
        self.settle(self.contexts.build(request))
    }

    /// Diagnose a failure identified by context id or by scenario.
    pub fn analyze_failure(&self, request: &AnalyzeRequest) -> Result<Outcome<Diagnosis>> {
        let target = match request.context_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => AnalysisTarget::ContextId(id),
            _ => AnalysisTarget::Identify(&request.scenario),
        };
        self.settle(
            self.analyzer
                .analyze(&self.contexts, target, request.include_screenshot),
        )
    }

    /// Diagnose a context the caller already holds.
    pub fn analyze_context(
        &self,
        context: &FailureContext,
        include_screenshot: bool,
    ) -> Result<Outcome<Diagnosis>> {
        self.settle(self.analyzer.analyze(
            &self.contexts,
            AnalysisTarget::Context(context),
            include_screenshot,
        ))
    }

    /// Up to `limit` runs, newest first.
    pub fn list_runs(&self, limit: usize) -> Result<Outcome<Vec<TestRun>>> {
        self.settle(self.store.list_recent(limit))
    }

    /// Apply retention now, keeping `keep` runs (the configured count when
    /// `None`).
    pub fn prune(&self, keep: Option<usize>) -> Result<Outcome<RetentionReport>> {
        let keep = keep.unwrap_or(self.config.retention.keep);
        if keep == 0 {
            return self.settle(Err(TriageError::InvalidArgument {
                details: "keep must be at least 1".to_string(),
            }));
        }
        self.settle(self.store.enforce_retention(keep))
    }

    // ──────────────────── dispatch ────────────────────

    /// Handle one named tool call with JSON arguments.
    pub fn dispatch(&self, call: &ToolCall) -> Result<Value> {
        let args = if call.args.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            call.args.clone()
        };
        match call.tool.as_str() {
            "list_features" => {
                let a: ListFeaturesArgs = self.parse_args(args)?;
                to_value(self.list_features(a.feature_type.as_deref().unwrap_or("all"))?)
            }
            "run_tests" => {
                let request: RunRequest = self.parse_args(args)?;
                to_value(self.run_tests(&request)?)
            }
            "get_last_results" => to_value(self.get_last_results()?),
            "get_results" => {
                let a: RunIdArgs = self.parse_args(args)?;
                match a.run_id {
                    Some(run_id) => to_value(self.get_results(&run_id)?),
                    None => to_value(self.get_last_results()?),
                }
            }
            "get_failure_details" => {
                let query: FailureQuery = self.parse_args(args)?;
                to_value(self.get_failure_details(&query)?)
            }
            "get_test_coverage" => to_value(self.get_test_coverage()?),
            "analyze_failure" => {
                let request: AnalyzeRequest = self.parse_args(args)?;
                to_value(self.analyze_failure(&request)?)
            }
            "build_context" | "get_failure_context" => {
                let request: ContextRequest = self.parse_args(args)?;
                to_value(self.build_context(&request)?)
            }
            "list_runs" => {
                let a: LimitArgs = self.parse_args(args)?;
                to_value(self.list_runs(a.limit.unwrap_or(DEFAULT_LIST_LIMIT))?)
            }
            "prune" => {
                let a: LimitArgs = self.parse_args(args)?;
                to_value(self.prune(a.keep)?)
            }
            other => to_value(self.settle::<()>(Err(TriageError::InvalidArgument {
                details: format!("unknown tool '{other}'"),
            }))?),
        }
    }

    fn parse_args<T: serde::de::DeserializeOwned>(&self, args: Value) -> Result<T> {
        serde_json::from_value(args).map_err(|e| TriageError::InvalidArgument {
            details: format!("bad arguments: {e}"),
        })
    }
}

fn to_value<T: Serialize>(outcome: Outcome<T>) -> Result<Value> {
    Ok(serde_json::to_value(outcome)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn service() -> (tempfile::TempDir, TriageService) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_project(dir.path());
        let svc = TriageService::with_activity(config, ActivityLog::disabled());
        (dir, svc)
    }

    #[test]
    fn no_runs_is_a_structured_failure() {
        let (_dir, svc) = service();
        fs::create_dir_all(&svc.config().paths.reports_dir).unwrap();
        let report = svc.get_last_results().unwrap().failure().unwrap();
        assert_eq!(report.code, "TRG-2105");
    }

    #[test]
    fn bad_feature_type_is_a_structured_failure() {
        let (_dir, svc) = service();
        let report = svc.list_features("desktop").unwrap().failure().unwrap();
        assert_eq!(report.code, "TRG-1204");
    }

    #[test]
    fn unknown_tool_is_reported() {
        let (_dir, svc) = service();
        let value = svc
            .dispatch(&ToolCall {
                tool: "launch_rockets".to_string(),
                args: Value::Null,
            })
            .unwrap();
        assert_eq!(value["code"], "TRG-1204");
        assert!(value["error"].as_str().unwrap().contains("launch_rockets"));
    }

    #[test]
    fn malformed_run_id_is_reported() {
        let (_dir, svc) = service();
        let report = svc.get_results("../etc").unwrap().failure().unwrap();
        assert_eq!(report.code, "TRG-1203");
        assert_eq!(report.run_id.as_deref(), Some("../etc"));
    }

    #[test]
    fn analyze_request_defaults() {
        let request: AnalyzeRequest =
            serde_json::from_value(serde_json::json!({"scenario_name": "Login"})).unwrap();
        assert!(request.include_screenshot);
        assert!(request.context_id.is_none());
        assert_eq!(request.scenario.scenario_name.as_deref(), Some("Login"));
    }

    #[test]
    fn unknown_context_id_is_reported() {
        let (_dir, svc) = service();
        let request = AnalyzeRequest {
            context_id: Some("ctx_deadbeefdeadbeef".to_string()),
            ..AnalyzeRequest::default()
        };
        let report = svc.analyze_failure(&request).unwrap().failure().unwrap();
        assert_eq!(report.code, "TRG-2202");
        assert_eq!(report.context_id.as_deref(), Some("ctx_deadbeefdeadbeef"));
    }

    #[test]
    fn prune_rejects_zero() {
        let (_dir, svc) = service();
        assert_eq!(svc.prune(Some(0)).unwrap().failure().unwrap().code, "TRG-1204");
    }
}
