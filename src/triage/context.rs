//! Failure context builder and its process-local cache.
//!
//! A context is built once per (scenario, run, hour bucket) and then served
//! from memory. Runs are immutable once complete, so the cache is never
//! invalidated; asking about a newer run means passing its run id.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::config::Config;
use crate::core::errors::{Result, TriageError};
use crate::core::paths::PathValidator;
use crate::logger::activity::ActivityLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::results::store::{ResultStore, TestRun};
use crate::results::report::StepStatus;
use crate::results::summary::{
    FailedStep, ScenarioResult, ScenarioStatus, StepOutcome, Summarizer,
};
use crate::triage::logs::{LogExtractor, LogSource, mask_secrets};
use crate::triage::screenshots::{ScreenshotMatch, find_screenshot};
use crate::triage::stepdefs::{CodeIndex, RelatedCode, StepDefinition};

const MASK: &str = "***";
const SECRET_KEY_HINTS: [&str; 5] = ["PASSWORD", "TOKEN", "SECRET", "API_KEY", "COOKIE"];

// ──────────────────── request / model ────────────────────

/// How the caller identifies the scenario. Most specific field wins:
/// `scenario_id`, then `scenario_name` + `feature_file`, then name alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContextRequest {
    pub scenario_id: Option<String>,
    pub scenario_name: Option<String>,
    pub feature_file: Option<String>,
    pub run_id: Option<String>,
}

impl ContextRequest {
    #[must_use]
    pub fn by_name(name: impl Into<String>, run_id: Option<String>) -> Self {
        Self {
            scenario_name: Some(name.into()),
            run_id,
            ..Self::default()
        }
    }

    fn query(&self) -> String {
        fn pick(v: &Option<String>) -> Option<&str> {
            v.as_deref().map(str::trim).filter(|s| !s.is_empty())
        }
        match (pick(&self.scenario_id), pick(&self.scenario_name), pick(&self.feature_file)) {
            (Some(id), _, _) => id.to_string(),
            (None, Some(name), Some(file)) => format!("{name} ({file})"),
            (None, Some(name), None) => name.to_string(),
            (None, None, _) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub feature: String,
    pub feature_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub tags: BTreeSet<String>,
    pub status: ScenarioStatus,
    pub duration_seconds: f64,
}

/// Everything needed to diagnose one scenario occurrence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureContext {
    pub context_id: String,
    pub run_id: String,
    pub scenario: ScenarioInfo,
    pub error: Option<String>,
    pub failed_step: Option<FailedStep>,
    pub step_definition: Option<StepDefinition>,
    pub related_code: Vec<RelatedCode>,
    pub logs: Vec<String>,
    pub logs_truncated: bool,
    pub log_source: LogSource,
    pub screenshot_path: Option<PathBuf>,
    pub screenshot_match: Option<ScreenshotMatch>,
    pub previous_steps: Vec<StepOutcome>,
    pub environment: BTreeMap<String, String>,
}

/// A context as handed out by the builder.
#[derive(Debug, Clone, Serialize)]
pub struct BuiltContext {
    #[serde(flatten)]
    pub context: Arc<FailureContext>,
    pub cached: bool,
}

// ──────────────────── identification ────────────────────

/// Deterministic cache key: scenario identity, run id, and the run's
/// creation time truncated to the hour.
#[must_use]
pub fn context_id(scenario: &ScenarioResult, run_id: &str, created_at: &str) -> String {
    let bucket = DateTime::parse_from_rfc3339(created_at).map_or_else(
        |_| created_at.chars().take(13).collect(),
        |dt| dt.format("%Y-%m-%dT%H").to_string(),
    );
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{run_id}|{bucket}", scenario.identity()).as_bytes());
    let digest = hex_encode(&hasher.finalize());
    format!("ctx_{}", &digest[..16])
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

fn file_matches(candidate: &str, wanted: &str) -> bool {
    let norm = |s: &str| s.trim().replace('\\', "/").trim_start_matches("./").to_string();
    let (candidate, wanted) = (norm(candidate), norm(wanted));
    candidate == wanted
        || candidate.ends_with(&format!("/{wanted}"))
        || wanted.ends_with(&format!("/{candidate}"))
}

/// Pick the scenario a request refers to.
///
/// By name (case-insensitive substring), failed scenarios are searched
/// before the rest; within each group the first in report order wins.
#[must_use]
pub fn select_scenario<'a>(
    scenarios: &'a [ScenarioResult],
    request: &ContextRequest,
) -> Option<&'a ScenarioResult> {
    let pick = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    if let Some(id) = pick(&request.scenario_id) {
        return scenarios
            .iter()
            .find(|s| s.id.as_deref() == Some(id.as_str()) || s.identity() == id);
    }

    let name = pick(&request.scenario_name)?.to_lowercase();
    let file = pick(&request.feature_file);

    // Failed scenarios first, then report order.
    let rank = |s: &ScenarioResult| -> Option<u8> {
        if file.as_deref().is_some_and(|f| !file_matches(&s.feature_file, f)) {
            return None;
        }
        if !s.name.to_lowercase().contains(&name) {
            return None;
        }
        Some(u8::from(s.status != ScenarioStatus::Failed))
    };

    scenarios
        .iter()
        .filter_map(|s| rank(s).map(|r| (r, s)))
        .min_by_key(|(r, _)| *r)
        .map(|(_, s)| s)
}

/// Steps that ran before the first failing one.
fn steps_before_failure(steps: &[StepOutcome]) -> Vec<StepOutcome> {
    steps
        .iter()
        .take_while(|s| s.status != StepStatus::Failed)
        .cloned()
        .collect()
}

// ──────────────────── environment ────────────────────

fn is_secret_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SECRET_KEY_HINTS.iter().any(|hint| upper.contains(hint))
}

/// Parse `KEY=VALUE` lines of a dotenv file. Comments, blank lines, and an
/// `export ` prefix are tolerated; matching surrounding quotes are removed.
#[must_use]
pub fn parse_dotenv(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let l = l.strip_prefix("export ").unwrap_or(l);
            let (key, value) = l.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

// ──────────────────── builder ────────────────────

/// Builds and caches [`FailureContext`]s.
#[derive(Debug)]
pub struct ContextBuilder {
    store: ResultStore,
    summarizer: Summarizer,
    code: CodeIndex,
    logs: LogExtractor,
    screenshot_dir: PathBuf,
    env_file: PathBuf,
    environment_keys: Vec<String>,
    activity: ActivityLog,
    cache: RwLock<HashMap<String, Arc<FailureContext>>>,
}

impl ContextBuilder {
    #[must_use]
    pub fn new(config: &Config, store: ResultStore, activity: ActivityLog) -> Self {
        let paths = &config.paths;
        Self {
            store,
            summarizer: Summarizer::new(config.triage.max_error_chars),
            code: CodeIndex {
                validator: PathValidator::new(&paths.project_root),
                steps_dir: paths.steps_dir.clone(),
                pages_dir: paths.pages_dir.clone(),
                services_dir: paths.services_dir.clone(),
                snippet_radius: config.triage.snippet_radius,
                related_limit: config.triage.related_code_limit,
            },
            logs: LogExtractor {
                max_bytes: config.triage.max_log_bytes,
                window_secs: i64::try_from(config.triage.log_window_secs).unwrap_or(i64::MAX / 2),
            },
            screenshot_dir: paths.screenshot_dir.clone(),
            env_file: paths.env_file.clone(),
            environment_keys: config.triage.environment_keys.clone(),
            activity,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached context by id.
    #[must_use]
    pub fn cached(&self, context_id: &str) -> Option<Arc<FailureContext>> {
        self.cache.read().get(context_id).cloned()
    }

    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    /// Resolve the request to a scenario and return its context, building
    /// it on first use.
    pub fn build(&self, request: &ContextRequest) -> Result<BuiltContext> {
        let query = request.query();
        if query.is_empty() {
            return Err(TriageError::InvalidArgument {
                details: "scenario_id or scenario_name is required".to_string(),
            });
        }

        let run = match request.run_id.as_deref().filter(|r| !r.trim().is_empty()) {
            Some(run_id) => self.store.get(run_id.trim())?,
            None => self.store.get_latest()?,
        };
        let report = self.store.report_for(&run)?;
        let scenarios = self.summarizer.scenarios(&report);
        let scenario =
            select_scenario(&scenarios, request).ok_or_else(|| TriageError::ScenarioNotFound {
                query: query.clone(),
                run_id: run.run_id.clone(),
            })?;

        let id = context_id(scenario, &run.run_id, &run.created_at);
        if let Some(hit) = self.cached(&id) {
            self.activity.record(
                &LogEntry::new(EventType::ContextCacheHit, Severity::Info)
                    .run(&run.run_id)
                    .context(&id),
            );
            return Ok(BuiltContext {
                context: hit,
                cached: true,
            });
        }

        let context = Arc::new(self.assemble(id.clone(), &run, scenario));
        // First writer wins so an id always maps to one value.
        let stored = Arc::clone(
            self.cache
                .write()
                .entry(id.clone())
                .or_insert_with(|| Arc::clone(&context)),
        );
        self.activity.record(
            &LogEntry::new(EventType::ContextBuilt, Severity::Info)
                .run(&run.run_id)
                .context(&id)
                .details(format!("scenario={}", scenario.name)),
        );
        Ok(BuiltContext {
            context: stored,
            cached: false,
        })
    }

    fn assemble(&self, context_id: String, run: &TestRun, scenario: &ScenarioResult) -> FailureContext {
        let failed = scenario.failed_step.as_ref();

        let lookup = failed.and_then(|step| {
            self.code
                .find_step_definition(&step.text, step.definition.as_deref())
        });
        let (step_definition, related_code) = match lookup {
            Some((def, window)) => {
                let related = self.code.related_code(&window);
                (Some(def), related)
            }
            None => (None, Vec::new()),
        };

        let (log_text, log_source) = match self.store.read_output_log(run) {
            Some(text) => (text, LogSource::OutputLog),
            None if !run.stdout_tail.is_empty() || !run.stderr_tail.is_empty() => (
                format!("{}\n{}", run.stdout_tail, run.stderr_tail),
                LogSource::RunTails,
            ),
            None => (String::new(), LogSource::None),
        };
        let anchors: Vec<&str> = failed
            .map(|s| s.text.as_str())
            .into_iter()
            .chain([scenario.name.as_str()])
            .collect();
        let extract = self.logs.extract(&log_text, &anchors);

        let screenshot = find_screenshot(&self.screenshot_dir, &scenario.name, Some(&run.run_id));

        let previous_steps = steps_before_failure(&scenario.steps);

        FailureContext {
            context_id,
            run_id: run.run_id.clone(),
            scenario: ScenarioInfo {
                id: scenario.id.clone(),
                name: scenario.name.clone(),
                feature: scenario.feature.clone(),
                feature_file: scenario.feature_file.clone(),
                line: scenario.line,
                tags: scenario.tags.clone(),
                status: scenario.status,
                duration_seconds: scenario.duration_seconds,
            },
            error: scenario.error_message.as_deref().map(mask_secrets),
            failed_step: scenario.failed_step.clone(),
            step_definition,
            related_code,
            logs: extract.lines,
            logs_truncated: extract.truncated
                || (log_source == LogSource::OutputLog && run.output_truncated),
            log_source,
            screenshot_path: screenshot.as_ref().map(|s| s.path.clone()),
            screenshot_match: screenshot.as_ref().map(|s| s.matched),
            previous_steps,
            environment: self.environment(run),
        }
    }

    /// Configured keys from the process environment, then the project's
    /// dotenv file, plus run facts. Secret-looking values are masked.
    fn environment(&self, run: &TestRun) -> BTreeMap<String, String> {
        let dotenv = fs::read_to_string(&self.env_file)
            .map(|t| parse_dotenv(&t))
            .unwrap_or_default();
        let mut env: BTreeMap<String, String> = self
            .environment_keys
            .iter()
            .filter_map(|key| {
                let value = std::env::var(key)
                    .ok()
                    .or_else(|| dotenv.get(key).cloned())?;
                let value = if is_secret_key(key) {
                    MASK.to_string()
                } else {
                    mask_secrets(&value)
                };
                Some((key.clone(), value))
            })
            .collect();
        env.insert("run_id".to_string(), run.run_id.clone());
        env.insert("run_status".to_string(), run.status.to_string());
        env.insert(
            "exit_code".to_string(),
            run.exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()),
        );
        env.insert("runner".to_string(), mask_secrets(&run.command.join(" ")));
        env
    }
}
