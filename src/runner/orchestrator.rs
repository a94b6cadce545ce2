//! Run orchestrator: filters in, persisted [`TestRun`] out.
//!
//! This is the only component that spawns the runner or writes run
//! artifacts. Each run gets a fresh run id before anything is spawned and
//! every file it touches is qualified by that id, so concurrent runs never
//! contend for a file.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rand::random;
use serde::Deserialize;

use crate::core::config::Config;
use crate::core::errors::{Result, TriageError};
use crate::core::paths::PathValidator;
use crate::logger::activity::ActivityLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::results::store::{ResultStore, RunFilters, RunStatus, TestRun};
use crate::runner::process::{OutputLimits, ProcessOutcome, Supervisor};
use crate::runner::resolver::{ExecutableResolver, ResolvedRunner};

/// Environment variable exported to the runner so collaborators can tag
/// their artifacts (screenshots, logs) with the run they belong to.
pub const RUN_ID_ENV: &str = "TRIAGE_RUN_ID";

const RUN_ID_ATTEMPTS: usize = 16;

/// Caller-facing run parameters. Absent timeout means the configured default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub tags: Option<String>,
    pub feature_path: Option<String>,
    #[serde(alias = "scenario")]
    pub scenario_name: Option<String>,
    pub dry_run: bool,
    pub timeout_seconds: Option<u64>,
}

/// `run_<UTC yyyymmdd_HHMMSS_mmm>_<4 hex>`. Sorts by creation time.
#[must_use]
pub fn generate_run_id() -> String {
    format!(
        "run_{}_{:04x}",
        Utc::now().format("%Y%m%d_%H%M%S_%3f"),
        random::<u16>()
    )
}

/// Runner argument vector for one run.
#[must_use]
pub fn build_args(
    runner: &ResolvedRunner,
    outfile: &Path,
    filters: &RunFilters,
    feature_arg: Option<&str>,
) -> Vec<String> {
    let mut argv = runner.argv.clone();
    argv.extend([
        "--format".to_string(),
        "json".to_string(),
        "--outfile".to_string(),
        outfile.to_string_lossy().into_owned(),
    ]);
    if let Some(tags) = filters.tags.as_deref().filter(|t| !t.trim().is_empty()) {
        argv.extend(["--tags".to_string(), tags.to_string()]);
    }
    if let Some(path) = feature_arg {
        argv.push(path.to_string());
    }
    if let Some(name) = filters
        .scenario_name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
    {
        argv.extend(["--name".to_string(), name.to_string()]);
    }
    if filters.dry_run {
        argv.push("--dry-run".to_string());
    }
    argv
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    project_root: PathBuf,
    default_timeout_secs: u64,
    kill_grace: Duration,
    limits: OutputLimits,
    keep: usize,
    config_hash: String,
    validator: PathValidator,
    resolver: ExecutableResolver,
    store: ResultStore,
    activity: ActivityLog,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: &Config, store: ResultStore, activity: ActivityLog) -> Self {
        let root = config.paths.project_root.clone();
        Self {
            default_timeout_secs: config.runner.default_timeout_secs,
            kill_grace: Duration::from_millis(config.runner.kill_grace_ms),
            limits: OutputLimits {
                stdout_tail: config.runner.stdout_tail_bytes,
                stderr_tail: config.runner.stderr_tail_bytes,
                combined: config.triage.max_log_bytes,
            },
            keep: config.retention.keep,
            config_hash: config.stable_hash().unwrap_or_default(),
            validator: PathValidator::new(&root),
            resolver: ExecutableResolver::from_env(&config.runner, &root),
            project_root: root,
            store,
            activity,
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: ExecutableResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Start a run and wait for it.
    ///
    /// Misconfiguration (escaping or missing feature path, no runner) is an
    /// `Err`. A timeout or a runner that cannot be spawned is not: the run is
    /// persisted with `timed_out`/`error` status and returned.
    pub fn start_run(&self, request: &RunRequest) -> Result<TestRun> {
        let timeout_seconds = request.timeout_seconds.unwrap_or(self.default_timeout_secs);
        if timeout_seconds == 0 {
            return Err(TriageError::InvalidArgument {
                details: "timeout_seconds must be >= 1".to_string(),
            });
        }

        let feature_arg = match request.feature_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(raw) => {
                let resolved = self.validator.validate_existing(raw)?;
                Some(
                    resolved
                        .strip_prefix(self.validator.root())
                        .map_or_else(|_| resolved.clone(), Path::to_path_buf)
                        .to_string_lossy()
                        .into_owned(),
                )
            }
            None => None,
        };

        let runner = self.resolver.resolve()?;
        self.store.ensure_dir()?;
        let run_id = self.fresh_run_id()?;

        let filters = RunFilters {
            tags: request.tags.clone(),
            feature_path: request.feature_path.clone(),
            scenario_name: request.scenario_name.clone(),
            dry_run: request.dry_run,
            timeout_seconds,
        };
        let partial = self.store.partial_report_path(&run_id);
        let argv = build_args(&runner, &partial, &filters, feature_arg.as_deref());
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        self.activity.record(
            &LogEntry::new(EventType::RunStarted, Severity::Info)
                .run(&run_id)
                .details(format!(
                    "config_hash={} command={}",
                    self.config_hash,
                    argv.join(" ")
                )),
        );

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&self.project_root)
            .env(RUN_ID_ENV, &run_id);

        let supervisor = Supervisor {
            timeout: Duration::from_secs(timeout_seconds),
            kill_grace: self.kill_grace,
            limits: self.limits,
        };

        let mut run = TestRun {
            run_id: run_id.clone(),
            filters,
            status: RunStatus::Completed,
            exit_code: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            results_path: None,
            output_log: None,
            output_truncated: false,
            created_at,
            duration_ms: 0,
            command: argv,
            error: None,
        };

        match supervisor.run(cmd) {
            Ok(outcome) => self.absorb(&mut run, outcome),
            Err(err) => {
                eprintln!("[TRG-RUNNER] failed to spawn {}: {err}", run.command[0]);
                run.status = RunStatus::Error;
                run.stderr_tail = format!("failed to spawn {}: {err}", run.command[0]);
                run.error = Some(run.stderr_tail.clone());
            }
        }

        self.store.save(&run)?;
        self.log_outcome(&run);

        if let Err(err) = self.store.enforce_retention(self.keep) {
            eprintln!("[TRG-STORE] retention sweep failed: {err}");
            self.activity
                .record(&LogEntry::new(EventType::Error, Severity::Warning).failure(&err));
        }
        Ok(run)
    }

    fn fresh_run_id(&self) -> Result<String> {
        for _ in 0..RUN_ID_ATTEMPTS {
            let candidate = generate_run_id();
            if !self.store.is_taken(&candidate) {
                return Ok(candidate);
            }
        }
        Err(TriageError::Runtime {
            details: "could not allocate an unused run id".to_string(),
        })
    }

    /// Fold a finished process into the run record and settle its artifacts.
    fn absorb(&self, run: &mut TestRun, outcome: ProcessOutcome) {
        run.exit_code = outcome.exit_code;
        run.stdout_tail = outcome.stdout_tail;
        run.stderr_tail = outcome.stderr_tail;
        run.duration_ms = u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX);
        run.output_truncated = outcome.combined_truncated;

        if !outcome.combined.is_empty() {
            let log_path = self.store.output_log_path(&run.run_id);
            match fs::write(&log_path, outcome.combined.as_bytes()) {
                Ok(()) => run.output_log = Some(log_path),
                Err(err) => eprintln!(
                    "[TRG-RUNNER] could not write output log {}: {err}",
                    log_path.display()
                ),
            }
        }

        let partial = self.store.partial_report_path(&run.run_id);
        if outcome.timed_out {
            run.status = RunStatus::TimedOut;
            run.error = Some(format!(
                "Test run timed out after {}s",
                run.filters.timeout_seconds
            ));
            let _ = fs::remove_file(&partial);
            return;
        }
        if run.filters.dry_run {
            let _ = fs::remove_file(&partial);
            return;
        }

        let report = self.store.report_path(&run.run_id);
        if partial.exists() {
            if let Err(err) = fs::rename(&partial, &report) {
                run.error = Some(TriageError::io(&report, err).to_string());
                return;
            }
        }
        if !report.exists() {
            run.error = Some(format!(
                "runner exited with {} without writing a report",
                run.exit_code
                    .map_or_else(|| "a signal".to_string(), |c| format!("code {c}"))
            ));
            return;
        }
        run.results_path = Some(report);
        if let Err(err) = self.store.load_report(run) {
            run.results_path = None;
            run.error = Some(err.to_string());
        }
    }

    fn log_outcome(&self, run: &TestRun) {
        let (event, severity) = match run.status {
            RunStatus::Completed => (EventType::RunCompleted, Severity::Info),
            RunStatus::TimedOut => (EventType::RunTimedOut, Severity::Warning),
            RunStatus::Error => (EventType::RunFailed, Severity::Critical),
        };
        let mut entry = LogEntry::new(event, severity).run(&run.run_id);
        entry.duration_ms = Some(run.duration_ms);
        entry.exit_code = run.exit_code;
        entry.ok = Some(run.status == RunStatus::Completed && run.results_path.is_some());
        if let Some(path) = &run.results_path {
            entry = entry.path(path);
        }
        if run.status == RunStatus::TimedOut {
            entry = entry.failure(&TriageError::TimeoutExceeded {
                run_id: run.run_id.clone(),
                seconds: run.filters.timeout_seconds,
            });
        } else if let Some(error) = &run.error {
            entry = entry.details(error.clone());
        }
        self.activity.record(&entry);
    }
}
