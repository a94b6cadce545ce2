//! Result store: run artifacts on disk, keyed by run id.
//!
//! Every run owns a fixed set of files in the reports directory:
//!
//! - `results_<run_id>_meta.json`: the persisted [`TestRun`]; its presence
//!   is what makes a run visible to the store.
//! - `results_<run_id>.json`: the runner's structured report.
//! - `results_<run_id>_output.log`: combined captured output.
//!
//! "Latest" and retention order by (meta mtime, run id), newest first.

#![allow(missing_docs)]

use std::cmp::Reverse;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TriageError};
use crate::logger::activity::ActivityLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::results::report::{FeatureReport, parse_report};

const PREFIX: &str = "results_";
const META_SUFFIX: &str = "_meta.json";
const OUTPUT_SUFFIX: &str = "_output.log";

static RUN_ID_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").ok());

// ──────────────────── run model ────────────────────

/// Filters a run was started with. Immutable once the run starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_name: Option<String>,
    pub dry_run: bool,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    TimedOut,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Error => "error",
        })
    }
}

/// One invocation of the suite, as persisted in its meta artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    pub run_id: String,
    pub filters: RunFilters,
    pub status: RunStatus,
    /// Present only when the process exited normally.
    pub exit_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub results_path: Option<PathBuf>,
    #[serde(default)]
    pub output_log: Option<PathBuf>,
    /// The combined output outgrew its cap and only the tail was kept.
    #[serde(default)]
    pub output_truncated: bool,
    /// RFC 3339 UTC, millisecond precision.
    pub created_at: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reject run ids that could not have come from the orchestrator. Run ids
/// become file names, so anything outside `[A-Za-z0-9_-]` is refused.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    let ok = RUN_ID_RE
        .as_ref()
        .is_some_and(|re| re.is_match(run_id));
    if ok {
        Ok(())
    } else {
        Err(TriageError::InvalidRunId {
            run_id: run_id.to_string(),
        })
    }
}

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub kept: usize,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
struct Entry {
    run_id: String,
    modified: SystemTime,
}

// ──────────────────── store ────────────────────

/// Filesystem-backed run store.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
    activity: ActivityLog,
}

impl ResultStore {
    #[must_use]
    pub fn new(dir: PathBuf, activity: ActivityLog) -> Self {
        Self { dir, activity }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| TriageError::io(&self.dir, e))
    }

    #[must_use]
    pub fn report_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{PREFIX}{run_id}.json"))
    }

    /// Where the runner writes while it is still running.
    #[must_use]
    pub fn partial_report_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{PREFIX}{run_id}.json.partial"))
    }

    #[must_use]
    pub fn meta_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{PREFIX}{run_id}{META_SUFFIX}"))
    }

    #[must_use]
    pub fn output_log_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{PREFIX}{run_id}{OUTPUT_SUFFIX}"))
    }

    /// Whether any artifact for `run_id` is already on disk.
    #[must_use]
    pub fn is_taken(&self, run_id: &str) -> bool {
        self.meta_path(run_id).exists()
            || self.report_path(run_id).exists()
            || self.partial_report_path(run_id).exists()
    }

    /// Persist a run's meta artifact: temp file, then rename into place.
    pub fn save(&self, run: &TestRun) -> Result<()> {
        validate_run_id(&run.run_id)?;
        self.ensure_dir()?;
        let path = self.meta_path(&run.run_id);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(run)?;

        let result = (|| -> io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &path)
        })();

        if let Err(source) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(TriageError::io(&path, source));
        }
        Ok(())
    }

    /// Load one run by id.
    pub fn get(&self, run_id: &str) -> Result<TestRun> {
        validate_run_id(run_id)?;
        let path = self.meta_path(run_id);
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| TriageError::CorruptResults {
                run_id: run_id.to_string(),
                path,
                details: e.to_string(),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(TriageError::RunNotFound {
                run_id: run_id.to_string(),
            }),
            Err(err) => Err(TriageError::io(&path, err)),
        }
    }

    /// Newest run in the store.
    pub fn get_latest(&self) -> Result<TestRun> {
        let entries = self.entries()?;
        let newest = entries.first().ok_or(TriageError::NoRunsYet)?;
        self.get(&newest.run_id)
    }

    /// Up to `n` runs, newest first. Runs whose meta cannot be read are
    /// skipped with a warning.
    pub fn list_recent(&self, n: usize) -> Result<Vec<TestRun>> {
        let mut runs = Vec::new();
        for entry in self.entries()? {
            if runs.len() >= n {
                break;
            }
            match self.get(&entry.run_id) {
                Ok(run) => runs.push(run),
                Err(err) => eprintln!("[TRG-STORE] skipping run {}: {err}", entry.run_id),
            }
        }
        Ok(runs)
    }

    /// Delete every run beyond the newest `keep`. Individual deletion
    /// failures are logged and do not abort the sweep.
    pub fn enforce_retention(&self, keep: usize) -> Result<RetentionReport> {
        let entries = self.entries()?;
        let mut report = RetentionReport {
            kept: entries.len().min(keep),
            ..RetentionReport::default()
        };

        for entry in entries.iter().skip(keep) {
            let mut clean = true;
            for path in [
                self.report_path(&entry.run_id),
                self.partial_report_path(&entry.run_id),
                self.output_log_path(&entry.run_id),
                // Meta goes last so a half-deleted run stays visible and is
                // retried on the next sweep.
                self.meta_path(&entry.run_id),
            ] {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        clean = false;
                        let err = TriageError::io(&path, err);
                        eprintln!("[TRG-STORE] retention could not delete: {err}");
                        self.activity.record(
                            &LogEntry::new(EventType::ArtifactDeleteFailed, Severity::Warning)
                                .run(&entry.run_id)
                                .path(&path)
                                .failure(&err),
                        );
                    }
                }
            }
            if clean {
                report.deleted.push(entry.run_id.clone());
            } else {
                report.failed.push(entry.run_id.clone());
            }
        }

        if !report.deleted.is_empty() || !report.failed.is_empty() {
            self.activity.record(
                &LogEntry::new(EventType::RetentionSweep, Severity::Info)
                    .path(&self.dir)
                    .details(format!(
                        "keep={keep} deleted={} failed={}",
                        report.deleted.len(),
                        report.failed.len()
                    )),
            );
        }
        Ok(report)
    }

    /// Load and parse a run's structured report.
    ///
    /// Absent, empty, and malformed files each map to their own error so
    /// the caller can tell "not produced" from "produced but unreadable".
    pub fn load_report(&self, run: &TestRun) -> Result<Vec<FeatureReport>> {
        let path = run
            .results_path
            .clone()
            .unwrap_or_else(|| self.report_path(&run.run_id));
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TriageError::ResultsNotFound {
                    run_id: run.run_id.clone(),
                    path,
                });
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                return Err(TriageError::CorruptResults {
                    run_id: run.run_id.clone(),
                    path,
                    details: err.to_string(),
                });
            }
            Err(err) => return Err(TriageError::io(&path, err)),
        };
        if raw.trim().is_empty() {
            return Err(TriageError::EmptyResults {
                run_id: run.run_id.clone(),
                path,
            });
        }
        parse_report(&raw).map_err(|e| TriageError::CorruptResults {
            run_id: run.run_id.clone(),
            path,
            details: e.to_string(),
        })
    }

    /// The report for a run that is expected to have one.
    ///
    /// A run that never produced a report (dry run, timeout, runner crash)
    /// is `NoResultsFound` carrying the run id; a report that exists but
    /// cannot be read keeps its specific error.
    pub fn report_for(&self, run: &TestRun) -> Result<Vec<FeatureReport>> {
        if run.results_path.is_none() && !self.report_path(&run.run_id).exists() {
            let reason = run.error.clone().unwrap_or_else(|| {
                if run.filters.dry_run {
                    "dry run does not produce a report".to_string()
                } else {
                    format!("run finished with status {}", run.status)
                }
            });
            return Err(TriageError::NoResultsFound {
                run_id: run.run_id.clone(),
                reason,
            });
        }
        self.load_report(run)
    }

    /// Read the run's combined output log, if one was kept.
    #[must_use]
    pub fn read_output_log(&self, run: &TestRun) -> Option<String> {
        let path = run
            .output_log
            .clone()
            .unwrap_or_else(|| self.output_log_path(&run.run_id));
        fs::read(&path)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Runs known to the store, newest first.
    fn entries(&self) -> Result<Vec<Entry>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(TriageError::io(&self.dir, err)),
        };

        let mut entries: Vec<Entry> = read_dir
            .filter_map(std::result::Result::ok)
            .filter_map(|dirent| {
                let name = dirent.file_name().to_string_lossy().into_owned();
                let run_id = name.strip_prefix(PREFIX)?.strip_suffix(META_SUFFIX)?;
                validate_run_id(run_id).ok()?;
                let modified = dirent
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                Some(Entry {
                    run_id: run_id.to_string(),
                    modified,
                })
            })
            .collect();

        entries.sort_by_key(|e| Reverse((e.modified, e.run_id.clone())));
        Ok(entries)
    }
}
