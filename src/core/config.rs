//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TriageError};
use crate::core::paths::resolve_absolute_path;

/// Config file name looked up under the project root.
pub const CONFIG_FILE_NAME: &str = "triage.toml";

/// Full triage configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub runner: RunnerConfig,
    pub retention: RetentionConfig,
    pub triage: TriageConfig,
}

/// Project layout. Relative entries resolve against `project_root`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub project_root: PathBuf,
    pub config_file: PathBuf,
    pub features_dir: PathBuf,
    pub steps_dir: PathBuf,
    pub pages_dir: PathBuf,
    pub services_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub screenshot_dir: PathBuf,
    pub activity_log: PathBuf,
    pub env_file: PathBuf,
}

/// How the test runner is located and supervised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Interpreter checked for the runner module. `$VIRTUAL_ENV/bin/python`
    /// wins over this when set.
    pub interpreter: String,
    pub module: String,
    /// Bare command name resolved against `PATH` as the last resort.
    pub command: String,
    pub venv_candidates: Vec<PathBuf>,
    /// Skip the interpreter module check entirely.
    pub check_module: bool,
    pub default_timeout_secs: u64,
    pub kill_grace_ms: u64,
    pub stdout_tail_bytes: usize,
    pub stderr_tail_bytes: usize,
}

/// How many past runs stay on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    pub keep: usize,
}

/// Failure context and analysis bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TriageConfig {
    pub max_log_bytes: usize,
    pub max_error_chars: usize,
    pub log_window_secs: u64,
    pub screenshot_max_bytes: u64,
    pub related_code_limit: usize,
    pub snippet_radius: usize,
    pub environment_keys: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let root = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            config_file: root.join(CONFIG_FILE_NAME),
            project_root: root,
            features_dir: PathBuf::from("features"),
            steps_dir: PathBuf::from("steps"),
            pages_dir: PathBuf::from("pages"),
            services_dir: PathBuf::from("services"),
            reports_dir: PathBuf::from("reports"),
            screenshot_dir: PathBuf::from("reports/screenshots"),
            activity_log: PathBuf::from("reports/triage-activity.jsonl"),
            env_file: PathBuf::from(".env"),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            module: "behave".to_string(),
            command: "behave".to_string(),
            venv_candidates: vec![
                PathBuf::from(".venv/bin/behave"),
                PathBuf::from("venv/bin/behave"),
            ],
            check_module: true,
            default_timeout_secs: 300,
            kill_grace_ms: 500,
            stdout_tail_bytes: 2_000,
            stderr_tail_bytes: 1_000,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { keep: 10 }
    }
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            max_log_bytes: 1_048_576,
            max_error_chars: 1_000,
            log_window_secs: 30,
            screenshot_max_bytes: 5 * 1_048_576,
            related_code_limit: 2,
            snippet_radius: 10,
            environment_keys: [
                "BASE_URL",
                "API_BASE_URL",
                "BROWSER",
                "HEADLESS",
                "DEFAULT_TIMEOUT",
                "NAVIGATION_TIMEOUT",
                "LOG_LEVEL",
                "ADMIN_USERNAME",
                "ADMIN_PASSWORD",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

impl Config {
    /// Default configuration path: `$TRIAGE_PROJECT_ROOT/triage.toml`, else
    /// `./triage.toml`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        env_var("TRIAGE_PROJECT_ROOT").map_or_else(
            || PathsConfig::default().config_file,
            |root| PathBuf::from(root).join(CONFIG_FILE_NAME),
        )
    }

    /// Defaults rooted at `root`, with no file or environment input.
    #[must_use]
    pub fn for_project(root: &Path) -> Self {
        let mut cfg = Self::default();
        cfg.paths.project_root = root.to_path_buf();
        cfg.paths.config_file = root.join(CONFIG_FILE_NAME);
        cfg.normalize_paths();
        cfg
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| TriageError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let table: toml::Value = toml::from_str(&raw)?;
            let explicit_root = table
                .get("paths")
                .and_then(|paths| paths.get("project_root"))
                .is_some();
            let mut parsed: Self = table.try_into()?;
            if !explicit_root {
                // Without an explicit root, the file's directory is the project.
                if let Some(parent) = path_buf.parent().filter(|p| !p.as_os_str().is_empty()) {
                    parsed.paths.project_root = parent.to_path_buf();
                }
            }
            parsed
        } else if is_explicit_path {
            return Err(TriageError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides()?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a so the value is stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        set_env_path("TRIAGE_PROJECT_ROOT", &mut self.paths.project_root);
        set_env_path("TRIAGE_REPORTS_DIR", &mut self.paths.reports_dir);
        set_env_path("TRIAGE_SCREENSHOT_DIR", &mut self.paths.screenshot_dir);
        set_env_path("TRIAGE_ACTIVITY_LOG", &mut self.paths.activity_log);
        set_env_usize("TRIAGE_RETENTION_KEEP", &mut self.retention.keep)?;
        set_env_u64(
            "TRIAGE_DEFAULT_TIMEOUT_SECS",
            &mut self.runner.default_timeout_secs,
        )?;
        set_env_usize("TRIAGE_MAX_LOG_BYTES", &mut self.triage.max_log_bytes)?;
        set_env_u64(
            "TRIAGE_SCREENSHOT_MAX_BYTES",
            &mut self.triage.screenshot_max_bytes,
        )?;
        if let Some(interpreter) = env_var("TRIAGE_INTERPRETER") {
            self.runner.interpreter = interpreter;
        }
        Ok(())
    }

    fn normalize_paths(&mut self) {
        self.paths.project_root = resolve_absolute_path(&self.paths.project_root);
        let root = self.paths.project_root.clone();
        for slot in [
            &mut self.paths.features_dir,
            &mut self.paths.steps_dir,
            &mut self.paths.pages_dir,
            &mut self.paths.services_dir,
            &mut self.paths.reports_dir,
            &mut self.paths.screenshot_dir,
            &mut self.paths.activity_log,
            &mut self.paths.env_file,
        ] {
            if slot.is_relative() {
                *slot = root.join(&*slot);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.retention.keep == 0 {
            return Err(TriageError::InvalidConfig {
                details: "retention.keep must be >= 1".to_string(),
            });
        }
        if self.runner.default_timeout_secs == 0 {
            return Err(TriageError::InvalidConfig {
                details: "runner.default_timeout_secs must be >= 1".to_string(),
            });
        }
        if self.runner.module.trim().is_empty() || self.runner.command.trim().is_empty() {
            return Err(TriageError::InvalidConfig {
                details: "runner.module and runner.command must not be empty".to_string(),
            });
        }
        if self.triage.max_log_bytes == 0 || self.triage.max_error_chars == 0 {
            return Err(TriageError::InvalidConfig {
                details: "triage.max_log_bytes and triage.max_error_chars must be > 0"
                    .to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_env_path(name: &str, slot: &mut PathBuf) {
    if let Some(raw) = env_var(name) {
        *slot = PathBuf::from(raw);
    }
}

fn set_env_u64(name: &str, slot: &mut u64) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *slot = raw.parse::<u64>().map_err(|error| TriageError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_env_usize(name: &str, slot: &mut usize) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *slot = raw
            .parse::<usize>()
            .map_err(|error| TriageError::ConfigParse {
                context: "env",
                details: format!("{name}={raw:?}: {error}"),
            })?;
    }
    Ok(())
}
