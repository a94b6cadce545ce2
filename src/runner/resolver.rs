//! Executable resolver: locate the test-runner command.
//!
//! Resolution order, first success wins:
//! 1. the runner module under the active interpreter (`python -m behave`)
//! 2. an explicit path from `TRIAGE_RUNNER_PATH`
//! 3. conventional virtualenv locations under the project root
//! 4. the bare command name on `PATH`

#![allow(missing_docs)]

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;

use crate::core::config::RunnerConfig;
use crate::core::errors::{Result, TriageError};

/// Environment variable naming an explicit runner executable.
pub const RUNNER_PATH_ENV: &str = "TRIAGE_RUNNER_PATH";

/// Which rung of the fallback chain produced the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerSource {
    Module,
    EnvOverride,
    Virtualenv,
    SearchPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRunner {
    pub argv: Vec<String>,
    pub source: RunnerSource,
}

/// Resolver inputs. Environment lookups are captured up front so tests can
/// drive every branch without touching the process environment.
#[derive(Debug, Clone)]
pub struct ExecutableResolver {
    config: RunnerConfig,
    project_root: PathBuf,
    virtual_env: Option<PathBuf>,
    override_path: Option<PathBuf>,
    search_path: Option<OsString>,
}

impl ExecutableResolver {
    /// Resolver reading `VIRTUAL_ENV`, `TRIAGE_RUNNER_PATH` and `PATH`.
    #[must_use]
    pub fn from_env(config: &RunnerConfig, project_root: &Path) -> Self {
        Self {
            config: config.clone(),
            project_root: project_root.to_path_buf(),
            virtual_env: env::var_os("VIRTUAL_ENV").map(PathBuf::from),
            override_path: env::var_os(RUNNER_PATH_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            search_path: env::var_os("PATH"),
        }
    }

    #[must_use]
    pub fn with_override(mut self, path: Option<PathBuf>) -> Self {
        self.override_path = path;
        self
    }

    #[must_use]
    pub fn with_search_path(mut self, path: Option<OsString>) -> Self {
        self.search_path = path;
        self
    }

    #[must_use]
    pub fn with_virtual_env(mut self, path: Option<PathBuf>) -> Self {
        self.virtual_env = path;
        self
    }

    pub fn resolve(&self) -> Result<ResolvedRunner> {
        let mut tried = Vec::new();

        if self.config.check_module {
            let interpreter = self.interpreter();
            tried.push(format!("{interpreter} -m {}", self.config.module));
            if self.module_available(&interpreter) {
                return Ok(ResolvedRunner {
                    argv: vec![interpreter, "-m".to_string(), self.config.module.clone()],
                    source: RunnerSource::Module,
                });
            }
        }

        // An explicit override is trusted as given; a bad path surfaces as a
        // spawn error on the run itself.
        if let Some(path) = &self.override_path {
            return Ok(ResolvedRunner {
                argv: vec![path.to_string_lossy().into_owned()],
                source: RunnerSource::EnvOverride,
            });
        }
        tried.push(format!("${RUNNER_PATH_ENV} (unset)"));

        for candidate in &self.config.venv_candidates {
            let path = if candidate.is_absolute() {
                candidate.clone()
            } else {
                self.project_root.join(candidate)
            };
            tried.push(path.display().to_string());
            if is_executable(&path) {
                return Ok(ResolvedRunner {
                    argv: vec![path.to_string_lossy().into_owned()],
                    source: RunnerSource::Virtualenv,
                });
            }
        }

        tried.push(format!("{} on PATH", self.config.command));
        if let Some(path) = self.which(&self.config.command) {
            return Ok(ResolvedRunner {
                argv: vec![path.to_string_lossy().into_owned()],
                source: RunnerSource::SearchPath,
            });
        }

        Err(TriageError::ExecutableNotFound { tried })
    }

    fn interpreter(&self) -> String {
        self.virtual_env
            .as_ref()
            .map(|venv| venv.join("bin").join("python"))
            .filter(|p| is_executable(p))
            .map_or_else(
                || self.config.interpreter.clone(),
                |p| p.to_string_lossy().into_owned(),
            )
    }

    fn module_available(&self, interpreter: &str) -> bool {
        let import_check = format!(
            "import importlib.util, sys; sys.exit(0 if importlib.util.find_spec({:?}) else 1)",
            self.config.module
        );
        Command::new(interpreter)
            .arg("-c")
            .arg(import_check)
            .current_dir(&self.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    fn which(&self, command: &str) -> Option<PathBuf> {
        let search = self.search_path.as_ref()?;
        env::split_paths(search)
            .map(|dir| dir.join(command))
            .find(|p| is_executable(p))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
