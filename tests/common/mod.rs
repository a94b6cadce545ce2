#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

/// Environment a test process may inherit that would change the config.
const SCRUBBED_ENV: [&str; 12] = [
    "TRIAGE_PROJECT_ROOT",
    "TRIAGE_REPORTS_DIR",
    "TRIAGE_SCREENSHOT_DIR",
    "TRIAGE_ACTIVITY_LOG",
    "TRIAGE_RETENTION_KEEP",
    "TRIAGE_DEFAULT_TIMEOUT_SECS",
    "TRIAGE_MAX_LOG_BYTES",
    "TRIAGE_SCREENSHOT_MAX_BYTES",
    "TRIAGE_RUNNER_PATH",
    "TRIAGE_OUTPUT_FORMAT",
    "TRIAGE_INTERPRETER",
    "VIRTUAL_ENV",
];

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// First stdout line parsed as JSON.
    pub fn json(&self) -> serde_json::Value {
        let line = self.stdout.lines().next().unwrap_or_default();
        serde_json::from_str(line).unwrap_or_else(|e| {
            panic!("stdout is not JSON ({e}); log: {}", self.log_path.display())
        })
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_triage") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "triage.exe" } else { "triage" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve triage binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    run_cli_case_with_env(case_name, args, &[])
}

pub fn run_cli_case_with_env(case_name: &str, args: &[&str], env: &[(&str, &str)]) -> CmdResult {
    run_cli_case_full(case_name, args, env, None)
}

pub fn run_cli_case_full(
    case_name: &str,
    args: &[&str],
    env: &[(&str, &str)],
    stdin: Option<&str>,
) -> CmdResult {
    use std::io::Write;
    use std::process::Stdio;

    let root = std::env::temp_dir().join("triage-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .env("RUST_BACKTRACE", "1")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for key in SCRUBBED_ENV {
        command.env_remove(key);
    }
    for (key, value) in env {
        command.env(key, value);
    }
    let mut child = command.spawn().expect("execute triage command");
    {
        let mut pipe = child.stdin.take().expect("stdin pipe");
        if let Some(input) = stdin {
            pipe.write_all(input.as_bytes()).expect("write stdin");
        }
    }
    let output = child.wait_with_output().expect("wait for triage command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("env={env:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// A throwaway project root with a config file that disables the module
/// check, so the runner always comes from `TRIAGE_RUNNER_PATH`.
pub struct Project {
    pub dir: tempfile::TempDir,
}

impl Project {
    pub fn new() -> Self {
        Self::with_config("")
    }

    pub fn with_config(extra: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        for sub in ["features/api", "features/ui", "steps", "pages", "reports"] {
            fs::create_dir_all(dir.path().join(sub)).expect("project layout");
        }
        let config = format!("[runner]\ncheck_module = false\nkill_grace_ms = 200\n{extra}\n");
        fs::write(dir.path().join("triage.toml"), config).expect("write config");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> String {
        self.root().join("triage.toml").to_string_lossy().into_owned()
    }

    pub fn reports(&self) -> PathBuf {
        self.root().join("reports")
    }

    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, content).expect("write project file");
        path
    }

    /// Executable shell script under `bin/`.
    #[cfg(unix)]
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = self.write(&format!("bin/{name}"), &format!("#!/bin/sh\n{body}\n"));
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
        path
    }

    /// Run the CLI in JSON mode against this project.
    pub fn triage(&self, case_name: &str, runner: Option<&Path>, args: &[&str]) -> CmdResult {
        self.triage_stdin(case_name, runner, args, None)
    }

    pub fn triage_stdin(
        &self,
        case_name: &str,
        runner: Option<&Path>,
        args: &[&str],
        stdin: Option<&str>,
    ) -> CmdResult {
        let config = self.config_path();
        let mut full = vec!["--config", config.as_str(), "--json"];
        full.extend_from_slice(args);
        let runner = runner.map(|p| p.to_string_lossy().into_owned());
        let env: Vec<(&str, &str)> = runner
            .as_deref()
            .map(|r| vec![("TRIAGE_RUNNER_PATH", r)])
            .unwrap_or_default();
        run_cli_case_full(case_name, &full, &env, stdin)
    }
}

/// Shell body of a fake runner that copies `report` to its `--outfile`
/// argument and prints a line to stdout.
pub fn report_writer_body(report: &Path) -> String {
    format!(
        r#"out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --outfile) out="$2"; shift ;;
  esac
  shift
done
echo "2026-01-01 10:00:00 | INFO | runner | starting"
[ -n "$out" ] && cp "{}" "$out"
echo "2026-01-01 10:00:01 | INFO | runner | done"
exit 0"#,
        report.display()
    )
}

/// A behave-shaped report with `passed` passing scenarios tagged `@smoke`
/// and `failed` failing ones.
pub fn behave_report(passed: usize, failed: usize) -> String {
    let mut elements = Vec::new();
    for i in 0..passed {
        elements.push(serde_json::json!({
            "type": "scenario",
            "keyword": "Scenario",
            "name": format!("Smoke check {i}"),
            "location": format!("features/api/smoke.feature:{}", 3 + i * 4),
            "tags": ["smoke"],
            "steps": [
                {"keyword": "Given", "name": "the API is up", "result": {"status": "passed", "duration": 0.01}},
                {"keyword": "Then", "name": "it answers", "result": {"status": "passed", "duration": 0.02}}
            ]
        }));
    }
    for i in 0..failed {
        elements.push(serde_json::json!({
            "type": "scenario",
            "keyword": "Scenario",
            "name": format!("Broken checkout {i}"),
            "location": format!("features/ui/checkout.feature:{}", 5 + i * 4),
            "tags": ["ui"],
            "steps": [
                {"keyword": "Given", "name": "I am on the cart page", "result": {"status": "passed", "duration": 0.5}},
                {"keyword": "When", "name": "I press checkout", "result": {
                    "status": "failed",
                    "duration": 30.0,
                    "error_message": [
                        "playwright._impl._errors.TimeoutError: Locator.click: Timeout 30000ms exceeded.",
                        "Call log:",
                        "  - waiting for locator(\"#checkout-btn\")"
                    ]
                }},
                {"keyword": "Then", "name": "the order is placed", "result": {"status": "skipped"}}
            ]
        }));
    }
    serde_json::json!([{
        "keyword": "Feature",
        "name": "Shop",
        "location": "features/api/smoke.feature:1",
        "tags": [],
        "elements": elements
    }])
    .to_string()
}
