//! Top-level CLI definition and dispatch.

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use scenario_triage::analysis::analyzer::Diagnosis;
use scenario_triage::core::config::Config;
use scenario_triage::core::errors::{ErrorReport, TriageError};
use scenario_triage::features::{CoverageReport, FeatureListing};
use scenario_triage::results::store::{RetentionReport, TestRun};
use scenario_triage::results::summary::{RunSummary, ScenarioStatus};
use scenario_triage::runner::orchestrator::RunRequest;
use scenario_triage::service::{
    AnalyzeRequest, FailureDetails, FailureQuery, Outcome, ResultsResponse, RunResponse,
    ToolCall, TriageService,
};
use scenario_triage::triage::context::{BuiltContext, ContextRequest};

/// Scenario triage: run the BDD suite, keep its results, explain its failures.
#[derive(Debug, Parser)]
#[command(
    name = "triage",
    author,
    version,
    about = "Run behave suites and triage their failures",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// List feature files and their scenarios.
    ListFeatures(ListFeaturesArgs),
    /// Run the suite (or a filtered part of it) and wait for the result.
    Run(RunArgs),
    /// Show the summary of the newest run.
    Last,
    /// Show the summary of one run.
    Results(ResultsArgs),
    /// Show failed scenarios of a run.
    Failures(FailuresArgs),
    /// Count features and scenarios per area.
    Coverage,
    /// Categorize a failure and suggest a fix.
    Analyze(AnalyzeArgs),
    /// Build the failure context for a scenario.
    Context(ScenarioArgs),
    /// List recent runs, newest first.
    Runs(RunsArgs),
    /// Delete runs beyond the retention count.
    Prune(PruneArgs),
    /// View configuration state.
    Config(ConfigArgs),
    /// Serve line-delimited JSON tool calls on stdin/stdout.
    Serve,
    /// Show version and optional build metadata.
    Version(VersionArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct ListFeaturesArgs {
    /// Area to list: api, ui, or all.
    #[arg(long = "type", default_value = "all", value_name = "AREA")]
    feature_type: String,
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Tag expression passed to the runner (e.g. `@smoke`).
    #[arg(long, value_name = "EXPR")]
    tags: Option<String>,
    /// Feature file or directory, relative to the project root.
    #[arg(long, value_name = "PATH")]
    feature: Option<String>,
    /// Scenario name filter.
    #[arg(long, value_name = "NAME")]
    scenario: Option<String>,
    /// Ask the runner for a dry run.
    #[arg(long)]
    dry_run: bool,
    /// Wall-clock limit in seconds (configured default when omitted).
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct ResultsArgs {
    /// Run id, as printed by `triage run`.
    run_id: String,
}

#[derive(Debug, Clone, Args)]
struct FailuresArgs {
    /// Case-insensitive scenario name filter.
    #[arg(long, value_name = "NAME")]
    scenario: Option<String>,
    /// Run id (newest run when omitted).
    #[arg(long = "run", value_name = "RUN_ID")]
    run_id: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ScenarioArgs {
    /// Scenario name (exact or substring).
    #[arg(value_name = "NAME")]
    name: Option<String>,
    /// Scenario id or `file:line:name` identity.
    #[arg(long, value_name = "ID")]
    scenario_id: Option<String>,
    /// Feature file that disambiguates same-named scenarios.
    #[arg(long, value_name = "PATH")]
    feature_file: Option<String>,
    /// Run id (newest run when omitted).
    #[arg(long = "run", value_name = "RUN_ID")]
    run_id: Option<String>,
}

impl ScenarioArgs {
    fn request(&self) -> ContextRequest {
        ContextRequest {
            scenario_id: self.scenario_id.clone(),
            scenario_name: self.name.clone(),
            feature_file: self.feature_file.clone(),
            run_id: self.run_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Args)]
struct AnalyzeArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,
    /// Context id built earlier in the same process (useful from `serve`).
    #[arg(long, value_name = "ID")]
    context_id: Option<String>,
    /// Do not embed the screenshot.
    #[arg(long)]
    no_screenshot: bool,
}

#[derive(Debug, Clone, Args)]
struct RunsArgs {
    /// Maximum number of runs to show.
    #[arg(long, default_value_t = 20, value_name = "N")]
    limit: usize,
}

#[derive(Debug, Clone, Args)]
struct PruneArgs {
    /// Runs to keep (configured retention when omitted).
    #[arg(long, value_name = "N")]
    keep: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path in use.
    Path,
    /// Print the effective configuration.
    Show,
    /// Load and validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct VersionArgs {
    /// Include build metadata.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

impl From<TriageError> for CliError {
    fn from(err: TriageError) -> Self {
        match err {
            TriageError::InvalidRunId { .. }
            | TriageError::InvalidArgument { .. }
            | TriageError::PathEscapesRoot { .. }
            | TriageError::FeaturePathNotFound { .. } => Self::User(err.to_string()),
            TriageError::Serialization { .. } => Self::Internal(err.to_string()),
            _ => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Config(args) => run_config(cli, args),
        Command::Version(args) => emit_version(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
        command => {
            let service = open_service(cli)?;
            run_tool(cli, &service, command)
        }
    }
}

fn open_service(cli: &Cli) -> Result<TriageService, CliError> {
    let config =
        Config::load(cli.config.as_deref()).map_err(|e| CliError::Runtime(e.to_string()))?;
    if cli.verbose {
        eprintln!(
            "[TRG-CLI] config={} root={} reports={}",
            config.paths.config_file.display(),
            config.paths.project_root.display(),
            config.paths.reports_dir.display()
        );
    }
    Ok(TriageService::new(config))
}

fn run_tool(cli: &Cli, service: &TriageService, command: &Command) -> Result<(), CliError> {
    match command {
        Command::ListFeatures(args) => emit(
            cli,
            "list-features",
            service.list_features(&args.feature_type)?,
            print_features,
        ),
        Command::Run(args) => {
            let request = RunRequest {
                tags: args.tags.clone(),
                feature_path: args.feature.clone(),
                scenario_name: args.scenario.clone(),
                dry_run: args.dry_run,
                timeout_seconds: args.timeout,
            };
            emit(cli, "run", service.run_tests(&request)?, print_run)
        }
        Command::Last => emit(cli, "last", service.get_last_results()?, print_results),
        Command::Results(args) => emit(
            cli,
            "results",
            service.get_results(&args.run_id)?,
            print_results,
        ),
        Command::Failures(args) => {
            let query = FailureQuery {
                scenario_name: args.scenario.clone(),
                run_id: args.run_id.clone(),
            };
            emit(
                cli,
                "failures",
                service.get_failure_details(&query)?,
                print_failures,
            )
        }
        Command::Coverage => emit(cli, "coverage", service.get_test_coverage()?, print_coverage),
        Command::Analyze(args) => {
            let request = AnalyzeRequest {
                context_id: args.context_id.clone(),
                scenario: args.scenario.request(),
                include_screenshot: !args.no_screenshot,
            };
            emit(
                cli,
                "analyze",
                service.analyze_failure(&request)?,
                print_diagnosis,
            )
        }
        Command::Context(args) => emit(
            cli,
            "context",
            service.build_context(&args.request())?,
            print_context,
        ),
        Command::Runs(args) => emit(
            cli,
            "runs",
            service.list_runs(args.limit)?,
            |runs: &Vec<TestRun>| print_runs(runs),
        ),
        Command::Prune(args) => emit(cli, "prune", service.prune(args.keep)?, print_prune),
        Command::Serve => serve(service),
        Command::Config(_) | Command::Version(_) | Command::Completions(_) => Err(
            CliError::Internal("command handled before service start".to_string()),
        ),
    }
}

/// Print an outcome. Input-class failures exit 1; other structured
/// failures are a normal result.
fn emit<T: Serialize>(
    cli: &Cli,
    command: &str,
    outcome: Outcome<T>,
    human: fn(&T),
) -> Result<(), CliError> {
    let input_error = match &outcome {
        Outcome::Failure(report) => report.code.starts_with("TRG-12"),
        Outcome::Ok(_) => false,
    };
    match output_mode(cli) {
        OutputMode::Json => {
            let mut payload = serde_json::to_value(&outcome)?;
            if let Value::Object(map) = &mut payload {
                map.insert("command".to_string(), Value::String(command.to_string()));
            }
            write_json_line(&payload)?;
        }
        OutputMode::Human => match &outcome {
            Outcome::Ok(value) => {
                if !cli.quiet {
                    human(value);
                }
            }
            Outcome::Failure(report) => print_failure(report),
        },
    }
    if input_error {
        return Err(CliError::User(format!("{command} rejected its input")));
    }
    Ok(())
}

fn serve(service: &TriageService) -> Result<(), CliError> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ToolCall>(&line) {
            Ok(call) => match service.dispatch(&call) {
                Ok(value) => value,
                Err(err) => serde_json::to_value(ErrorReport::from_error(&err))?,
            },
            Err(err) => serde_json::to_value(ErrorReport::from_error(
                &TriageError::InvalidArgument {
                    details: format!("malformed request: {err}"),
                },
            ))?,
        };
        write_json_line(&response)?;
        io::stdout().flush()?;
    }
    Ok(())
}

// ──────────────────── human output ────────────────────

fn status_label(status: ScenarioStatus) -> String {
    match status {
        ScenarioStatus::Passed => status.as_str().green().to_string(),
        ScenarioStatus::Failed => status.as_str().red().bold().to_string(),
        ScenarioStatus::Skipped => status.as_str().yellow().to_string(),
    }
}

fn print_failure(report: &ErrorReport) {
    eprintln!("{} {}", "error:".red().bold(), report.error);
    if let Some(run_id) = &report.run_id {
        eprintln!("  run: {run_id}");
    }
    if let Some(context_id) = &report.context_id {
        eprintln!("  context: {context_id}");
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Scenarios: {} total, {} passed, {} failed, {} skipped ({:.2}s)",
        summary.total_scenarios,
        summary.passed.to_string().green(),
        summary.failed.to_string().red(),
        summary.skipped.to_string().yellow(),
        summary.duration_seconds
    );
    for failure in &summary.failures {
        println!(
            "  {} {} ({}:{})",
            "✗".red(),
            failure.name,
            failure.feature_file,
            failure.line.map_or_else(|| "?".to_string(), |l| l.to_string())
        );
        if let Some(step) = &failure.failed_step {
            println!("      step: {}", step.display());
        }
        if let Some(error) = failure.error_message.as_deref().and_then(|e| e.lines().next()) {
            println!("      error: {error}");
        }
    }
}

fn print_run(run: &RunResponse) {
    println!("Run {}: {}", run.run_id, run.status);
    if let Some(code) = run.exit_code {
        println!("  exit code: {code}");
    }
    println!("  duration: {:.1}s", run.duration_ms as f64 / 1000.0);
    if let Some(path) = &run.results_path {
        println!("  results: {}", path.display());
    }
    if let Some(error) = &run.error {
        println!("  {} {error}", "error:".red());
    }
    if let Some(summary) = &run.summary {
        print_summary(summary);
    } else if !run.stderr_tail.is_empty() {
        println!("--- stderr (tail) ---\n{}", run.stderr_tail);
    }
}

fn print_results(results: &ResultsResponse) {
    println!(
        "Run {} ({}, created {})",
        results.run_id, results.status, results.created_at
    );
    if results.dry_run {
        println!("  dry run");
    }
    print_summary(&results.summary);
}

fn print_failures(details: &FailureDetails) {
    println!("Run {}: {} failure(s)", details.run_id, details.failures.len());
    for failure in &details.failures {
        println!("  {} [{}]", failure.scenario.name, status_label(failure.scenario.status));
        println!("      feature: {}", failure.scenario.feature_file);
        if let Some(step) = &failure.scenario.failed_step {
            println!("      step: {}", step.display());
        }
        if let Some(error) = &failure.scenario.error_message {
            println!("      error: {error}");
        }
        if let Some(path) = &failure.screenshot_path {
            println!("      screenshot: {}", path.display());
        }
    }
}

fn print_features(listing: &FeatureListing) {
    for (key, feature) in &listing.features {
        println!("{key}  {} ({} scenarios)", feature.name, feature.scenarios.len());
        for scenario in &feature.scenarios {
            let tags = scenario.tags.join(" ");
            println!("    - {} {}", scenario.name, tags.dimmed());
        }
    }
}

fn print_coverage(report: &CoverageReport) {
    for (label, area) in [("api", &report.api), ("ui", &report.ui)] {
        println!("{label}: {} features, {} scenarios", area.features, area.scenarios);
        for file in &area.files {
            println!("    {:<40} {}", file.name, file.scenario_count);
        }
    }
    println!(
        "total: {} features, {} scenarios",
        report.total_features, report.total_scenarios
    );
}

fn print_diagnosis(d: &Diagnosis) {
    println!("{} ({})", d.scenario.bold(), d.context_id);
    println!(
        "  category: {}  confidence: {:.2}{}",
        d.category.as_str().yellow(),
        d.confidence,
        if d.cached { "  (cached context)" } else { "" }
    );
    println!("  likely cause: {}", d.likely_cause);
    for item in &d.evidence {
        println!("    - {item}");
    }
    for s in &d.suggestions {
        println!("  suggestion {}:{} ({:.2})", s.file, s.line, s.confidence);
        if let Some(current) = &s.current_code {
            println!("      - {current}");
        }
        if let Some(suggested) = &s.suggested_code {
            println!("      + {suggested}");
        }
        println!("      {}", s.explanation);
    }
    if let Some(path) = &d.screenshot_path {
        let note = if d.screenshot_too_large { " (too large to embed)" } else { "" };
        println!("  screenshot: {}{note}", path.display());
    }
}

fn print_context(built: &BuiltContext) {
    let ctx = &built.context;
    println!(
        "{} [{}] {}",
        ctx.context_id,
        status_label(ctx.scenario.status),
        if built.cached { "(cached)" } else { "" }
    );
    println!("  scenario: {} ({})", ctx.scenario.name, ctx.scenario.feature_file);
    println!("  run: {}", ctx.run_id);
    if let Some(step) = &ctx.failed_step {
        println!("  failed step: {}", step.display());
    }
    if let Some(error) = &ctx.error {
        println!("  error: {error}");
    }
    if let Some(def) = &ctx.step_definition {
        println!("  definition: {}:{}", def.file, def.line);
    }
    for related in &ctx.related_code {
        println!("  related: {} {}:{}", related.symbol, related.file, related.line);
    }
    println!(
        "  logs: {} line(s){}",
        ctx.logs.len(),
        if ctx.logs_truncated { ", truncated" } else { "" }
    );
    if let Some(path) = &ctx.screenshot_path {
        println!("  screenshot: {}", path.display());
    }
}

fn print_runs(runs: &[TestRun]) {
    if runs.is_empty() {
        println!("No runs recorded.");
        return;
    }
    for run in runs {
        println!(
            "{}  {:<10} exit={:<4} {}  {}",
            run.run_id,
            run.status.to_string(),
            run.exit_code.map_or_else(|| "-".to_string(), |c| c.to_string()),
            run.created_at,
            run.filters.tags.as_deref().unwrap_or("")
        );
    }
}

fn print_prune(report: &RetentionReport) {
    println!("kept {}, deleted {}", report.kept, report.deleted.len());
    for run_id in &report.failed {
        println!("  {} could not delete {run_id}", "warning:".yellow());
    }
}

// ──────────────────── config / version ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())
                .map_err(|e| CliError::Runtime(e.to_string()))?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config
                    .stable_hash()
                    .map_err(|e| CliError::Runtime(e.to_string()))?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                            "code": e.code(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

fn emit_version(cli: &Cli, args: &VersionArgs) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let target = option_env!("TARGET").unwrap_or("unknown");
    let profile = option_env!("PROFILE").unwrap_or("unknown");
    let git_sha = option_env!("GIT_SHA").unwrap_or("unknown");

    match output_mode(cli) {
        OutputMode::Human => {
            println!("triage {version}");
            if args.verbose {
                println!("package: {package}");
                println!("target: {target}");
                println!("profile: {profile}");
                println!("git_sha: {git_sha}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "binary": "triage",
                "version": version,
                "package": package,
                "build": {
                    "target": target,
                    "profile": profile,
                    "git_sha": git_sha,
                }
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("TRIAGE_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
