//! End-to-end runs against a fake runner script: the full pipeline from
//! process supervision through stored results to failure analysis.

#![cfg(unix)]

mod common;

use std::fs;
use std::time::{Duration, Instant};

use common::{Project, behave_report, report_writer_body};
use serde_json::Value;

/// Project with a runner that writes `report` and exits 0.
fn project_with_report(report: &str) -> (Project, std::path::PathBuf) {
    let project = Project::new();
    let report_path = project.write("fixtures/report.json", report);
    let runner = project.script("behave", &report_writer_body(&report_path));
    (project, runner)
}

fn meta_files(project: &Project) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(project.reports())
        .expect("reports dir")
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with("_meta.json"))
        .collect();
    names.sort();
    names
}

#[test]
fn smoke_run_is_summarized_and_served_as_last() {
    let (project, runner) = project_with_report(&behave_report(4, 0));

    let run = project.triage("smoke_run", Some(&runner), &["run", "--tags", "@smoke"]);
    assert!(run.status.success(), "log: {}", run.log_path.display());
    let payload = run.json();
    assert_eq!(payload["command"], "run");
    assert_eq!(payload["status"], "completed");
    assert_eq!(payload["exit_code"], 0);
    let summary = &payload["summary"];
    assert_eq!(summary["total_scenarios"], 4);
    assert_eq!(summary["passed"], 4);
    assert_eq!(summary["failed"], 0);
    assert_eq!(summary["skipped"], 0);
    assert!(
        payload["stdout_tail"]
            .as_str()
            .is_some_and(|t| t.contains("runner | done"))
    );
    let run_id = payload["run_id"].as_str().expect("run id").to_string();
    assert!(run_id.starts_with("run_"));

    let last = project.triage("smoke_last", None, &["last"]);
    assert!(last.status.success(), "log: {}", last.log_path.display());
    let last = last.json();
    assert_eq!(last["run_id"], run_id.as_str());
    for key in ["total_scenarios", "passed", "failed", "skipped", "failures"] {
        assert_eq!(last[key], summary[key], "{key} differs between run and last");
    }

    let by_id = project.triage("smoke_results", None, &["results", &run_id]);
    assert_eq!(by_id.json()["total_scenarios"], 4);
}

#[test]
fn runner_receives_filters_and_run_id() {
    let project = Project::new();
    let report_path = project.write("fixtures/report.json", &behave_report(1, 0));
    let args_log = project.root().join("args.txt");
    let body = format!(
        "echo \"$TRIAGE_RUN_ID $@\" > \"{}\"\n{}",
        args_log.display(),
        report_writer_body(&report_path)
    );
    let runner = project.script("behave", &body);
    project.write("features/api/smoke.feature", "Feature: Smoke\n  Scenario: Ping\n    Given up\n");

    let run = project.triage(
        "filters",
        Some(&runner),
        &[
            "run",
            "--tags",
            "@smoke",
            "--feature",
            "features/api/smoke.feature",
            "--scenario",
            "Ping",
        ],
    );
    assert!(run.status.success(), "log: {}", run.log_path.display());
    let run_id = run.json()["run_id"].as_str().unwrap().to_string();

    let seen = fs::read_to_string(&args_log).expect("runner ran");
    assert!(seen.starts_with(&run_id), "runner saw: {seen}");
    assert!(seen.contains("--format json --outfile"), "runner saw: {seen}");
    assert!(seen.contains("--tags @smoke"), "runner saw: {seen}");
    assert!(seen.contains("features/api/smoke.feature"), "runner saw: {seen}");
    assert!(seen.contains("--name Ping"), "runner saw: {seen}");
}

#[test]
fn dry_run_has_no_results() {
    let (project, runner) = project_with_report(&behave_report(2, 0));
    let run = project.triage("dry_run", Some(&runner), &["run", "--dry-run"]);
    assert!(run.status.success(), "log: {}", run.log_path.display());
    let payload = run.json();
    assert_eq!(payload["status"], "completed");
    assert!(payload.get("results_path").is_none_or(Value::is_null));

    let last = project.triage("dry_run_last", None, &["last"]);
    assert_eq!(last.json()["code"], "TRG-2106");
}

#[test]
fn hung_runner_is_killed_at_the_deadline() {
    let project = Project::new();
    let runner = project.script(
        "behave",
        "while true; do echo \"2026-01-01 10:00:00 | INFO | poll | tick\"; sleep 0.1; done",
    );

    let started = Instant::now();
    let run = project.triage("timeout", Some(&runner), &["run", "--timeout", "1"]);
    let elapsed = started.elapsed();

    assert!(run.status.success(), "log: {}", run.log_path.display());
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    let payload = run.json();
    assert_eq!(payload["status"], "timed_out");
    assert!(payload.get("exit_code").is_none_or(Value::is_null));
    assert!(
        payload["stdout_tail"]
            .as_str()
            .is_some_and(|t| t.contains("tick"))
    );
    assert!(
        payload["error"]
            .as_str()
            .is_some_and(|e| e.contains("timed out"))
    );
    let leftovers: Vec<_> = fs::read_dir(project.reports())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn retention_keeps_the_newest_ten() {
    let (project, runner) = project_with_report(&behave_report(1, 0));

    let mut ids = Vec::new();
    for i in 0..11 {
        let run = project.triage(&format!("retention_{i}"), Some(&runner), &["run"]);
        assert!(run.status.success(), "log: {}", run.log_path.display());
        ids.push(run.json()["run_id"].as_str().unwrap().to_string());
    }

    let metas = meta_files(&project);
    assert_eq!(metas.len(), 10, "metas: {metas:?}");
    assert!(
        !metas.iter().any(|m| m.contains(&ids[0])),
        "oldest run survived: {metas:?}"
    );
    assert!(!project.reports().join(format!("results_{}.json", ids[0])).exists());

    let gone = project.triage("retention_gone", None, &["results", &ids[0]]);
    assert_eq!(gone.json()["code"], "TRG-2104");

    let runs = project.triage("retention_runs", None, &["runs", "--limit", "3"]);
    let listed = runs.json();
    let listed = listed.as_array().expect("runs array");
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0]["run_id"], ids[10].as_str());
}

#[test]
fn prune_honors_an_explicit_keep() {
    let (project, runner) = project_with_report(&behave_report(1, 0));
    for i in 0..3 {
        let run = project.triage(&format!("prune_{i}"), Some(&runner), &["run"]);
        assert!(run.status.success(), "log: {}", run.log_path.display());
    }
    let prune = project.triage("prune", None, &["prune", "--keep", "1"]);
    assert!(prune.status.success(), "log: {}", prune.log_path.display());
    assert_eq!(meta_files(&project).len(), 1);

    let zero = project.triage("prune_zero", None, &["prune", "--keep", "0"]);
    assert_eq!(zero.status.code(), Some(1), "log: {}", zero.log_path.display());
}

#[test]
fn empty_report_is_reported_as_empty() {
    let (project, runner) = project_with_report("");
    let run = project.triage("empty_report", Some(&runner), &["run"]);
    assert!(run.status.success(), "log: {}", run.log_path.display());
    assert!(run.json()["error"].as_str().is_some_and(|e| e.contains("TRG-2102")));

    let last = project.triage("empty_report_last", None, &["last"]);
    assert_eq!(last.json()["code"], "TRG-2102");
}

#[test]
fn corrupt_report_is_reported_as_corrupt() {
    let (project, runner) = project_with_report("[{\"name\": \"Shop\", \"elements\": [");
    let run = project.triage("corrupt_report", Some(&runner), &["run"]);
    assert!(run.status.success(), "log: {}", run.log_path.display());

    let last = project.triage("corrupt_report_last", None, &["last"]);
    let payload = last.json();
    assert_eq!(payload["code"], "TRG-2103");
    assert!(payload["run_id"].is_string());
}

#[test]
fn feature_path_outside_the_project_is_rejected() {
    let (project, runner) = project_with_report(&behave_report(1, 0));
    let run = project.triage(
        "path_escape",
        Some(&runner),
        &["run", "--feature", "../../etc/passwd"],
    );
    assert_eq!(run.status.code(), Some(1), "log: {}", run.log_path.display());
    assert!(run.stderr.contains("TRG-12"), "log: {}", run.log_path.display());
    assert!(meta_files(&project).is_empty());
}

#[test]
fn failures_are_detailed_and_diagnosed() {
    let (project, runner) = project_with_report(&behave_report(2, 2));
    project.write(
        "pages/checkout_page.py",
        "class CheckoutPage:\n    CHECKOUT = \"#checkout-btn\"\n",
    );
    project.write(
        "steps/checkout_steps.py",
        "from behave import when\n\n@when('I press checkout')\ndef step_impl(context):\n    context.page.click(CheckoutPage.CHECKOUT)\n",
    );

    let run = project.triage("failures_run", Some(&runner), &["run"]);
    assert!(run.status.success(), "log: {}", run.log_path.display());
    let payload = run.json();
    assert_eq!(payload["summary"]["failed"], 2);
    assert_eq!(payload["summary"]["passed"], 2);
    let run_id = payload["run_id"].as_str().unwrap().to_string();

    let failures = project.triage("failures", None, &["failures"]);
    let failures = failures.json();
    assert_eq!(failures["run_id"], run_id.as_str());
    assert!(
        failures["stdout_tail"]
            .as_str()
            .is_some_and(|t| t.contains("runner | done"))
    );
    assert!(failures["stderr_tail"].is_string());
    assert!(
        failures["results_path"]
            .as_str()
            .is_some_and(|p| p.ends_with(&format!("results_{run_id}.json")))
    );
    let list = failures["failures"].as_array().expect("failures");
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["name"], "Broken checkout 0");

    let narrowed = project.triage(
        "failures_one",
        None,
        &["failures", "--scenario", "checkout 1", "--run", &run_id],
    );
    let narrowed = narrowed.json();
    assert_eq!(narrowed["failures"].as_array().map(Vec::len), Some(1));
    assert_eq!(narrowed["failures"][0]["name"], "Broken checkout 1");

    let context = project.triage("context", None, &["context", "Broken checkout 0"]);
    let context = context.json();
    assert_eq!(context["run_id"], run_id.as_str());
    assert_eq!(context["failed_step"]["text"], "I press checkout");
    assert_eq!(context["step_definition"]["file"], "steps/checkout_steps.py");
    assert_eq!(context["previous_steps"].as_array().map(Vec::len), Some(1));

    let diagnosis = project.triage("analyze", None, &["analyze", "Broken checkout 0"]);
    assert!(diagnosis.status.success(), "log: {}", diagnosis.log_path.display());
    let diagnosis = diagnosis.json();
    assert_eq!(diagnosis["command"], "analyze");
    assert_eq!(diagnosis["category"], "selector_changed");
    assert!(diagnosis["confidence"].as_f64().is_some_and(|c| c > 0.5 && c <= 1.0));
    assert_eq!(diagnosis["context_id"], context["context_id"]);
    let suggestion = &diagnosis["suggestions"][0];
    assert_eq!(suggestion["file"], "pages/checkout_page.py");
    assert_eq!(suggestion["line"], 2);
    assert_eq!(
        suggestion["suggested_code"],
        "CHECKOUT = \"[data-testid='checkout-btn']\""
    );

    let passed = project.triage("analyze_passed", None, &["analyze", "Smoke check 0"]);
    assert_eq!(passed.json()["code"], "TRG-2401");

    let missing = project.triage("analyze_missing", None, &["analyze", "No such scenario"]);
    assert_eq!(missing.json()["code"], "TRG-2201");
}

#[test]
fn serve_keeps_contexts_between_calls() {
    let (project, runner) = project_with_report(&behave_report(0, 1));
    let run = project.triage("serve_run", Some(&runner), &["run"]);
    assert!(run.status.success(), "log: {}", run.log_path.display());

    let input = concat!(
        "{\"tool\":\"build_context\",\"args\":{\"scenario_name\":\"Broken checkout 0\"}}\n",
        "{\"tool\":\"build_context\",\"args\":{\"scenario_name\":\"Broken checkout 0\"}}\n",
    );
    let served = project.triage_stdin("serve_contexts", None, &["serve"], Some(input));
    let replies: Vec<Value> = served
        .stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(replies.len(), 2, "log: {}", served.log_path.display());
    assert_eq!(replies[0]["cached"], false);
    assert_eq!(replies[1]["cached"], true);
    assert_eq!(replies[0]["context_id"], replies[1]["context_id"]);

    let id = replies[0]["context_id"].as_str().unwrap();
    let input = format!(
        "{{\"tool\":\"build_context\",\"args\":{{\"scenario_name\":\"Broken checkout 0\"}}}}\n{{\"tool\":\"analyze_failure\",\"args\":{{\"context_id\":\"{id}\"}}}}\n"
    );
    let served = project.triage_stdin("serve_analyze", None, &["serve"], Some(&input));
    let replies: Vec<Value> = served
        .stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(replies[1]["cached"], true, "log: {}", served.log_path.display());
    assert_eq!(replies[1]["category"], "selector_changed");

    let cold = project.triage("analyze_cold_id", None, &["analyze", "--context-id", id]);
    assert_eq!(cold.json()["code"], "TRG-2202");
}

#[test]
fn oversized_output_is_truncated_in_context() {
    let project = Project::new();
    let report_path = project.write("fixtures/report.json", &behave_report(0, 1));
    let body = format!(
        "yes \"2026-01-01 10:00:00 | INFO | app | filler output line for the log cap\" | head -c 2097152\n{}",
        report_writer_body(&report_path)
    );
    let runner = project.script("behave", &body);

    let run = project.triage("big_output", Some(&runner), &["run"]);
    assert!(run.status.success(), "log: {}", run.log_path.display());
    assert_eq!(run.json()["summary"]["failed"], 1);

    let context = project.triage("big_output_context", None, &["context", "Broken checkout 0"]);
    let context = context.json();
    assert_eq!(context["logs_truncated"], true, "log: {}", context);
    assert_eq!(context["log_source"], "output_log");
    let logs = context["logs"].as_array().expect("logs");
    assert!(!logs.is_empty());
    let joined: usize = logs
        .iter()
        .map(|l| l.as_str().map_or(0, str::len) + 1)
        .sum();
    assert!(joined <= 1_048_576 + 1, "kept {joined} bytes");
}

#[test]
fn secrets_in_runner_output_are_masked() {
    let project = Project::new();
    let report_path = project.write("fixtures/report.json", &behave_report(0, 1));
    let body = format!(
        "echo \"2026-01-01 10:00:00 | DEBUG | auth | sending Authorization: Bearer sk-live-1234567890\"\n{}",
        report_writer_body(&report_path)
    );
    let runner = project.script("behave", &body);
    let run = project.triage("secrets_run", Some(&runner), &["run"]);
    assert!(run.status.success(), "log: {}", run.log_path.display());

    let context = project.triage("secrets_context", None, &["context", "Broken checkout 0"]);
    assert!(!context.stdout.contains("sk-live-1234567890"), "log: {}", context.log_path.display());
}
