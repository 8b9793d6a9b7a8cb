//! CLI tests: spawn the `autoheal` binary and check exit codes and stdout JSON.

use std::path::Path;
use std::process::{Command, Output};

use autoheal::exit_codes;
use autoheal::io::config::{AutohealConfig, write_config};
use autoheal::io::paths::{AutohealPaths, init_layout};

fn autoheal(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_autoheal"))
        .current_dir(root)
        .args(args)
        .output()
        .expect("spawn autoheal")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is json")
}

#[test]
fn run_test_without_a_log_is_blocked() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_layout(temp.path(), false).expect("init");

    let output = autoheal(temp.path(), &["gate", "run-test", "login"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
    let decision = stdout_json(&output);
    assert_eq!(decision["decision"], "block");
    assert!(
        decision["remediation"]
            .as_str()
            .is_some_and(|r| r.contains("autoheal runlog append login plan"))
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("next:"), "{stderr}");
}

#[test]
fn recorded_plan_allows_run_and_delivers_hint_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = autoheal(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));

    let append = autoheal(temp.path(), &["runlog", "append", "login", "plan"]);
    assert_eq!(append.status.code(), Some(exit_codes::OK), "{append:?}");
    assert_eq!(stdout_json(&append)["kind"], "PLAN");

    assert_eq!(
        autoheal(temp.path(), &["session", "init", "s1"]).status.code(),
        Some(exit_codes::OK)
    );
    let first = autoheal(temp.path(), &["gate", "run-test", "login", "--session", "s1"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&first)["decision"], "allow");
    assert!(String::from_utf8_lossy(&first.stderr).contains("hint:"));

    let second = autoheal(temp.path(), &["gate", "run-test", "login", "--session", "s1"]);
    assert_eq!(second.status.code(), Some(exit_codes::OK));
    assert!(!String::from_utf8_lossy(&second.stderr).contains("hint:"));
}

#[test]
fn rejected_append_exits_with_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_layout(temp.path(), false).expect("init");

    let output = autoheal(
        temp.path(),
        &["runlog", "append", "login", "fix", "--outcome", "locator.test-id"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    assert!(String::from_utf8_lossy(&output.stderr).contains("FIX requires a preceding RUN"));
}

#[test]
fn heal_without_a_log_is_blocked() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_layout(temp.path(), false).expect("init");

    let output = autoheal(temp.path(), &["heal", "login"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
    assert!(!AutohealPaths::new(temp.path()).run_log_path("login").exists());
}

#[cfg(unix)]
#[test]
fn heal_records_success_for_a_passing_command() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_layout(temp.path(), false).expect("init");
    let mut cfg = AutohealConfig::default();
    cfg.test.command = vec!["true".to_string()];
    write_config(&paths.config_path, &cfg).expect("config");

    let plan = autoheal(temp.path(), &["runlog", "append", "login", "plan"]);
    assert_eq!(plan.status.code(), Some(exit_codes::OK));

    let output = autoheal(temp.path(), &["heal", "login"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");
    assert!(String::from_utf8_lossy(&output.stdout).contains("SUCCESS after 1 attempt"));

    let again = autoheal(temp.path(), &["heal", "login"]);
    assert_eq!(again.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&again.stdout).contains("already SUCCESS"));

    let validate = autoheal(temp.path(), &["runlog", "validate", "login"]);
    assert_eq!(validate.status.code(), Some(exit_codes::OK));
}

#[test]
fn context_exists_reports_missing_artifacts() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_layout(temp.path(), false).expect("init");

    let output = autoheal(temp.path(), &["context", "exists", "checkout"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let report = stdout_json(&output);
    assert_eq!(report["missing"], serde_json::json!(["patterns", "codebase"]));
}
