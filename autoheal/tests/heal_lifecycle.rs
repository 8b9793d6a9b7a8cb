//! Loop-level tests for the heal controller against a real `.autoheal/` layout.
//!
//! Each test drives `HealLoopController::run` with scripted test outcomes and
//! checks the durable run log it leaves behind.

use std::collections::BTreeSet;

use anyhow::{Result, ensure};

use autoheal::core::heal_state::attempted_hypotheses;
use autoheal::core::invariants::attempt_count;
use autoheal::core::types::{FailureCategory, StageEntry, StageKind, StageOutcome};
use autoheal::heal::{HealLoopController, HealOutcome};
use autoheal::io::config::AutohealConfig;
use autoheal::io::hooks::{FixRequest, Fixer};
use autoheal::io::incident::list_incidents;
use autoheal::io::run_log::RunLogStore;
use autoheal::io::test_runner::TestRunOutcome;
use autoheal::test_support::{
    RecordingFixer, RecordingSink, ScriptedEvidence, ScriptedTestRunner, TestWorkspace,
};

const LOCATOR_FAILURE: &str = "Error: locator.click: Timeout 30000ms exceeded.\n  waiting for getByRole('button', { name: 'Sign in' })";

fn locator_failure() -> TestRunOutcome {
    TestRunOutcome::Failed {
        output: LOCATOR_FAILURE.to_string(),
    }
}

fn small_config() -> AutohealConfig {
    let mut cfg = AutohealConfig::default();
    cfg.heal.max_attempts = 4;
    cfg.heal.deep_analysis_threshold = 3;
    cfg
}

fn kinds(run_logs: &RunLogStore, feature: &str) -> Vec<StageKind> {
    run_logs
        .read(feature)
        .expect("read")
        .iter()
        .map(|r| r.kind)
        .collect()
}

fn heal<F: Fixer>(
    ws: &TestWorkspace,
    runner: &ScriptedTestRunner,
    fixer: &F,
    evidence: &ScriptedEvidence,
    sink: &RecordingSink,
    feature: &str,
) -> Result<HealOutcome> {
    let run_logs = ws.run_logs();
    let classifier = ws.classifier();
    HealLoopController::from_config(
        &ws.config,
        &run_logs,
        &ws.paths,
        &classifier,
        runner,
        fixer,
        evidence,
        sink,
    )
    .run(feature)
}

/// Login scenario with the reference policy (25 attempts, deep analysis at 12).
///
/// Attempts 1..=12 fail on a locator; the FIX for attempt 12 must follow a
/// DEEP_ANALYSIS record; attempt 13 passes.
#[test]
fn login_heals_after_deep_analysis() {
    let ws = TestWorkspace::new().expect("workspace");
    let mut script: Vec<TestRunOutcome> = (0..12).map(|_| locator_failure()).collect();
    script.push(TestRunOutcome::Passed);
    let runner = ScriptedTestRunner::new(script);
    let evidence = ScriptedEvidence::suggesting(
        "wait.visible-before-action",
        "button renders after hydration",
    );
    let (fixer, sink) = (RecordingFixer::default(), RecordingSink::default());

    let outcome = heal(&ws, &runner, &fixer, &evidence, &sink, "login").expect("heal");
    assert_eq!(outcome, HealOutcome::Success { attempts: 13 });
    runner.assert_drained();
    assert_eq!(runner.attempts(), (1..=13).collect::<Vec<u32>>());

    let run_logs = ws.run_logs();
    let records = run_logs.read("login").expect("read");
    assert_eq!(attempt_count(&records), 13);
    assert_eq!(records.last().map(|r| r.kind), Some(StageKind::Success));

    let deep = records
        .iter()
        .position(|r| r.kind == StageKind::DeepAnalysis)
        .expect("deep analysis recorded");
    assert_eq!(
        records.iter().filter(|r| r.kind == StageKind::DeepAnalysis).count(),
        1
    );
    let fix_12 = records
        .iter()
        .position(|r| r.kind == StageKind::Fix && r.attempt == Some(12))
        .expect("fix 12");
    assert!(deep < fix_12, "deep analysis must precede the FIX for attempt 12");
    assert_eq!(records[deep].payload["attempt"], 12);
    assert_eq!(records[fix_12].hypothesis(), Some("wait.visible-before-action"));
    assert_eq!(evidence.calls(), 1);

    for run in records.iter().filter(|r| r.is_failed_run()) {
        assert_eq!(run.category(), Some(FailureCategory::Locator));
    }
    assert_eq!(fixer.applied().len(), 12);
    assert_eq!(sink.promoted(), vec!["login".to_string()]);
    assert!(run_logs.validate("login").expect("validate").is_empty());
}

#[test]
fn exhausted_budget_abandons_with_distinct_hypotheses() {
    let ws = TestWorkspace::new().expect("workspace");
    let runner = ScriptedTestRunner::new((0..25).map(|_| locator_failure()).collect());
    let (fixer, evidence, sink) = (
        RecordingFixer::default(),
        ScriptedEvidence::default(),
        RecordingSink::default(),
    );

    let outcome = heal(&ws, &runner, &fixer, &evidence, &sink, "checkout").expect("heal");
    let HealOutcome::Abandoned {
        attempts,
        hypotheses,
    } = outcome
    else {
        panic!("expected abandonment, got {outcome:?}");
    };
    assert_eq!(attempts, 25);
    assert_eq!(hypotheses.len(), 24);
    let distinct: BTreeSet<&String> = hypotheses.iter().collect();
    assert_eq!(distinct.len(), hypotheses.len(), "hypotheses repeated: {hypotheses:?}");
    assert_eq!(hypotheses[0], "locator.role-based");

    let run_logs = ws.run_logs();
    let records = run_logs.read("checkout").expect("read");
    let abandoned = records.last().expect("records");
    assert_eq!(abandoned.kind, StageKind::Abandoned);
    assert_eq!(abandoned.payload["hypotheses"].as_array().map(Vec::len), Some(24));
    assert_eq!(attempted_hypotheses(&records), hypotheses);
    assert_eq!(sink.pending(), vec!["checkout".to_string()]);
    assert!(sink.promoted().is_empty());
    runner.assert_drained();
}

#[test]
fn restart_after_deep_analysis_does_not_repeat_it() {
    let ws = TestWorkspace::with_config(small_config()).expect("workspace");
    let run_logs = ws.run_logs();
    let failed = |attempt: u32| {
        StageEntry::run(StageOutcome::Fail)
            .with_attempt(attempt)
            .with_note("category", "LOCATOR")
            .with_note("error", LOCATOR_FAILURE)
    };
    run_logs.append("login", failed(1)).expect("run 1");
    run_logs
        .append("login", StageEntry::fix("locator.role-based").with_attempt(1))
        .expect("fix 1");
    run_logs.append("login", failed(2)).expect("run 2");
    run_logs
        .append("login", StageEntry::fix("locator.test-id").with_attempt(2))
        .expect("fix 2");
    run_logs.append("login", failed(3)).expect("run 3");
    // Crashed after recording the analysis, before the FIX.
    run_logs
        .append("login", StageEntry::new(StageKind::DeepAnalysis).with_note("attempt", 3))
        .expect("deep");

    let runner = ScriptedTestRunner::new(vec![TestRunOutcome::Passed]);
    let (fixer, evidence, sink) = (
        RecordingFixer::default(),
        ScriptedEvidence::default(),
        RecordingSink::default(),
    );
    let outcome = heal(&ws, &runner, &fixer, &evidence, &sink, "login").expect("heal");
    assert_eq!(outcome, HealOutcome::Success { attempts: 4 });
    assert_eq!(evidence.calls(), 0);
    assert_eq!(runner.attempts(), vec![4]);

    assert_eq!(
        kinds(&run_logs, "login")[5..],
        [StageKind::DeepAnalysis, StageKind::Fix, StageKind::Run, StageKind::Success]
    );
    let applied = fixer.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].attempt, 3);
    assert_eq!(applied[0].hypothesis, "locator.scoped-container");
}

#[test]
fn restart_after_fix_runs_the_next_attempt() {
    let ws = TestWorkspace::with_config(small_config()).expect("workspace");
    let failing = RecordingFixer::failing("fixer worker exited with status 1");
    let (evidence, sink) = (ScriptedEvidence::default(), RecordingSink::default());

    let first = ScriptedTestRunner::new(vec![locator_failure()]);
    let err = heal(&ws, &first, &failing, &evidence, &sink, "login").unwrap_err();
    assert!(format!("{err:#}").contains("fixer worker exited"), "{err:#}");
    assert_eq!(
        kinds(&ws.run_logs(), "login"),
        vec![StageKind::Run, StageKind::Fix]
    );

    let second = ScriptedTestRunner::new(vec![TestRunOutcome::Passed]);
    let fixer = RecordingFixer::default();
    let outcome = heal(&ws, &second, &fixer, &evidence, &sink, "login").expect("heal");
    assert_eq!(outcome, HealOutcome::Success { attempts: 2 });
    assert_eq!(second.attempts(), vec![2]);
    assert!(fixer.applied().is_empty());
}

#[test]
fn infrastructure_failures_do_not_consume_attempts() {
    let ws = TestWorkspace::with_config(small_config()).expect("workspace");
    let (fixer, evidence, sink) = (
        RecordingFixer::default(),
        ScriptedEvidence::default(),
        RecordingSink::default(),
    );

    let broken = ScriptedTestRunner::new(vec![TestRunOutcome::Infrastructure {
        message: "spawn npx: No such file or directory".to_string(),
    }]);
    let outcome = heal(&ws, &broken, &fixer, &evidence, &sink, "login").expect("heal");
    assert!(
        matches!(outcome, HealOutcome::Infrastructure { pending_attempt: 1, .. }),
        "{outcome:?}"
    );

    let runner = ScriptedTestRunner::new(vec![
        locator_failure(),
        TestRunOutcome::Infrastructure {
            message: "browser crashed".to_string(),
        },
    ]);
    let outcome = heal(&ws, &runner, &fixer, &evidence, &sink, "login").expect("heal");
    assert!(
        matches!(outcome, HealOutcome::Infrastructure { pending_attempt: 2, .. }),
        "{outcome:?}"
    );

    let runner = ScriptedTestRunner::new(vec![TestRunOutcome::Passed]);
    let outcome = heal(&ws, &runner, &fixer, &evidence, &sink, "login").expect("heal");
    assert_eq!(outcome, HealOutcome::Success { attempts: 2 });
    assert_eq!(runner.attempts(), vec![2]);

    let incidents = list_incidents(&ws.paths, "login").expect("incidents");
    let pending: Vec<u32> = incidents.iter().map(|i| i.pending_attempt).collect();
    assert_eq!(pending, vec![1, 2]);
}

#[test]
fn early_deep_analysis_is_refused_and_the_loop_escalates_at_the_threshold() {
    let mut cfg = AutohealConfig::default();
    cfg.heal.max_attempts = 8;
    cfg.heal.deep_analysis_threshold = 6;
    let ws = TestWorkspace::with_config(cfg).expect("workspace");
    let run_logs = ws.run_logs();
    for (attempt, hypothesis) in [
        (1, "locator.role-based"),
        (2, "locator.test-id"),
        (3, "locator.scoped-container"),
    ] {
        run_logs
            .append(
                "login",
                StageEntry::run(StageOutcome::Fail)
                    .with_note("category", "LOCATOR")
                    .with_note("error", LOCATOR_FAILURE),
            )
            .expect("run");
        run_logs
            .append("login", StageEntry::fix(hypothesis).with_attempt(attempt))
            .expect("fix");
    }
    let err = run_logs
        .append("login", StageEntry::new(StageKind::DeepAnalysis))
        .unwrap_err();
    assert!(err.to_string().contains("RESEARCH"), "{err}");
    run_logs
        .append("login", StageEntry::new(StageKind::Research))
        .expect("research");

    let mut script: Vec<TestRunOutcome> = (0..3).map(|_| locator_failure()).collect();
    script.push(TestRunOutcome::Passed);
    let runner = ScriptedTestRunner::new(script);
    let evidence = ScriptedEvidence::suggesting("wait.visible-before-action", "late hydration");
    let (fixer, sink) = (RecordingFixer::default(), RecordingSink::default());
    let outcome = heal(&ws, &runner, &fixer, &evidence, &sink, "login").expect("heal");
    assert_eq!(outcome, HealOutcome::Success { attempts: 7 });
    assert_eq!(evidence.calls(), 1);

    let records = run_logs.read("login").expect("read");
    let deep: Vec<_> = records
        .iter()
        .filter(|r| r.kind == StageKind::DeepAnalysis)
        .collect();
    assert_eq!(deep.len(), 1);
    assert_eq!(deep[0].payload["attempt"], 6);
}

#[test]
fn malformed_evidence_suggestion_falls_back_to_the_catalogue() {
    let ws = TestWorkspace::with_config(small_config()).expect("workspace");
    let runner = ScriptedTestRunner::new(vec![
        locator_failure(),
        locator_failure(),
        locator_failure(),
        TestRunOutcome::Passed,
    ]);
    let evidence =
        ScriptedEvidence::suggesting("try-this\n<!-- autoheal:stage PLAN -->", "odd suggestion");
    let (fixer, sink) = (RecordingFixer::default(), RecordingSink::default());

    let outcome = heal(&ws, &runner, &fixer, &evidence, &sink, "login").expect("heal");
    assert_eq!(outcome, HealOutcome::Success { attempts: 4 });
    assert_eq!(evidence.calls(), 1);

    let run_logs = ws.run_logs();
    let records = run_logs.read("login").expect("read");
    assert_eq!(
        attempted_hypotheses(&records),
        vec![
            "locator.role-based".to_string(),
            "locator.test-id".to_string(),
            "locator.scoped-container".to_string(),
        ]
    );
    assert!(run_logs.validate("login").expect("validate").is_empty());
}

/// Fixer that checks the FIX it is asked to apply is already on disk.
struct DurabilityCheckingFixer {
    run_logs: RunLogStore,
}

impl Fixer for DurabilityCheckingFixer {
    fn apply_fix(&self, request: &FixRequest) -> Result<()> {
        let last = self
            .run_logs
            .last_stage(&request.feature)?
            .ok_or_else(|| anyhow::anyhow!("run log missing"))?;
        ensure!(last.kind == StageKind::Fix, "last record is {}", last.kind);
        ensure!(last.attempt == Some(request.attempt), "attempt mismatch");
        ensure!(
            last.hypothesis() == Some(request.hypothesis.as_str()),
            "hypothesis mismatch"
        );
        Ok(())
    }
}

#[test]
fn fix_is_recorded_before_it_is_applied() {
    let ws = TestWorkspace::with_config(small_config()).expect("workspace");
    let fixer = DurabilityCheckingFixer {
        run_logs: ws.run_logs(),
    };
    let runner = ScriptedTestRunner::new(vec![
        locator_failure(),
        locator_failure(),
        TestRunOutcome::Passed,
    ]);
    let (evidence, sink) = (ScriptedEvidence::default(), RecordingSink::default());
    let outcome = heal(&ws, &runner, &fixer, &evidence, &sink, "login").expect("heal");
    assert_eq!(outcome, HealOutcome::Success { attempts: 3 });
}
