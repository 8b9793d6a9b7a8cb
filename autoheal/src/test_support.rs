//! Test-only helpers: deterministic records, scripted collaborators, temp workspaces.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::core::classifier::Classifier;
use crate::core::types::{StageKind, StageOutcome, StageRecord};
use crate::io::config::{AutohealConfig, write_config};
use crate::io::context::ContextCache;
use crate::io::hooks::{
    ArtifactSink, Evidence, EvidenceGatherer, EvidenceRequest, FixRequest, Fixer,
};
use crate::io::paths::{AutohealPaths, init_layout};
use crate::io::run_log::RunLogStore;
use crate::io::session::SessionStore;
use crate::io::test_runner::{TestRunOutcome, TestRunner};
use crate::io::worker::{ResearchRequest, ResearchWorker, WorkerExit};

/// Fixed timestamp so records compare equal across runs.
pub fn fixed_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_767_225_600, 0).unwrap_or_default()
}

/// Record with an empty payload and a fixed timestamp.
pub fn record(kind: StageKind, attempt: Option<u32>, outcome: Option<StageOutcome>) -> StageRecord {
    StageRecord {
        kind,
        timestamp: fixed_time(),
        attempt,
        outcome,
        payload: Map::new(),
    }
}

/// Failed RUN carrying an error excerpt and category in its payload.
pub fn failed_run(attempt: u32, error: &str, category: &str) -> StageRecord {
    let mut run = record(StageKind::Run, Some(attempt), Some(StageOutcome::Fail));
    run.payload.insert("error".to_string(), Value::from(error));
    run.payload.insert("category".to_string(), Value::from(category));
    run
}

pub fn fix(attempt: u32, hypothesis: &str) -> StageRecord {
    record(
        StageKind::Fix,
        Some(attempt),
        Some(StageOutcome::Hypothesis(hypothesis.to_string())),
    )
}

fn pop_script<T>(queue: &Mutex<VecDeque<T>>, what: &str) -> Result<T> {
    queue
        .lock()
        .map_err(|_| anyhow!("{what} script poisoned"))?
        .pop_front()
        .ok_or_else(|| anyhow!("{what} script exhausted"))
}

fn remaining<T>(queue: &Mutex<VecDeque<T>>) -> usize {
    queue.lock().map(|q| q.len()).unwrap_or(0)
}

/// Test runner that replays queued outcomes.
pub struct ScriptedTestRunner {
    outcomes: Mutex<VecDeque<TestRunOutcome>>,
    attempts: Mutex<Vec<u32>>,
}

impl ScriptedTestRunner {
    pub fn new(outcomes: Vec<TestRunOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Attempt numbers the runner was invoked with, in order.
    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn assert_drained(&self) {
        assert_eq!(remaining(&self.outcomes), 0, "unused scripted test outcomes");
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run_test(&self, _feature: &str, attempt: u32) -> Result<TestRunOutcome> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(attempt);
        }
        pop_script(&self.outcomes, "test runner")
    }
}

/// Fixer that records every request and optionally fails.
#[derive(Default)]
pub struct RecordingFixer {
    applied: Mutex<Vec<FixRequest>>,
    fail_with: Option<String>,
}

impl RecordingFixer {
    pub fn failing(message: &str) -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            fail_with: Some(message.to_string()),
        }
    }

    pub fn applied(&self) -> Vec<FixRequest> {
        self.applied.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl Fixer for RecordingFixer {
    fn apply_fix(&self, request: &FixRequest) -> Result<()> {
        if let Ok(mut applied) = self.applied.lock() {
            applied.push(request.clone());
        }
        match &self.fail_with {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

/// Evidence gatherer returning the same evidence on every call.
#[derive(Default)]
pub struct ScriptedEvidence {
    evidence: Evidence,
    calls: AtomicUsize,
}

impl ScriptedEvidence {
    pub fn suggesting(hypothesis: &str, notes: &str) -> Self {
        Self {
            evidence: Evidence {
                notes: notes.to_string(),
                suggested_hypothesis: Some(hypothesis.to_string()),
            },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EvidenceGatherer for ScriptedEvidence {
    fn gather(&self, _request: &EvidenceRequest) -> Result<Evidence> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.evidence.clone())
    }
}

/// Artifact sink that records promotions and pending marks.
#[derive(Default)]
pub struct RecordingSink {
    promoted: Mutex<Vec<String>>,
    pending: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn promoted(&self) -> Vec<String> {
        self.promoted.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn pending(&self) -> Vec<String> {
        self.pending.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl ArtifactSink for RecordingSink {
    fn promote(&self, feature: &str) -> Result<()> {
        if let Ok(mut promoted) = self.promoted.lock() {
            promoted.push(feature.to_string());
        }
        Ok(())
    }

    fn mark_pending_manual_fix(&self, feature: &str, _hypotheses: &[String]) -> Result<()> {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(feature.to_string());
        }
        Ok(())
    }
}

/// What one scripted research pass does.
#[derive(Debug, Clone)]
pub enum WorkerScript {
    /// Write every requested artifact.
    WriteAll,
    /// Sleep, then write every requested artifact.
    SlowWriteAll(Duration),
    /// Write only the named artifacts.
    Write(Vec<String>),
    TimeOut,
    Crash(String),
}

/// Research worker that counts spawns and replays scripted passes.
pub struct ScriptedResearchWorker {
    script: Mutex<VecDeque<WorkerScript>>,
    spawns: AtomicUsize,
}

impl ScriptedResearchWorker {
    pub fn new(script: Vec<WorkerScript>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            spawns: AtomicUsize::new(0),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn assert_drained(&self) {
        assert_eq!(remaining(&self.script), 0, "unused scripted research passes");
    }
}

impl ResearchWorker for ScriptedResearchWorker {
    fn research(&self, request: &ResearchRequest) -> Result<WorkerExit> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let step = pop_script(&self.script, "research worker")?;
        fs::create_dir_all(&request.output_dir)?;
        let write = |names: &[String]| -> Result<()> {
            for name in names {
                fs::write(
                    request.output_dir.join(format!("{name}.md")),
                    format!("# {name} for {}\n", request.feature),
                )?;
            }
            Ok(())
        };
        match step {
            WorkerScript::WriteAll => write(&request.artifacts)?,
            WorkerScript::SlowWriteAll(delay) => {
                thread::sleep(delay);
                write(&request.artifacts)?;
            }
            WorkerScript::Write(names) => write(&names)?,
            WorkerScript::TimeOut => {
                return Ok(WorkerExit::TimedOut {
                    after: Duration::from_secs(180),
                });
            }
            WorkerScript::Crash(message) => return Ok(WorkerExit::Crashed { message }),
        }
        Ok(WorkerExit::Completed)
    }
}

/// Temp project with an initialised `.autoheal/` layout.
pub struct TestWorkspace {
    temp: tempfile::TempDir,
    pub paths: AutohealPaths,
    pub config: AutohealConfig,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Self::with_config(AutohealConfig::default())
    }

    pub fn with_config(config: AutohealConfig) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = init_layout(temp.path(), false)?;
        write_config(&paths.config_path, &config)?;
        Ok(Self {
            temp,
            paths,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn run_logs(&self) -> RunLogStore {
        RunLogStore::from_config(self.paths.clone(), &self.config)
    }

    pub fn sessions(&self) -> SessionStore {
        SessionStore::new(self.paths.clone(), self.config.lock_timeout())
    }

    pub fn context(&self) -> ContextCache {
        ContextCache::new(self.paths.clone(), self.config.context.required_artifacts.clone())
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::from_config(&self.config.classifier.rules)
    }

    /// Write every required artifact for `feature`.
    pub fn write_bundle(&self, feature: &str) -> Result<()> {
        let cache = self.context();
        fs::create_dir_all(cache.dir(feature))?;
        for name in cache.required_artifacts() {
            fs::write(cache.artifact_path(feature, name), format!("# {name}\n"))?;
        }
        Ok(())
    }
}
