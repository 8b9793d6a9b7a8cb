//! Heal loop: run the test, classify failures, record and apply fixes until the
//! test passes or the attempt budget runs out.
//!
//! The controller holds no state of its own. Each turn re-reads the run log and
//! asks [`next_action`] what the log implies, so a crashed or restarted loop
//! continues exactly where the durable record left off. FIX is appended before
//! the fixer runs; DEEP_ANALYSIS is appended before evidence is gathered.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use crate::core::classifier::Classifier;
use crate::core::heal_state::{
    HealAction, HealPolicy, attempted_hypotheses, needs_deep_analysis, next_action,
    tried_hypotheses,
};
use crate::core::hypotheses::select;
use crate::core::invariants::attempt_count;
use crate::core::types::{StageEntry, StageKind, StageOutcome};
use crate::io::config::AutohealConfig;
use crate::io::hooks::{ArtifactSink, EvidenceGatherer, EvidenceRequest, FixRequest, Fixer};
use crate::io::incident::write_incident;
use crate::io::paths::AutohealPaths;
use crate::io::process::tail_excerpt;
use crate::io::run_log::RunLogStore;
use crate::io::test_runner::{TestRunOutcome, TestRunner};

/// How a heal invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealOutcome {
    Success {
        attempts: u32,
    },
    Abandoned {
        attempts: u32,
        hypotheses: Vec<String>,
    },
    /// The runner could not execute the test; no attempt was consumed.
    Infrastructure {
        pending_attempt: u32,
        message: String,
        incident: PathBuf,
    },
    /// The log was already closed when the loop started.
    AlreadyFinished {
        kind: StageKind,
        attempts: u32,
    },
}

pub struct HealLoopController<'a, T, F, E, A> {
    pub run_logs: &'a RunLogStore,
    pub paths: &'a AutohealPaths,
    pub classifier: &'a Classifier,
    pub policy: HealPolicy,
    pub error_excerpt_bytes: usize,
    pub runner: &'a T,
    pub fixer: &'a F,
    pub evidence: &'a E,
    pub sink: &'a A,
}

impl<'a, T, F, E, A> HealLoopController<'a, T, F, E, A>
where
    T: TestRunner,
    F: Fixer,
    E: EvidenceGatherer,
    A: ArtifactSink,
{
    #[allow(clippy::too_many_arguments)]
    pub fn from_config(
        cfg: &AutohealConfig,
        run_logs: &'a RunLogStore,
        paths: &'a AutohealPaths,
        classifier: &'a Classifier,
        runner: &'a T,
        fixer: &'a F,
        evidence: &'a E,
        sink: &'a A,
    ) -> Self {
        Self {
            run_logs,
            paths,
            classifier,
            policy: cfg.heal_policy(),
            error_excerpt_bytes: cfg.heal.error_excerpt_bytes,
            runner,
            fixer,
            evidence,
            sink,
        }
    }

    #[instrument(skip(self))]
    pub fn run(&self, feature: &str) -> Result<HealOutcome> {
        let mut first_turn = true;
        loop {
            let records = self.run_logs.read_optional(feature)?.unwrap_or_default();
            let action = next_action(&records, self.policy);

            match action {
                HealAction::Finished(kind) => {
                    if !first_turn {
                        // Every terminal append returns directly; reaching this
                        // means another writer closed the log under us.
                        warn!(feature, %kind, "log closed by another writer");
                    }
                    return Ok(HealOutcome::AlreadyFinished {
                        kind,
                        attempts: attempt_count(&records),
                    });
                }
                HealAction::RunTest { attempt } => {
                    if let Some(outcome) = self.run_attempt(feature, attempt)? {
                        return Ok(outcome);
                    }
                }
                HealAction::RecordSuccess { attempt } => {
                    self.run_logs.append(
                        feature,
                        StageEntry::new(StageKind::Success).with_note("attempts", attempt),
                    )?;
                    info!(feature, attempt, "test passes, promoting artifacts");
                    self.sink
                        .promote(feature)
                        .with_context(|| format!("promote artifacts for '{feature}'"))?;
                    return Ok(HealOutcome::Success { attempts: attempt });
                }
                HealAction::Diagnose {
                    attempt,
                    error,
                    category,
                } => {
                    let category = category.unwrap_or_else(|| self.classifier.classify(&error));
                    let mut suggested = None;
                    let mut evidence_notes = None;
                    if needs_deep_analysis(&records, self.policy, attempt) {
                        let tried = attempted_hypotheses(&records);
                        self.run_logs.append(
                            feature,
                            StageEntry::new(StageKind::DeepAnalysis).with_payload(object(json!({
                                "attempt": attempt,
                                "category": category,
                                "triedHypotheses": tried,
                            }))),
                        )?;
                        info!(
                            feature,
                            attempt,
                            %category,
                            "deep analysis recorded, gathering evidence"
                        );
                        let evidence = self
                            .evidence
                            .gather(&EvidenceRequest {
                                feature: feature.to_string(),
                                attempt,
                                category,
                                error_excerpt: error.clone(),
                                tried_hypotheses: tried,
                            })
                            .with_context(|| format!("gather evidence for '{feature}'"))?;
                        suggested = evidence.suggested_hypothesis;
                        evidence_notes = Some(evidence.notes).filter(|notes| !notes.is_empty());
                    }

                    let selection = select(
                        category,
                        &tried_hypotheses(&records),
                        suggested.as_deref(),
                        attempt,
                    );
                    let mut entry = StageEntry::fix(selection.id.clone())
                        .with_attempt(attempt)
                        .with_note("category", category.as_str())
                        .with_note("summary", selection.summary.clone())
                        .with_note("rediagnose", selection.rediagnose);
                    if let Some(notes) = evidence_notes {
                        entry = entry.with_note("evidence", notes);
                    }
                    self.run_logs.append(feature, entry)?;
                    info!(
                        feature,
                        attempt,
                        hypothesis = %selection.id,
                        %category,
                        "fix recorded, applying"
                    );

                    self.fixer
                        .apply_fix(&FixRequest {
                            feature: feature.to_string(),
                            attempt,
                            hypothesis: selection.id,
                            summary: selection.summary,
                            category,
                            error_excerpt: error,
                        })
                        .with_context(|| format!("apply fix for '{feature}' attempt {attempt}"))?;
                }
                HealAction::Abandon { attempt } => {
                    let hypotheses = attempted_hypotheses(&records);
                    self.run_logs.append(
                        feature,
                        StageEntry::new(StageKind::Abandoned).with_payload(object(json!({
                            "attempts": attempt,
                            "hypotheses": hypotheses,
                        }))),
                    )?;
                    warn!(feature, attempt, tried = hypotheses.len(), "attempt budget exhausted");
                    self.sink
                        .mark_pending_manual_fix(feature, &hypotheses)
                        .with_context(|| format!("mark '{feature}' pending manual fix"))?;
                    return Ok(HealOutcome::Abandoned {
                        attempts: attempt,
                        hypotheses,
                    });
                }
            }
            first_turn = false;
        }
    }

    /// Execute one attempt and record its RUN. `Some` ends the loop.
    fn run_attempt(&self, feature: &str, attempt: u32) -> Result<Option<HealOutcome>> {
        info!(feature, attempt, "running test");
        match self.runner.run_test(feature, attempt)? {
            TestRunOutcome::Passed => {
                self.run_logs.append(
                    feature,
                    StageEntry::run(StageOutcome::Pass).with_attempt(attempt),
                )?;
                Ok(None)
            }
            TestRunOutcome::Failed { output } => {
                let category = self.classifier.classify(&output);
                let excerpt = tail_excerpt(&output, self.error_excerpt_bytes);
                self.run_logs.append(
                    feature,
                    StageEntry::run(StageOutcome::Fail)
                        .with_attempt(attempt)
                        .with_note("category", category.as_str())
                        .with_note("error", excerpt),
                )?;
                info!(feature, attempt, %category, "test failed");
                Ok(None)
            }
            TestRunOutcome::Infrastructure { message } => {
                let incident = write_incident(self.paths, feature, attempt, &message)?;
                Ok(Some(HealOutcome::Infrastructure {
                    pending_attempt: attempt,
                    message,
                    incident: incident.dir,
                }))
            }
        }
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
