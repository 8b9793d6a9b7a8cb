//! Collaborators the heal loop drives: fixer, evidence gatherer, artifact sink.
//!
//! Each is a trait so the controller can be exercised with scripted fakes.
//! [`CommandHooks`] implements all three by piping a JSON event to a configured
//! command; an empty command turns the step into a logged no-op.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::core::types::FailureCategory;
use crate::io::config::HooksConfig;
use crate::io::process::{CommandSpec, ProcessOutput, run_bounded};

/// Edit to apply for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRequest {
    pub feature: String,
    pub attempt: u32,
    pub hypothesis: String,
    pub summary: String,
    pub category: FailureCategory,
    pub error_excerpt: String,
}

pub trait Fixer {
    fn apply_fix(&self, request: &FixRequest) -> Result<()>;
}

/// Input to the expanded evidence pass at the deep-analysis threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceRequest {
    pub feature: String,
    pub attempt: u32,
    pub category: FailureCategory,
    pub error_excerpt: String,
    pub tried_hypotheses: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Evidence {
    pub notes: String,
    pub suggested_hypothesis: Option<String>,
}

pub trait EvidenceGatherer {
    fn gather(&self, request: &EvidenceRequest) -> Result<Evidence>;
}

/// Moves draft test artifacts once the heal loop concludes.
pub trait ArtifactSink {
    fn promote(&self, feature: &str) -> Result<()>;
    fn mark_pending_manual_fix(&self, feature: &str, hypotheses: &[String]) -> Result<()>;
}

/// Command-backed implementation of every collaborator.
#[derive(Debug, Clone)]
pub struct CommandHooks {
    config: HooksConfig,
    root: PathBuf,
}

impl CommandHooks {
    pub fn new(config: HooksConfig, root: PathBuf) -> Self {
        Self { config, root }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.hook_timeout_secs)
    }

    /// Run `argv` with `event` on stdin. `Ok(None)` when no command is configured.
    #[instrument(skip(self, argv, event))]
    fn run_hook(
        &self,
        name: &str,
        argv: &[String],
        event: serde_json::Value,
    ) -> Result<Option<ProcessOutput>> {
        if argv.is_empty() {
            debug!(hook = name, "no command configured, skipping");
            return Ok(None);
        }
        let input = serde_json::to_vec(&event)?;
        let output = run_bounded(
            CommandSpec::new(argv, &self.root, self.timeout())
                .stdin(input)
                .env("AUTOHEAL_HOOK", name),
        )?;
        if output.timed_out {
            return Err(anyhow!(
                "{name} hook timed out after {}s",
                self.config.hook_timeout_secs
            ));
        }
        if !output.success {
            return Err(anyhow!(
                "{name} hook exited with status {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(Some(output))
    }
}

impl Fixer for CommandHooks {
    fn apply_fix(&self, request: &FixRequest) -> Result<()> {
        info!(
            feature = %request.feature,
            attempt = request.attempt,
            hypothesis = %request.hypothesis,
            "applying fix"
        );
        self.run_hook(
            "fix",
            &self.config.fix_command,
            json!({ "event": "fix", "fix": request }),
        )?;
        Ok(())
    }
}

impl EvidenceGatherer for CommandHooks {
    fn gather(&self, request: &EvidenceRequest) -> Result<Evidence> {
        let event = json!({ "event": "evidence", "evidence": request });
        let Some(output) = self.run_hook("evidence", &self.config.evidence_command, event)? else {
            return Ok(Evidence::default());
        };
        Ok(parse_evidence(&output.stdout))
    }
}

impl ArtifactSink for CommandHooks {
    fn promote(&self, feature: &str) -> Result<()> {
        let event = json!({ "event": "promote", "feature": feature });
        self.run_hook("promote", &self.config.promote_command, event)?;
        Ok(())
    }

    fn mark_pending_manual_fix(&self, feature: &str, hypotheses: &[String]) -> Result<()> {
        let event = json!({
            "event": "pending_manual_fix",
            "feature": feature,
            "hypotheses": hypotheses,
        });
        self.run_hook("pending", &self.config.pending_command, event)?;
        Ok(())
    }
}

/// Evidence hooks may answer with JSON (`notes`, `suggestedHypothesis`) or plain text.
pub fn parse_evidence(stdout: &str) -> Evidence {
    let trimmed = stdout.trim();
    match serde_json::from_str::<Evidence>(trimmed) {
        Ok(evidence) if trimmed.starts_with('{') => evidence,
        _ => Evidence {
            notes: trimmed.to_string(),
            suggested_hypothesis: None,
        },
    }
}
