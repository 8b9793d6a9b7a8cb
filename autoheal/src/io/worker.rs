//! Research worker: the one subprocess a context build spawns.
//!
//! [`ResearchWorker`] separates the builder from the backend. The command-backed
//! worker renders `prompts/research.md` to stdin and points the child at the
//! bundle directory through `AUTOHEAL_*` environment variables.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{info, instrument, warn};

use crate::io::process::{CommandSpec, SpawnError, run_bounded};

const RESEARCH_TEMPLATE: &str = include_str!("prompts/research.md");

/// Everything the worker needs to produce a bundle.
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    pub feature: String,
    pub ticket: Option<String>,
    pub description: Option<String>,
    pub project_id: String,
    pub root: PathBuf,
    pub output_dir: PathBuf,
    pub artifacts: Vec<String>,
    pub log_path: PathBuf,
}

/// How the worker process ended. Artifact validation happens in the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Completed,
    TimedOut { after: Duration },
    Crashed { message: String },
}

pub trait ResearchWorker {
    /// Run one research pass, writing artifacts into `request.output_dir`.
    fn research(&self, request: &ResearchRequest) -> Result<WorkerExit>;
}

/// Worker that spawns a configured command.
#[derive(Debug, Clone)]
pub struct CommandResearchWorker {
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ResearchWorker for CommandResearchWorker {
    #[instrument(
        skip_all,
        fields(feature = %request.feature, timeout_secs = self.timeout.as_secs())
    )]
    fn research(&self, request: &ResearchRequest) -> Result<WorkerExit> {
        fs::create_dir_all(&request.output_dir)
            .with_context(|| format!("create bundle dir {}", request.output_dir.display()))?;
        let prompt = render_research_prompt(request)?;

        let spec = CommandSpec::new(&self.argv, &request.root, self.timeout)
            .stdin(prompt)
            .output_limit(self.output_limit_bytes)
            .env("AUTOHEAL_FEATURE", request.feature.clone())
            .env("AUTOHEAL_OUTPUT_DIR", request.output_dir.display().to_string())
            .env("AUTOHEAL_PROJECT", request.project_id.clone())
            .env("AUTOHEAL_ARTIFACTS", request.artifacts.join(","))
            .env("AUTOHEAL_TICKET", request.ticket.clone().unwrap_or_default());

        info!("starting research worker");
        let output = match run_bounded(spec) {
            Ok(output) => output,
            Err(err) => {
                if let Some(spawn) = err.downcast_ref::<SpawnError>() {
                    warn!(err = %spawn, "research worker failed to start");
                    return Ok(WorkerExit::Crashed {
                        message: spawn.to_string(),
                    });
                }
                return Err(err).context("run research worker");
            }
        };

        fs::write(&request.log_path, output.combined())
            .with_context(|| format!("write worker log {}", request.log_path.display()))?;

        if output.timed_out {
            warn!("research worker timed out");
            return Ok(WorkerExit::TimedOut {
                after: self.timeout,
            });
        }
        if !output.success {
            warn!(exit_code = ?output.exit_code, "research worker failed");
            return Ok(WorkerExit::Crashed {
                message: format!(
                    "research worker exited with status {:?} (see {})",
                    output.exit_code,
                    request.log_path.display()
                ),
            });
        }
        Ok(WorkerExit::Completed)
    }
}

pub fn render_research_prompt(request: &ResearchRequest) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("research", RESEARCH_TEMPLATE)
        .context("load research template")?;
    let rendered = env.get_template("research")?.render(context! {
        feature => &request.feature,
        project_id => &request.project_id,
        root => request.root.display().to_string(),
        output_dir => request.output_dir.display().to_string(),
        ticket => request.ticket.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        description => request.description.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        artifacts => &request.artifacts,
    })?;
    Ok(rendered)
}
