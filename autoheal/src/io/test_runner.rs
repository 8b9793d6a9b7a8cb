//! Test execution seam for the heal loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandSpec, SpawnError, run_bounded};

/// Exit status shells use for "command not found".
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestRunOutcome {
    Passed,
    /// The test ran and failed; `output` is the runner's combined output.
    Failed { output: String },
    /// The runner itself could not run the test. Does not consume an attempt.
    Infrastructure { message: String },
}

pub trait TestRunner {
    fn run_test(&self, feature: &str, attempt: u32) -> Result<TestRunOutcome>;
}

/// Runs the configured test command with the feature id appended.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    pub argv: Vec<String>,
    pub root: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip(self))]
    fn run_test(&self, feature: &str, attempt: u32) -> Result<TestRunOutcome> {
        let mut argv = self.argv.clone();
        argv.push(feature.to_string());
        let spec = CommandSpec::new(&argv, &self.root, self.timeout)
            .output_limit(self.output_limit_bytes)
            .env("AUTOHEAL_FEATURE", feature)
            .env("AUTOHEAL_ATTEMPT", attempt.to_string());

        let output = match run_bounded(spec) {
            Ok(output) => output,
            Err(err) => {
                if let Some(spawn) = err.downcast_ref::<SpawnError>() {
                    return Ok(TestRunOutcome::Infrastructure {
                        message: spawn.to_string(),
                    });
                }
                return Err(err).context("run test command");
            }
        };

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "test runner hung");
            return Ok(TestRunOutcome::Infrastructure {
                message: format!(
                    "test runner did not finish within {}s\n{}",
                    self.timeout.as_secs(),
                    output.combined()
                ),
            });
        }
        if output.exit_code == Some(EXIT_COMMAND_NOT_FOUND) {
            return Ok(TestRunOutcome::Infrastructure {
                message: format!("test runner command not found\n{}", output.combined()),
            });
        }
        debug!(exit_code = ?output.exit_code, "test finished");
        if output.success {
            Ok(TestRunOutcome::Passed)
        } else {
            Ok(TestRunOutcome::Failed {
                output: output.combined(),
            })
        }
    }
}
