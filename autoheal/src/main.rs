//! `autoheal` command-line interface.
//!
//! Every subcommand is a short-lived process: it loads `.autoheal/config.toml`,
//! touches the persisted stores and exits with a code from [`exit_codes`].

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use autoheal::builder::{BuildFailure, BuildRequest, BuildResult, ContextBuilder};
use autoheal::core::classifier::Classifier;
use autoheal::core::decision::{Decision, GateAction};
use autoheal::core::invariants::attempt_count;
use autoheal::core::types::{StageEntry, StageKind, StageOutcome};
use autoheal::exit_codes;
use autoheal::gate::GateEngine;
use autoheal::heal::{HealLoopController, HealOutcome};
use autoheal::io::config::{AutohealConfig, load_config};
use autoheal::io::context::ContextCache;
use autoheal::io::hooks::CommandHooks;
use autoheal::io::paths::{AutohealPaths, init_layout};
use autoheal::io::run_log::{RunLogError, RunLogStore};
use autoheal::io::session::{SessionError, SessionStore};
use autoheal::io::test_runner::CommandTestRunner;
use autoheal::io::worker::CommandResearchWorker;
use autoheal::logging;

#[derive(Parser)]
#[command(
    name = "autoheal",
    version,
    about = "Workflow gates and autonomous retry for end-to-end test authoring"
)]
struct Cli {
    /// Project root containing `.autoheal/` (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.autoheal/` and a default config if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Ask whether an action may proceed (exit 2 on block).
    Gate {
        /// write-test-file | dispatch-planner | run-test | retry
        action: GateAction,
        feature: String,
        /// Deliver the action's one-time hint for this session.
        #[arg(long)]
        session: Option<String>,
    },
    #[command(subcommand)]
    Session(SessionCommand),
    #[command(subcommand)]
    Context(ContextCommand),
    #[command(subcommand)]
    Runlog(RunlogCommand),
    /// Drive the run/classify/fix loop until SUCCESS, ABANDONED or an infrastructure failure.
    Heal { feature: String },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Start (or reset) a session.
    Init {
        session: String,
        #[arg(long, default_value = "")]
        project: String,
    },
    /// Report whether a hint category was delivered; `--mark` records delivery.
    Hint {
        session: String,
        category: String,
        #[arg(long)]
        mark: bool,
    },
    /// Count one use of a tool and print the new total.
    Usage { session: String, tool: String },
    /// Print the usage summary and delete the session.
    Teardown {
        session: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ContextCommand {
    /// Populate the feature's context bundle (at most one research worker).
    Build {
        feature: String,
        #[arg(long)]
        ticket: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Print whether the bundle is complete.
    Exists { feature: String },
}

#[derive(Subcommand)]
enum RunlogCommand {
    /// Append a stage record.
    Append(AppendArgs),
    /// Append after SUCCESS/ABANDONED, tagging the record as an override.
    Override(AppendArgs),
    /// Print the records of a run log.
    Show { feature: String },
    /// Check a run log against every invariant.
    Validate { feature: String },
    /// List features with a run log; `--recent SECS` keeps those updated within the window.
    List {
        #[arg(long, value_name = "SECS")]
        recent: Option<u64>,
    },
}

#[derive(Args)]
struct AppendArgs {
    feature: String,
    /// analyze | research | plan | write | run | fix | deep-analysis | success | abandoned | learn
    stage: StageKind,
    /// `pass`/`fail` for RUN, the hypothesis id for FIX.
    #[arg(long)]
    outcome: Option<String>,
    #[arg(long)]
    attempt: Option<u32>,
    /// Payload entry `key=value` (value parsed as JSON when possible).
    #[arg(long = "note", value_name = "KEY=VALUE")]
    notes: Vec<String>,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            error_exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let command = match cli.command {
        Command::Init { force } => {
            let paths = init_layout(&root, force)?;
            println!("initialised {}", paths.state_dir.display());
            return Ok(exit_codes::OK);
        }
        command => command,
    };

    let paths = AutohealPaths::new(&root);
    let cfg = load_config(&paths.config_path)?;
    App::new(paths, cfg).dispatch(command)
}

struct App {
    paths: AutohealPaths,
    cfg: AutohealConfig,
    run_logs: RunLogStore,
    sessions: SessionStore,
    context: ContextCache,
}

impl App {
    fn new(paths: AutohealPaths, cfg: AutohealConfig) -> Self {
        Self {
            run_logs: RunLogStore::from_config(paths.clone(), &cfg),
            sessions: SessionStore::new(paths.clone(), cfg.lock_timeout()),
            context: ContextCache::new(paths.clone(), cfg.context.required_artifacts.clone()),
            paths,
            cfg,
        }
    }

    fn dispatch(&self, command: Command) -> Result<i32> {
        match command {
            Command::Init { .. } => bail!("init is handled before config is loaded"),
            Command::Gate {
                action,
                feature,
                session,
            } => self.gate(action, &feature, session.as_deref()),
            Command::Session(cmd) => self.session(cmd),
            Command::Context(cmd) => self.context(cmd),
            Command::Runlog(cmd) => self.runlog(cmd),
            Command::Heal { feature } => self.heal(&feature),
        }
    }

    fn gate_engine(&self) -> GateEngine<'_> {
        GateEngine {
            run_logs: &self.run_logs,
            context: &self.context,
            sessions: &self.sessions,
            same_category_failure_limit: self.cfg.gate.same_category_failure_limit,
        }
    }

    fn gate(&self, action: GateAction, feature: &str, session: Option<&str>) -> Result<i32> {
        let engine = self.gate_engine();
        let decision = engine.evaluate(action, feature);
        print_json(&decision)?;
        match &decision {
            Decision::Allow => {
                if let Some(session) = session
                    && let Some(hint) = engine.deliver_hint(action, feature, session)?
                {
                    eprintln!("hint: {}", hint.text);
                }
                Ok(exit_codes::OK)
            }
            Decision::Block { reason, remediation } => {
                eprintln!("blocked: {reason}\nnext: {remediation}");
                Ok(exit_codes::BLOCKED)
            }
        }
    }

    fn session(&self, cmd: SessionCommand) -> Result<i32> {
        match cmd {
            SessionCommand::Init { session, project } => {
                let project = if project.is_empty() {
                    self.paths.project_id()
                } else {
                    project
                };
                self.sessions.init(&session, &project)?;
            }
            SessionCommand::Hint {
                session,
                category,
                mark,
            } => {
                let delivered = self.sessions.hint_delivered(&session, &category)?;
                if mark && !delivered {
                    self.sessions.mark_hint_delivered(&session, &category)?;
                }
                println!("{}", if delivered { "delivered" } else { "pending" });
            }
            SessionCommand::Usage { session, tool } => {
                let count = self.sessions.increment_tool_usage(&session, &tool)?;
                println!("{count}");
            }
            SessionCommand::Teardown { session, json } => {
                let summary = self.sessions.teardown(&session)?;
                if json {
                    print_json(&summary)?;
                } else {
                    print!("{}", summary.render());
                }
            }
        }
        Ok(exit_codes::OK)
    }

    fn context(&self, cmd: ContextCommand) -> Result<i32> {
        match cmd {
            ContextCommand::Build {
                feature,
                ticket,
                description,
                force,
            } => {
                let worker = CommandResearchWorker {
                    argv: self.cfg.context.worker_command.clone(),
                    timeout: std::time::Duration::from_secs(self.cfg.context.worker_timeout_secs),
                    output_limit_bytes: self.cfg.context.worker_output_limit_bytes,
                };
                let builder =
                    ContextBuilder::from_config(&self.paths, &self.context, &worker, &self.cfg);
                let result = builder.build(&BuildRequest {
                    feature,
                    ticket,
                    description,
                    force,
                })?;
                print_json(&result)?;
                Ok(match result {
                    BuildResult::Ok { .. } => exit_codes::OK,
                    BuildResult::Error {
                        reason: BuildFailure::AlreadyBuilding,
                        ..
                    } => exit_codes::CONTENTION,
                    BuildResult::Error { .. } => exit_codes::ERROR,
                })
            }
            ContextCommand::Exists { feature } => {
                match self.context.bundle(&feature)? {
                    Some(bundle) => print_json(&bundle)?,
                    None => {
                        let missing = self.context.missing_artifacts(&feature)?;
                        print_json(&serde_json::json!({ "feature": feature, "missing": missing }))?;
                    }
                }
                Ok(exit_codes::OK)
            }
        }
    }

    fn runlog(&self, cmd: RunlogCommand) -> Result<i32> {
        match cmd {
            RunlogCommand::Append(args) => {
                let (feature, entry) = args.into_entry()?;
                print_json(&self.run_logs.append(&feature, entry)?)?;
                Ok(exit_codes::OK)
            }
            RunlogCommand::Override(args) => {
                let (feature, entry) = args.into_entry()?;
                print_json(&self.run_logs.append_override(&feature, entry)?)?;
                Ok(exit_codes::OK)
            }
            RunlogCommand::Show { feature } => {
                let records = self.run_logs.read(&feature)?;
                eprintln!(
                    "{feature}: {} records, {} attempts",
                    records.len(),
                    attempt_count(&records)
                );
                print_json(&records)?;
                Ok(exit_codes::OK)
            }
            RunlogCommand::List { recent } => {
                for feature in self.run_logs.features()? {
                    if let Some(window) = recent
                        && !self.run_logs.recently_updated(&feature, window)?
                    {
                        continue;
                    }
                    println!("{feature}");
                }
                Ok(exit_codes::OK)
            }
            RunlogCommand::Validate { feature } => {
                let errors = self.run_logs.validate(&feature)?;
                if errors.is_empty() {
                    println!("ok");
                    return Ok(exit_codes::OK);
                }
                for error in &errors {
                    println!("- {error}");
                }
                Ok(exit_codes::ERROR)
            }
        }
    }

    fn heal(&self, feature: &str) -> Result<i32> {
        if !self.run_logs.exists(feature)? {
            let decision = self.gate_engine().evaluate(GateAction::RunTest, feature);
            if let Decision::Block { reason, remediation } = decision {
                eprintln!("blocked: {reason}\nnext: {remediation}");
                return Ok(exit_codes::BLOCKED);
            }
        }

        let runner = CommandTestRunner {
            argv: self.cfg.test.command.clone(),
            root: self.paths.root.clone(),
            timeout: std::time::Duration::from_secs(self.cfg.test.timeout_secs),
            output_limit_bytes: self.cfg.test.output_limit_bytes,
        };
        let hooks = CommandHooks::new(self.cfg.hooks.clone(), self.paths.root.clone());
        let classifier = Classifier::from_config(&self.cfg.classifier.rules);
        let controller = HealLoopController::from_config(
            &self.cfg,
            &self.run_logs,
            &self.paths,
            &classifier,
            &runner,
            &hooks,
            &hooks,
            &hooks,
        );

        let outcome = controller.run(feature)?;
        Ok(match outcome {
            HealOutcome::Success { attempts } => {
                println!("{feature}: SUCCESS after {attempts} attempt(s)");
                exit_codes::OK
            }
            HealOutcome::Abandoned {
                attempts,
                hypotheses,
            } => {
                println!("{feature}: ABANDONED after {attempts} attempts");
                for hypothesis in hypotheses {
                    println!("  tried {hypothesis}");
                }
                exit_codes::ABANDONED
            }
            HealOutcome::Infrastructure {
                pending_attempt,
                message,
                incident,
            } => {
                eprintln!(
                    "{feature}: test runner failed before attempt {pending_attempt}; see {}\n{}",
                    incident.display(),
                    message.lines().next().unwrap_or_default()
                );
                exit_codes::INFRASTRUCTURE
            }
            HealOutcome::AlreadyFinished { kind, attempts } => {
                println!("{feature}: already {kind} after {attempts} attempt(s)");
                if kind == StageKind::Abandoned {
                    exit_codes::ABANDONED
                } else {
                    exit_codes::OK
                }
            }
        })
    }
}

impl AppendArgs {
    fn into_entry(self) -> Result<(String, StageEntry)> {
        let outcome = match (self.stage, self.outcome) {
            (_, None) => None,
            (StageKind::Run, Some(raw)) => Some(match raw.to_ascii_lowercase().as_str() {
                "pass" => StageOutcome::Pass,
                "fail" => StageOutcome::Fail,
                other => bail!("RUN outcome must be pass or fail (got '{other}')"),
            }),
            (StageKind::Fix, Some(raw)) => Some(StageOutcome::Hypothesis(raw)),
            (kind, Some(_)) => bail!("{kind} does not take --outcome"),
        };
        let mut entry = StageEntry::new(self.stage);
        entry.outcome = outcome;
        entry.attempt = self.attempt;
        for note in &self.notes {
            let (key, raw) = note
                .split_once('=')
                .ok_or_else(|| anyhow!("--note expects KEY=VALUE (got '{note}')"))?;
            let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::from(raw));
            entry = entry.with_note(key, value);
        }
        Ok((self.feature, entry))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    Ok(())
}

fn error_exit_code(err: &anyhow::Error) -> i32 {
    let retryable = err
        .chain()
        .any(|cause| match cause.downcast_ref::<RunLogError>() {
            Some(run_log) => run_log.is_retryable(),
            None => cause
                .downcast_ref::<SessionError>()
                .is_some_and(SessionError::is_retryable),
        });
    if retryable {
        exit_codes::CONTENTION
    } else {
        exit_codes::ERROR
    }
}
