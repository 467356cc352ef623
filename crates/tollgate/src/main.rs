//! Command-line front end for the tollgate engine.
//!
//! Each invocation loads `<project>/.tollgate/config.json`, resumes the
//! persisted session and performs one operation. `hook` mode is the
//! out-of-process adapter: it reads an action descriptor on stdin and
//! answers with the exit-code convention (0 allow, 2 deny).
//!
//! # Examples
//!
//! ```sh
//! tollgate start --role coder
//! tollgate features --add auth-login-form --add auth-logout
//! tollgate transition implement
//! tollgate evidence test-log --exit-code 1 --source "cargo test"
//! tollgate transition test --tests-written tests/login.rs
//! echo '{"kind":"write_file","path":"src/login.rs"}' | tollgate hook pre-action
//! tollgate usage --memory-file transcript.txt
//! tollgate schema > action.schema.json
//! ```

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tollgate::config::EngineConfig;
use tollgate::context::UsageMeter;
use tollgate::controller::{ControllerBuilder, SessionController, StopOutcome};
use tollgate::error::{EngineError, StoreError};
use tollgate::events::LoggingHandler;
use tollgate::hooks::identity::ActorIdentity;
use tollgate::hooks::{Action, ActionEnvelope, HookVerdict, LifecyclePoint, PipelineResult};
use tollgate::session::{LifecycleState, TransitionContext};
use tollgate::store::{Evidence, EvidenceKind, PayloadRef};

/// Exit status that tells the calling agent an action was denied.
const EXIT_DENY: u8 = 2;

/// Session orchestration and enforcement for autonomous coding agents.
#[derive(Parser)]
#[command(name = "tollgate", version)]
struct Cli {
    /// Project directory (config, progress and evidence live under it).
    #[arg(long, short = 'C', global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a fresh session in START.
    Start {
        /// Fixed session id instead of a generated one.
        #[arg(long)]
        session_id: Option<String>,
        /// Write an actor identity record with this role (e.g. tester).
        #[arg(long)]
        role: Option<String>,
    },
    /// Show the current state, active feature and compression level.
    Status,
    /// List features, optionally adding new pending ones first.
    Features {
        #[arg(long = "add")]
        add: Vec<String>,
    },
    /// Propose a lifecycle transition.
    Transition {
        state: LifecycleState,
        /// Feature to bind on entry to IMPLEMENT.
        #[arg(long)]
        feature: Option<String>,
        #[arg(long = "tests-written")]
        tests_written: Vec<String>,
    },
    /// Record a piece of evidence.
    Evidence(EvidenceArgs),
    /// Mark a feature tested (requires passing test evidence).
    MarkTested { feature: String },
    /// Report working-memory usage as a ratio or from a file.
    Usage {
        #[arg(required_unless_present = "memory_file")]
        ratio: Option<f64>,
        #[arg(long, conflicts_with = "ratio")]
        memory_file: Option<PathBuf>,
        /// Context window in tokens when metering a file.
        #[arg(long, default_value_t = tollgate::context::usage::DEFAULT_CONTEXT_WINDOW)]
        max_tokens: usize,
    },
    /// Run the hooks for one lifecycle point on an action read from stdin.
    Hook { point: LifecyclePoint },
    /// End the session.
    End,
    /// Print the JSON Schema of the action descriptor.
    Schema,
}

#[derive(Args)]
struct EvidenceArgs {
    kind: EvidenceKind,
    /// Feature the evidence belongs to. Defaults to the active feature;
    /// health checks default to session scope.
    #[arg(long)]
    feature: Option<String>,
    #[arg(long, conflicts_with = "failed")]
    passed: bool,
    #[arg(long)]
    failed: bool,
    #[arg(long)]
    exit_code: Option<i32>,
    #[arg(long)]
    tests_passed: Option<u32>,
    #[arg(long)]
    tests_failed: Option<u32>,
    #[arg(long)]
    coverage: Option<f64>,
    #[arg(long)]
    artifact: Option<PathBuf>,
    #[arg(long, default_value = "cli")]
    source: String,
}

impl EvidenceArgs {
    fn payload(&self) -> PayloadRef {
        PayloadRef {
            artifact: self.artifact.clone(),
            passed: match (self.passed, self.failed) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            },
            exit_code: self.exit_code,
            tests_passed: self.tests_passed,
            tests_failed: self.tests_failed,
            coverage_percent: self.coverage,
        }
    }
}

/// Hook input: a full envelope, or just the action.
#[derive(Deserialize)]
#[serde(untagged)]
enum HookInput {
    Envelope(ActionEnvelope),
    Action(Action),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let hook_mode = matches!(cli.command, Command::Hook { .. });
    init_tracing(if hook_mode { "error" } else { "info" });

    let config = match EngineConfig::load(&cli.project) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return if hook_mode { ExitCode::from(EXIT_DENY) } else { ExitCode::FAILURE };
        }
    };

    match run(config, cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(default: &str) {
    let filter = EnvFilter::try_from_env("TOLLGATE_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn builder(config: EngineConfig) -> ControllerBuilder {
    SessionController::builder(config).with_event_handler(LoggingHandler)
}

/// Resume the persisted session; most commands need one.
fn resume(config: EngineConfig) -> Result<SessionController, EngineError> {
    builder(config)
        .resume()?
        .ok_or_else(|| EngineError::Config("no session; run `tollgate start` first".into()))
}

fn run(config: EngineConfig, command: Command) -> Result<ExitCode, EngineError> {
    match command {
        Command::Start { session_id, role } => {
            let builder = builder(config);
            let builder = match session_id {
                Some(id) => builder.with_session_id(id),
                None => builder,
            };
            let controller = builder.start()?;
            let id = &controller.session().id;
            if let Some(role) = role {
                controller.store().save_identity(&ActorIdentity::new(role, id.clone()))?;
            }
            println!("{id}");
        }
        Command::Status => match builder(config).resume()? {
            Some(controller) => print_status(&controller),
            None => println!("no session"),
        },
        Command::Features { add } => {
            let mut controller = resume(config)?;
            if !add.is_empty() {
                controller.plan_features(&add)?;
            }
            for feature in controller.features()?.unwrap_or_default().iter() {
                match &feature.blocked_reason {
                    Some(reason) => println!("{}\t{}\t{reason}", feature.id, feature.status),
                    None => println!(
                        "{}\t{}\t{} file(s)",
                        feature.id,
                        feature.status,
                        feature.files_touched.len()
                    ),
                }
            }
        }
        Command::Transition {
            state,
            feature,
            tests_written,
        } => {
            let mut controller = resume(config)?;
            let mut context = TransitionContext::new();
            if let Some(feature) = feature {
                context.insert("feature_id".into(), feature.into());
            }
            if !tests_written.is_empty() {
                context.insert("tests_written".into(), tests_written.into());
            }
            let committed = controller.propose_transition(state, context)?;
            if let Some(blocked) = &committed.blocked {
                eprintln!("blocked '{}': {}", blocked.feature_id, blocked.reason);
            }
            println!(
                "{} -> {} (feature: {}, attempt {})",
                committed.from,
                committed.to,
                committed.feature_id.as_deref().unwrap_or("-"),
                committed.attempt
            );
        }
        Command::Evidence(args) => {
            let controller = resume(config)?;
            let feature = match (&args.feature, args.kind) {
                (Some(id), _) => Some(id.clone()),
                (None, EvidenceKind::HealthCheck) => None,
                (None, _) => controller.session().active_feature_id.clone(),
            };
            let evidence = Evidence::new(args.kind, args.source.clone(), args.payload());
            let path = controller.record_evidence(feature.as_deref(), &evidence)?;
            println!("{}", path.display());
        }
        Command::MarkTested { feature } => {
            let mut controller = resume(config)?;
            controller.mark_feature_tested(&feature)?;
            println!("{feature}: tested");
        }
        Command::Usage {
            ratio,
            memory_file,
            max_tokens,
        } => {
            let mut controller = resume(config)?;
            let ratio = match (ratio, memory_file) {
                (Some(ratio), _) => ratio,
                (None, Some(path)) => {
                    let memory = std::fs::read_to_string(&path).map_err(|source| StoreError::Read { path, source })?;
                    let usage = UsageMeter::new().with_max_tokens(max_tokens).estimate(&memory);
                    eprintln!("{}", usage.to_log_string());
                    usage.ratio
                }
                (None, None) => return Err(EngineError::Config("usage needs a ratio or --memory-file".into())),
            };
            if let Some(action) = controller.report_usage(ratio)? {
                println!("{}", serde_json::to_string(&action).map_err(StoreError::from)?);
            }
        }
        Command::End => {
            let mut controller = resume(config)?;
            controller.end()?;
        }
        Command::Schema => {
            let schema = tollgate::action_schema();
            println!("{}", serde_json::to_string_pretty(&schema).map_err(StoreError::from)?);
        }
        Command::Hook { point } => return Ok(run_hook(config, point)),
    }
    Ok(ExitCode::SUCCESS)
}

fn print_status(controller: &SessionController) {
    let session = controller.session();
    println!("session   {}", session.id);
    println!("state     {}", session.current_state);
    println!(
        "feature   {}",
        session.active_feature_id.as_deref().unwrap_or("-")
    );
    println!("attempt   {}/{}", session.attempt_count, controller.config().max_attempts);
    if !session.context.files_changed.is_empty() {
        println!("changed   {}", session.context.files_changed.join(", "));
    }
    let compression = controller.compression_state();
    println!(
        "context   {:.0}% (level: {})",
        compression.usage_ratio * 100.0,
        compression
            .last_level_applied
            .map_or("none".to_string(), |l| l.to_string())
    );
    if session.current_state.is_terminal() {
        println!("complete");
    }
}

// ── Hook mode ──────────────────────────────────────────────────────

/// Any failure in hook mode denies: an unreadable action or a broken
/// store must not let the action through.
fn run_hook(config: EngineConfig, point: LifecyclePoint) -> ExitCode {
    match evaluate_hook(config, point) {
        Ok(None) => ExitCode::SUCCESS,
        Ok(Some(verdict)) => match verdict {
            HookVerdict::Deny { reason } => {
                eprintln!("{reason}");
                ExitCode::from(EXIT_DENY)
            }
            verdict => match serde_json::to_string(&verdict) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::from(EXIT_DENY)
                }
            },
        },
        Err(EngineError::Denied(denial)) => {
            eprintln!("{}", denial.reason);
            ExitCode::from(EXIT_DENY)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(EXIT_DENY)
        }
    }
}

/// `None` for a plain allow, otherwise the decision to report.
fn evaluate_hook(config: EngineConfig, point: LifecyclePoint) -> Result<Option<HookVerdict>, EngineError> {
    if point == LifecyclePoint::SessionStart {
        builder(config).start()?;
        return Ok(None);
    }

    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| EngineError::Config(format!("failed to read action from stdin: {e}")))?;
    let mut controller = builder(config).open()?;
    let action = match serde_json::from_str::<HookInput>(&input) {
        Ok(HookInput::Envelope(envelope)) => envelope.action,
        Ok(HookInput::Action(action)) => action,
        Err(_) if point == LifecyclePoint::AgentStop || point == LifecyclePoint::SessionEnd => {
            Action::Stop { actor: None }
        }
        Err(e) => return Err(EngineError::Config(format!("invalid action descriptor: {e}"))),
    };

    match point {
        LifecyclePoint::SessionEnd => {
            controller.end()?;
            Ok(None)
        }
        LifecyclePoint::AgentStop => {
            let actor = match action {
                Action::Stop { actor } => actor,
                _ => None,
            };
            match controller.request_stop(actor)? {
                StopOutcome::Stopped => Ok(None),
                StopOutcome::MustContinue(denial) => Ok(Some(HookVerdict::deny(denial.reason))),
            }
        }
        _ => match controller.evaluate(point, action.clone())? {
            PipelineResult::Allowed(allowed) if allowed == action => Ok(None),
            PipelineResult::Allowed(modified) => Ok(Some(HookVerdict::modify(modified))),
            PipelineResult::Denied(denial) => Ok(Some(HookVerdict::deny(denial.reason))),
        },
    }
}
