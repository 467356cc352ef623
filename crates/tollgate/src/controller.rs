//! The session controller: the top-level loop around the engine.
//!
//! Every action goes through the same steps:
//!
//! ```text
//! action ─▶ PreAction hooks ─▶ execute ─▶ PostAction hooks ─▶ outcome
//!                │ deny          │
//!                ▼               ├─ write_file     → executor, touched file recorded
//!             Denied             ├─ run_command    → executor, evidence recorded
//!                                ├─ transition     → StateMachine::propose_transition
//!                                └─ mark_tested    → StateMachine::mark_tested
//! ```
//!
//! Stop signals go through `AgentStop` instead, where a deny keeps the agent
//! running. Usage reports drive the [`CompressionManager`], and a checkpoint
//! is saved before any compression action is handed out.
//!
//! The controller is `&mut self` throughout: one action is fully resolved
//! before the next begins. Hosts that poll usage from another thread wrap it
//! in a [`SharedController`].
//!
//! # Example
//!
//! ```ignore
//! let mut controller = SessionController::builder(EngineConfig::load(".")?)
//!     .with_event_handler(LoggingHandler)
//!     .open()?;
//!
//! let outcome = controller.handle(
//!     Action::WriteFile { path: "src/login.rs".into(), content },
//!     &mut executor,
//! )?;
//! if let Some(denial) = outcome.denial() {
//!     eprintln!("{denial}");
//! }
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::{
    Checkpoint, CompressionAction, CompressionManager, CompressionState, Compressor, UsageMeter,
};
use crate::error::{EngineError, TransitionError};
use crate::events::{CompositeEventHandler, EngineEvent, EventHandler};
use crate::hooks::external::HookConfig;
use crate::hooks::{
    Action, ActionEnvelope, ActionMatcher, Denial, EnforcementPipeline, Hook, LifecyclePoint, PipelineResult,
};
use crate::session::{
    BlockedFeature, CommittedState, FeatureList, LifecycleState, QualityGate, Session, StateMachine,
    TransitionContext,
};
use crate::store::{Evidence, EvidenceKind, EvidenceScope, EvidenceStore, StateStore};

// ── Executor ───────────────────────────────────────────────────────

/// What the executor reports back for a side-effecting action.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub output: String,
    /// Artifacts produced by the action, such as a test run's exit code.
    /// `health_check` evidence is recorded session-wide, everything else
    /// against the active feature.
    pub evidence: Vec<Evidence>,
}

impl Execution {
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }
}

/// Performs allowed `write_file`, `run_command` and `session` actions.
/// Transitions and mark-tested requests are performed by the engine.
pub trait ActionExecutor {
    fn execute(&mut self, action: &Action) -> Result<Execution, String>;
}

impl<F> ActionExecutor for F
where
    F: FnMut(&Action) -> Result<Execution, String>,
{
    fn execute(&mut self, action: &Action) -> Result<Execution, String> {
        self(action)
    }
}

// ── Outcomes ───────────────────────────────────────────────────────

/// The side effect an allowed action had.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Carries the action as executed, after any hook modification.
    Executed { action: Action, output: String },
    Transitioned(CommittedState),
    MarkedTested { feature_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Done(Effect),
    /// Blocked at `PreAction`; nothing was executed.
    Denied(Denial),
    /// Executed, then denied at `PostAction`. The effect cannot be undone;
    /// the caller is expected to take corrective action.
    PostDenied { effect: Effect, denial: Denial },
    Stop(StopOutcome),
}

impl ActionOutcome {
    pub fn effect(&self) -> Option<&Effect> {
        match self {
            ActionOutcome::Done(effect) | ActionOutcome::PostDenied { effect, .. } => Some(effect),
            _ => None,
        }
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            ActionOutcome::Denied(denial)
            | ActionOutcome::PostDenied { denial, .. }
            | ActionOutcome::Stop(StopOutcome::MustContinue(denial)) => Some(denial),
            _ => None,
        }
    }
}

/// Result of an agent-stop signal.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Stopped,
    /// An `AgentStop` hook denied: the agent has to keep working.
    MustContinue(Denial),
}

// ── Builder ────────────────────────────────────────────────────────

/// Assembles a [`SessionController`]: stores, hooks file, extra hooks and
/// event handlers.
pub struct ControllerBuilder {
    config: EngineConfig,
    session_id: Option<String>,
    hooks: Vec<(LifecyclePoint, ActionMatcher, Box<dyn Hook>)>,
    events: CompositeEventHandler,
}

struct Parts {
    config: EngineConfig,
    store: StateStore,
    evidence: EvidenceStore,
    pipeline: EnforcementPipeline,
    events: CompositeEventHandler,
}

impl ControllerBuilder {
    /// Use a fixed session id instead of a generated one.
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Register a hook after the built-ins and the hooks file.
    pub fn with_hook(self, point: LifecyclePoint, hook: impl Hook + 'static) -> Self {
        self.with_matched_hook(point, ActionMatcher::any(), hook)
    }

    pub fn with_matched_hook(mut self, point: LifecyclePoint, matcher: ActionMatcher, hook: impl Hook + 'static) -> Self {
        self.hooks.push((point, matcher, Box::new(hook)));
        self
    }

    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events = self.events.with(handler);
        self
    }

    fn parts(self) -> Result<Parts, EngineError> {
        let config = self.config;
        config.validate()?;
        let store = StateStore::open(config.progress_path())?;
        let evidence = EvidenceStore::new(config.evidence_path());
        let ctx = config.builtin_context(&store, &evidence);
        let mut registry = HookConfig::load(config.hooks_path())?.into_registry(&ctx)?;
        for (point, matcher, hook) in self.hooks {
            registry.register_boxed(point, matcher, hook);
        }
        debug!("Hook registry: {registry:?}");
        Ok(Parts {
            config,
            store,
            evidence,
            pipeline: EnforcementPipeline::new(registry),
            events: self.events,
        })
    }

    /// Start a fresh session in `START`. `SessionStart` hooks run before
    /// the session is persisted; a deny there starts nothing.
    /// Compression state is reset.
    pub fn start(self) -> Result<SessionController, EngineError> {
        let id = self
            .session_id
            .clone()
            .unwrap_or_else(|| Session::generate_id(Utc::now()));
        let parts = self.parts()?;

        let envelope = ActionEnvelope {
            point: LifecyclePoint::SessionStart,
            session_id: id.clone(),
            state: LifecycleState::Start,
            feature_id: None,
            action: Action::Session { session_id: id.clone() },
        };
        if let PipelineResult::Denied(denial) = parts.pipeline.dispatch(envelope) {
            parts.events.on_event(&EngineEvent::ActionDenied(&denial));
            return Err(EngineError::Denied(denial));
        }

        let compression = CompressionManager::new(&parts.config.compression);
        parts.store.save_compression(compression.state())?;
        let machine = StateMachine::start(
            parts.store,
            QualityGate::new(parts.evidence),
            parts.config.max_attempts,
            id,
        )?;
        let controller = SessionController::assemble(parts.config, machine, parts.pipeline, compression, parts.events);
        controller.emit(EngineEvent::SessionStarted {
            session_id: &controller.session().id,
            resumed: false,
        });
        Ok(controller)
    }

    /// Resume the persisted session, if any. `SessionStart` hooks do not run
    /// again.
    pub fn resume(self) -> Result<Option<SessionController>, EngineError> {
        let parts = self.parts()?;
        let compression_state = parts.store.load_compression()?.unwrap_or_default();
        let Some(machine) = StateMachine::resume(
            parts.store,
            QualityGate::new(parts.evidence),
            parts.config.max_attempts,
        )?
        else {
            return Ok(None);
        };
        let compression = CompressionManager::new(&parts.config.compression).with_state(compression_state);
        let controller = SessionController::assemble(parts.config, machine, parts.pipeline, compression, parts.events);
        controller.emit(EngineEvent::SessionStarted {
            session_id: &controller.session().id,
            resumed: true,
        });
        Ok(Some(controller))
    }

    /// Resume the persisted session, or start one when there is none.
    pub fn open(self) -> Result<SessionController, EngineError> {
        let store = StateStore::open(self.config.progress_path())?;
        if store.load_session()?.is_none() {
            return self.start();
        }
        self.resume()?
            .ok_or_else(|| EngineError::Config("session disappeared while opening".into()))
    }
}

// ── Controller ─────────────────────────────────────────────────────

pub struct SessionController {
    config: EngineConfig,
    machine: StateMachine,
    pipeline: EnforcementPipeline,
    compression: CompressionManager,
    events: CompositeEventHandler,
    ended: bool,
}

impl SessionController {
    pub fn builder(config: EngineConfig) -> ControllerBuilder {
        ControllerBuilder {
            config,
            session_id: None,
            hooks: Vec::new(),
            events: CompositeEventHandler::new(),
        }
    }

    fn assemble(
        config: EngineConfig,
        machine: StateMachine,
        pipeline: EnforcementPipeline,
        compression: CompressionManager,
        events: CompositeEventHandler,
    ) -> Self {
        Self {
            config,
            machine,
            pipeline,
            compression,
            events,
            ended: false,
        }
    }

    pub fn session(&self) -> &Session {
        self.machine.session()
    }

    pub fn features(&self) -> Result<Option<FeatureList>, EngineError> {
        Ok(self.machine.features()?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &EnforcementPipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &StateStore {
        self.machine.store()
    }

    pub fn evidence(&self) -> &EvidenceStore {
        self.machine.gate().evidence()
    }

    pub fn compression_state(&self) -> &CompressionState {
        self.compression.state()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn emit(&self, event: EngineEvent<'_>) {
        self.events.on_event(&event);
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        if self.ended {
            return Err(EngineError::SessionEnded(self.session().id.clone()));
        }
        Ok(())
    }

    fn envelope(&self, point: LifecyclePoint, action: Action) -> ActionEnvelope {
        let session = self.session();
        ActionEnvelope {
            point,
            session_id: session.id.clone(),
            state: session.current_state,
            feature_id: session.active_feature_id.clone(),
            action,
        }
    }

    fn dispatch(&self, point: LifecyclePoint, action: Action) -> PipelineResult {
        let result = self.pipeline.dispatch(self.envelope(point, action));
        if let PipelineResult::Denied(denial) = &result {
            self.emit(EngineEvent::ActionDenied(denial));
        }
        result
    }

    // ── Actions ────────────────────────────────────────────────────

    /// Run one action through the full pre-hook, execute, post-hook cycle.
    ///
    /// Hook denials are outcomes, not errors. Errors are reserved for gate
    /// failures, invalid transitions, store failures and executor failures.
    pub fn handle(&mut self, action: Action, executor: &mut dyn ActionExecutor) -> Result<ActionOutcome, EngineError> {
        self.ensure_active()?;
        if let Action::Stop { actor } = action {
            return Ok(ActionOutcome::Stop(self.request_stop(actor)?));
        }
        self.check_edge(&action)?;

        let action = match self.dispatch(LifecyclePoint::PreAction, action) {
            PipelineResult::Allowed(action) => action,
            PipelineResult::Denied(denial) => return Ok(ActionOutcome::Denied(denial)),
        };
        let effect = self.perform(action.clone(), executor)?;

        match self.dispatch(LifecyclePoint::PostAction, action) {
            PipelineResult::Allowed(_) => Ok(ActionOutcome::Done(effect)),
            PipelineResult::Denied(denial) => Ok(ActionOutcome::PostDenied { effect, denial }),
        }
    }

    /// Reject a transition to a non-adjacent state before any hook sees it.
    fn check_edge(&self, action: &Action) -> Result<(), EngineError> {
        let Action::Transition { to, .. } = action else {
            return Ok(());
        };
        let from = self.session().current_state;
        if from.can_transition_to(*to) {
            return Ok(());
        }
        let err = TransitionError::InvalidTransition { from, to: *to };
        let message = err.to_string();
        self.emit(EngineEvent::TransitionRejected {
            from,
            to: *to,
            reason: &message,
        });
        Err(err.into())
    }

    fn perform(&mut self, action: Action, executor: &mut dyn ActionExecutor) -> Result<Effect, EngineError> {
        match action {
            Action::Transition { to, context } => self.commit_transition(to, context).map(Effect::Transitioned),
            Action::MarkTested { feature_id } => {
                self.machine.mark_tested(&feature_id)?;
                self.emit(EngineEvent::FeatureTested {
                    feature_id: &feature_id,
                });
                Ok(Effect::MarkedTested { feature_id })
            }
            action => {
                let execution = executor.execute(&action).map_err(EngineError::Execution)?;
                if let Action::WriteFile { path, .. } = &action {
                    self.machine.record_touched_file(path)?;
                }
                for evidence in &execution.evidence {
                    let feature = match evidence.kind {
                        EvidenceKind::HealthCheck => None,
                        _ => self.session().active_feature_id.clone(),
                    };
                    self.record_evidence(feature.as_deref(), evidence)?;
                }
                Ok(Effect::Executed {
                    action,
                    output: execution.output,
                })
            }
        }
    }

    fn commit_transition(&mut self, to: LifecycleState, context: TransitionContext) -> Result<CommittedState, EngineError> {
        let from = self.session().current_state;
        match self.machine.propose_transition(to, context) {
            Ok(committed) => {
                if let Some(blocked) = &committed.blocked {
                    self.emit_blocked(blocked);
                }
                self.emit(EngineEvent::TransitionCommitted {
                    from,
                    to,
                    attempt: committed.attempt,
                    feature_id: committed.feature_id.as_deref(),
                });
                Ok(committed)
            }
            Err(err) => {
                let message = err.to_string();
                self.emit(EngineEvent::TransitionRejected {
                    from,
                    to,
                    reason: &message,
                });
                if let TransitionError::GateNotSatisfied { reason, .. } = &err
                    && from == LifecycleState::Implement
                    && let Some(blocked) = self.machine.note_gate_failure(reason)?
                {
                    self.emit_blocked(&blocked);
                }
                Err(err.into())
            }
        }
    }

    fn emit_blocked(&self, blocked: &BlockedFeature) {
        self.emit(EngineEvent::FeatureBlocked {
            feature_id: &blocked.feature_id,
            reason: &blocked.reason,
            next: blocked.next.as_deref(),
        });
    }

    /// Propose a lifecycle transition, with `PreAction`/`PostAction` hooks.
    ///
    /// A `GateNotSatisfied` from `IMPLEMENT` also counts against the active
    /// feature; at `max_attempts` consecutive failures the feature is
    /// blocked and the next one bound.
    ///
    /// A non-adjacent `to` is rejected before any hook runs. A `PostAction`
    /// deny is returned as [`EngineError::Denied`]; the transition itself
    /// stays committed.
    pub fn propose_transition(
        &mut self,
        to: LifecycleState,
        context: TransitionContext,
    ) -> Result<CommittedState, EngineError> {
        match self.handle(Action::Transition { to, context }, &mut engine_only)? {
            ActionOutcome::Done(Effect::Transitioned(committed)) => Ok(committed),
            ActionOutcome::Denied(denial) | ActionOutcome::PostDenied { denial, .. } => {
                Err(EngineError::Denied(denial))
            }
            other => Err(EngineError::Execution(format!("unexpected outcome {other:?}"))),
        }
    }

    /// Mark a feature tested. Requires passing `test_log` evidence.
    ///
    /// Like [`propose_transition`](Self::propose_transition), a `PostAction`
    /// deny is returned as an error after the feature was marked.
    pub fn mark_feature_tested(&mut self, feature_id: &str) -> Result<(), EngineError> {
        let action = Action::MarkTested {
            feature_id: feature_id.to_string(),
        };
        match self.handle(action, &mut engine_only)? {
            ActionOutcome::Done(_) => Ok(()),
            ActionOutcome::Denied(denial) | ActionOutcome::PostDenied { denial, .. } => {
                Err(EngineError::Denied(denial))
            }
            other => Err(EngineError::Execution(format!("unexpected outcome {other:?}"))),
        }
    }

    /// Agent-stop signal. A deny at `AgentStop` means the agent must keep
    /// working; it never ends the session.
    pub fn request_stop(&mut self, actor: Option<String>) -> Result<StopOutcome, EngineError> {
        self.ensure_active()?;
        match self.dispatch(LifecyclePoint::AgentStop, Action::Stop { actor }) {
            PipelineResult::Allowed(_) => Ok(StopOutcome::Stopped),
            PipelineResult::Denied(denial) => Ok(StopOutcome::MustContinue(denial)),
        }
    }

    /// Run `action` through the hooks at `point` only, as an out-of-process
    /// hook adapter would. An allowed `write_file` at `PostAction` is
    /// recorded as touched.
    pub fn evaluate(&mut self, point: LifecyclePoint, action: Action) -> Result<PipelineResult, EngineError> {
        self.ensure_active()?;
        self.check_edge(&action)?;
        let result = self.dispatch(point, action);
        if point == LifecyclePoint::PostAction
            && let PipelineResult::Allowed(Action::WriteFile { path, .. }) = &result
        {
            self.machine.record_touched_file(path)?;
        }
        Ok(result)
    }

    // ── Features and evidence ──────────────────────────────────────

    /// Add pending features to the feature list. Returns the ids added.
    pub fn plan_features(&mut self, ids: &[String]) -> Result<Vec<String>, EngineError> {
        self.ensure_active()?;
        let added = self.machine.plan_features(ids)?;
        if !added.is_empty() {
            info!("Planned {} feature(s): {}", added.len(), added.join(", "));
        }
        Ok(added)
    }

    /// Record evidence for `feature_id`, or session-wide when `None`.
    pub fn record_evidence(&self, feature_id: Option<&str>, evidence: &Evidence) -> Result<PathBuf, EngineError> {
        let path = self
            .evidence()
            .record(EvidenceScope::from_feature(feature_id), evidence)?;
        self.emit(EngineEvent::EvidenceRecorded {
            kind: evidence.kind,
            feature_id,
            path: &path,
        });
        Ok(path)
    }

    // ── Compression ────────────────────────────────────────────────

    /// Report the working-memory usage ratio. When a new compression level
    /// is reached, a checkpoint is saved first and the action returned.
    pub fn report_usage(&mut self, ratio: f64) -> Result<Option<CompressionAction>, EngineError> {
        self.ensure_active()?;
        let action = self.compression.observe(ratio);
        if let Some(action) = &action {
            let features = self.machine.features()?.unwrap_or_default();
            let usage = self.compression.state().usage_ratio;
            let checkpoint = Checkpoint::capture(self.session(), &features, usage, action.level());
            // Applied only once the checkpoint is on disk.
            let path = self.store().save_checkpoint(&checkpoint)?;
            self.compression.apply(action.level());
            self.compression.record_checkpoint(path.clone());
            self.emit(EngineEvent::CheckpointSaved { path: &path });
            self.emit(EngineEvent::CompressionTriggered {
                action,
                usage_ratio: usage,
            });
        }
        self.store().save_compression(self.compression.state())?;
        Ok(action)
    }

    /// Meter `memory`, report the usage and, when compression is due, hand
    /// the action to `compressor`. Returns the replacement memory, or
    /// `None` when nothing was due.
    pub fn compact(
        &mut self,
        memory: &str,
        meter: &UsageMeter,
        compressor: &dyn Compressor,
    ) -> Result<Option<String>, EngineError> {
        let usage = meter.estimate(memory);
        debug!("{}", usage.to_log_string());
        let Some(action) = self.report_usage(usage.ratio)? else {
            return Ok(None);
        };
        compressor
            .compress(&action, memory)
            .map(Some)
            .map_err(EngineError::Compression)
    }

    /// End the session. A deny at `SessionEnd` keeps it open.
    pub fn end(&mut self) -> Result<(), EngineError> {
        self.ensure_active()?;
        let action = Action::Session {
            session_id: self.session().id.clone(),
        };
        if let PipelineResult::Denied(denial) = self.dispatch(LifecyclePoint::SessionEnd, action) {
            return Err(EngineError::Denied(denial));
        }
        self.ended = true;
        let session = self.session();
        if session.current_state != LifecycleState::Complete {
            warn!("Session {} ended in {}", session.id, session.current_state);
        }
        self.emit(EngineEvent::SessionEnded {
            session_id: &session.id,
            state: session.current_state,
        });
        Ok(())
    }
}

/// Executor for actions the engine performs itself; never invoked.
fn engine_only(action: &Action) -> Result<Execution, String> {
    Err(format!("no executor for {}", action.name()))
}

// ── Shared access ──────────────────────────────────────────────────

/// A controller shared between the action loop and a usage poller.
///
/// Every call holds the lock for its whole duration, so a usage report
/// never interleaves with an in-flight action or transition.
#[derive(Clone)]
pub struct SharedController(Arc<Mutex<SessionController>>);

impl SharedController {
    pub fn new(controller: SessionController) -> Self {
        Self(Arc::new(Mutex::new(controller)))
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionController> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn handle(&self, action: Action, executor: &mut dyn ActionExecutor) -> Result<ActionOutcome, EngineError> {
        self.lock().handle(action, executor)
    }

    pub fn report_usage(&self, ratio: f64) -> Result<Option<CompressionAction>, EngineError> {
        self.lock().report_usage(ratio)
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().session().current_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CompressionLevel;
    use crate::hooks::identity::ActorIdentity;
    use crate::hooks::{FnHook, HookVerdict};
    use crate::session::FeatureStatus;
    use crate::store::PayloadRef;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(dir: &tempfile::TempDir) -> EngineConfig {
        EngineConfig::new(dir.path())
    }

    fn start(dir: &tempfile::TempDir) -> SessionController {
        SessionController::builder(config(dir))
            .with_session_id("s-test")
            .start()
            .unwrap()
    }

    fn implementing(dir: &tempfile::TempDir, ids: &[&str]) -> SessionController {
        let mut controller = start(dir);
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        controller.plan_features(&ids).unwrap();
        controller
            .propose_transition(LifecycleState::Implement, TransitionContext::new())
            .unwrap();
        controller
    }

    fn writer(_: &Action) -> Result<Execution, String> {
        Ok(Execution::output("written"))
    }

    fn write(path: &str) -> Action {
        Action::WriteFile {
            path: path.into(),
            content: String::new(),
        }
    }

    #[test]
    fn write_is_executed_and_recorded_as_touched() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = implementing(&dir, &["login"]);
        let outcome = controller.handle(write("src/login.rs"), &mut writer).unwrap();
        assert!(matches!(outcome, ActionOutcome::Done(Effect::Executed { .. })));

        let features = controller.features().unwrap().unwrap();
        assert!(features.get("login").unwrap().files_touched.contains("src/login.rs"));
        assert_eq!(controller.session().context.files_changed, vec!["src/login.rs".to_string()]);
    }

    #[test]
    fn pre_action_deny_skips_the_executor() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = SessionController::builder(config(&dir))
            .with_hook(
                LifecyclePoint::PreAction,
                FnHook::new("no-env-files", |env: &ActionEnvelope| match env.action.path() {
                    Some(p) if p.ends_with(".env") => HookVerdict::deny("refusing to write .env files"),
                    _ => HookVerdict::Allow,
                }),
            )
            .start()
            .unwrap();

        let calls = AtomicUsize::new(0);
        let mut counting = |_: &Action| -> Result<Execution, String> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Execution::default())
        };
        let outcome = controller.handle(write(".env"), &mut counting).unwrap();
        let denial = outcome.denial().unwrap();
        assert_eq!(denial.hook, "no-env-files");
        assert_eq!(denial.reason, "refusing to write .env files");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn post_action_deny_reports_the_effect() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = SessionController::builder(config(&dir))
            .with_hook(
                LifecyclePoint::PostAction,
                FnHook::new("lint", |_: &ActionEnvelope| HookVerdict::deny("lint failed")),
            )
            .start()
            .unwrap();
        let outcome = controller.handle(write("README.md"), &mut writer).unwrap();
        match outcome {
            ActionOutcome::PostDenied { effect, denial } => {
                assert!(matches!(effect, Effect::Executed { .. }));
                assert_eq!(denial.point, LifecyclePoint::PostAction);
            }
            other => panic!("expected PostDenied, got {other:?}"),
        }
    }

    #[test]
    fn modified_action_reaches_the_executor() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = SessionController::builder(config(&dir))
            .with_hook(
                LifecyclePoint::PreAction,
                FnHook::new("quiet", |env: &ActionEnvelope| match &env.action {
                    Action::RunCommand { command } if !command.ends_with(" -q") => {
                        HookVerdict::modify(Action::RunCommand {
                            command: format!("{command} -q"),
                        })
                    }
                    _ => HookVerdict::Allow,
                }),
            )
            .start()
            .unwrap();

        let mut seen = Vec::new();
        let mut recording = |action: &Action| -> Result<Execution, String> {
            seen.push(action.clone());
            Ok(Execution::default())
        };
        controller
            .handle(
                Action::RunCommand {
                    command: "cargo test".into(),
                },
                &mut recording,
            )
            .unwrap();
        assert_eq!(
            seen,
            vec![Action::RunCommand {
                command: "cargo test -q".into()
            }]
        );
    }

    #[test]
    fn executor_evidence_is_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = implementing(&dir, &["login"]);
        let mut runner = |_: &Action| -> Result<Execution, String> {
            Ok(Execution::output("ok")
                .with_evidence(Evidence::new(EvidenceKind::TestLog, "cargo test", PayloadRef::exit_code(0)))
                .with_evidence(Evidence::new(EvidenceKind::HealthCheck, "curl", PayloadRef::passed(true))))
        };
        controller
            .handle(
                Action::RunCommand {
                    command: "cargo test".into(),
                },
                &mut runner,
            )
            .unwrap();
        let evidence = controller.evidence();
        assert_eq!(evidence.count(EvidenceScope::Feature("login"), EvidenceKind::TestLog).unwrap(), 1);
        assert_eq!(evidence.count(EvidenceScope::Session, EvidenceKind::HealthCheck).unwrap(), 1);
    }

    #[test]
    fn session_start_deny_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let result = SessionController::builder(config(&dir))
            .with_hook(
                LifecyclePoint::SessionStart,
                FnHook::new("closed", |_: &ActionEnvelope| HookVerdict::deny("maintenance")),
            )
            .start();
        assert!(matches!(result, Err(EngineError::Denied(_))));
        let store = StateStore::open(config(&dir).progress_path()).unwrap();
        assert!(store.load_session().unwrap().is_none());
    }

    #[test]
    fn start_resets_compression_and_resume_keeps_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = start(&dir);
        assert_eq!(controller.report_usage(0.72).unwrap(), Some(CompressionAction::PreCompress));
        drop(controller);

        let resumed = SessionController::builder(config(&dir)).resume().unwrap().unwrap();
        assert_eq!(
            resumed.compression_state().last_level_applied,
            Some(CompressionLevel::PreCompress)
        );
        drop(resumed);

        let fresh = start(&dir);
        assert_eq!(fresh.compression_state(), &CompressionState::default());
    }

    #[test]
    fn checkpoint_is_saved_before_compression() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = implementing(&dir, &["login"]);
        let meter = UsageMeter::new().with_max_tokens(100);
        let progress = controller.store().clone();
        let compressor = move |action: &CompressionAction, _memory: &str| -> Result<String, String> {
            let checkpoint = progress
                .load_latest_checkpoint()
                .map_err(|e| e.to_string())?
                .ok_or("no checkpoint")?;
            assert_eq!(checkpoint.level, action.level());
            Ok(checkpoint.summary())
        };

        assert_eq!(controller.compact("tiny", &meter, &compressor).unwrap(), None);
        let memory = "x".repeat(400);
        let replaced = controller.compact(&memory, &meter, &compressor).unwrap().unwrap();
        assert!(replaced.contains("feature: login"));

        let state = controller.compression_state();
        assert_eq!(state.last_level_applied, Some(CompressionLevel::Emergency));
        assert!(state.checkpoint_ref.is_some());
        assert_eq!(controller.store().load_compression().unwrap().as_ref(), Some(state));
    }

    #[test]
    fn compressor_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = start(&dir);
        let failing = |_: &CompressionAction, _: &str| -> Result<String, String> { Err("model offline".into()) };
        let err = controller
            .compact(&"x".repeat(300), &UsageMeter::new().with_max_tokens(100), &failing)
            .unwrap_err();
        assert!(matches!(err, EngineError::Compression(ref m) if m == "model offline"));
        assert!(controller.compression_state().checkpoint_ref.is_some());
    }

    #[test]
    fn repeated_gate_failures_block_and_rebind() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = Arc::new(AtomicUsize::new(0));
        let b = blocked.clone();
        let mut controller = SessionController::builder(config(&dir))
            .with_event_handler(crate::events::FnEventHandler::new(move |event| {
                if let EngineEvent::FeatureBlocked { .. } = event {
                    b.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .start()
            .unwrap();
        controller.plan_features(&["login".into(), "logout".into()]).unwrap();
        controller
            .propose_transition(LifecycleState::Implement, TransitionContext::new())
            .unwrap();

        for _ in 0..3 {
            let err = controller
                .propose_transition(LifecycleState::Test, TransitionContext::new())
                .unwrap_err();
            assert_eq!(err.gate_failure().map(|g| g.code.as_str()), Some("no_files_touched"));
        }
        assert_eq!(blocked.load(Ordering::SeqCst), 1);
        assert_eq!(controller.session().current_state, LifecycleState::Implement);
        assert_eq!(controller.session().active_feature_id.as_deref(), Some("logout"));
        let features = controller.features().unwrap().unwrap();
        let login = features.get("login").unwrap();
        assert_eq!(login.status, FeatureStatus::Blocked);
        assert!(login.blocked_reason.as_deref().unwrap().starts_with("no_files_touched: "));
    }

    #[test]
    fn tester_may_not_stop_without_passing_tests() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = implementing(&dir, &["login"]);
        controller
            .store()
            .save_identity(&ActorIdentity::new("tester", "s-test"))
            .unwrap();

        match controller.request_stop(None).unwrap() {
            StopOutcome::MustContinue(denial) => assert_eq!(denial.hook, "tester_stop_guard"),
            StopOutcome::Stopped => panic!("tester stopped without evidence"),
        }

        controller
            .record_evidence(
                Some("login"),
                &Evidence::new(EvidenceKind::TestLog, "cargo test", PayloadRef::passed(true)),
            )
            .unwrap();
        let outcome = controller.handle(Action::Stop { actor: None }, &mut writer).unwrap();
        assert_eq!(outcome, ActionOutcome::Stop(StopOutcome::Stopped));
    }

    #[test]
    fn ended_session_rejects_actions() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = start(&dir);
        controller.end().unwrap();
        assert!(controller.is_ended());
        assert!(matches!(
            controller.handle(write("a.txt"), &mut writer),
            Err(EngineError::SessionEnded(_))
        ));
        assert!(matches!(controller.end(), Err(EngineError::SessionEnded(_))));
    }

    #[test]
    fn session_end_deny_keeps_session_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = SessionController::builder(config(&dir))
            .with_hook(
                LifecyclePoint::SessionEnd,
                FnHook::new("unfinished", |env: &ActionEnvelope| {
                    if env.state == LifecycleState::Complete {
                        HookVerdict::Allow
                    } else {
                        HookVerdict::deny("session is not complete")
                    }
                }),
            )
            .start()
            .unwrap();
        assert!(matches!(controller.end(), Err(EngineError::Denied(_))));
        assert!(!controller.is_ended());
    }

    #[test]
    fn hook_adapter_records_post_action_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = implementing(&dir, &["login"]);
        let result = controller
            .evaluate(LifecyclePoint::PostAction, write("src/login.rs"))
            .unwrap();
        assert!(result.is_allowed());
        assert_eq!(controller.session().context.files_changed.len(), 1);
    }

    #[test]
    fn shared_controller_serializes_access() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedController::new(implementing(&dir, &["login"]));
        let poller = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                for ratio in [0.3, 0.55, 0.6] {
                    shared.report_usage(ratio).unwrap();
                }
            })
        };
        for i in 0..5 {
            shared.handle(write(&format!("src/f{i}.rs")), &mut writer).unwrap();
        }
        poller.join().unwrap();

        let controller = shared.lock();
        assert_eq!(controller.session().context.files_changed.len(), 5);
        assert_eq!(
            controller.compression_state().last_level_applied,
            Some(CompressionLevel::Checkpoint)
        );
        assert!(controller.session().is_consistent());
    }

    #[test]
    fn invalid_edge_is_rejected_before_any_hook() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut controller = SessionController::builder(config(&dir))
            .with_hook(
                LifecyclePoint::PreAction,
                FnHook::new("deny-all", move |_: &ActionEnvelope| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    HookVerdict::deny("nope")
                }),
            )
            .start()
            .unwrap();
        let before = controller.session().clone();

        let err = controller
            .propose_transition(LifecycleState::Complete, TransitionContext::new())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Transition(TransitionError::InvalidTransition {
                from: LifecycleState::Start,
                to: LifecycleState::Complete,
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(controller.session(), &before);

        // Adjacent edges still go through the hooks.
        let err = controller
            .propose_transition(LifecycleState::Init, TransitionContext::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Denied(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_checkpoint_write_keeps_the_level_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = start(&dir);
        let checkpoints = controller.store().checkpoints_dir();
        std::fs::write(&checkpoints, "not a directory").unwrap();

        assert!(controller.report_usage(0.55).is_err());
        assert_eq!(controller.compression_state().last_level_applied, None);

        std::fs::remove_file(&checkpoints).unwrap();
        assert_eq!(
            controller.report_usage(0.55).unwrap(),
            Some(CompressionAction::Checkpoint)
        );
        let state = controller.compression_state();
        assert_eq!(state.last_level_applied, Some(CompressionLevel::Checkpoint));
        assert_eq!(state.checkpoint_history.len(), 1);
    }

    #[test]
    fn post_action_deny_on_mark_tested_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = SessionController::builder(config(&dir))
            .with_matched_hook(
                LifecyclePoint::PostAction,
                ActionMatcher::parse("mark_tested"),
                FnHook::new("review-required", |_: &ActionEnvelope| HookVerdict::deny("needs review")),
            )
            .start()
            .unwrap();
        controller.plan_features(&["a".into()]).unwrap();
        controller
            .propose_transition(LifecycleState::Implement, TransitionContext::new())
            .unwrap();
        let passing = Evidence::new(EvidenceKind::TestLog, "cargo test", PayloadRef::passed(true));
        controller.record_evidence(Some("a"), &passing).unwrap();

        let EngineError::Denied(denial) = controller.mark_feature_tested("a").unwrap_err() else {
            panic!("expected a denial");
        };
        assert_eq!(denial.hook, "review-required");
        assert_eq!(denial.point, LifecyclePoint::PostAction);

        let features = controller.features().unwrap().unwrap();
        assert_eq!(features.get("a").unwrap().status, FeatureStatus::Tested);
    }
}
