//! Policy interceptors and the registry that orders them.
//!
//! Every externally visible action (a file write, a command, a transition
//! request, a stop signal) is wrapped in an [`ActionEnvelope`] and passed
//! through the hooks registered for one [`LifecyclePoint`]. Each hook returns
//! a [`HookVerdict`]: allow, deny with a reason, or modify the action for
//! the hooks after it.
//!
//! - [`pipeline`]: [`EnforcementPipeline`](pipeline::EnforcementPipeline)
//!   evaluates hooks in registration order, short-circuits on deny, and
//!   fails closed on hook errors and panics.
//! - [`external`]: [`CommandHook`](external::CommandHook) runs any program
//!   as a hook using the exit-code convention, and [`HookConfig`](external::HookConfig)
//!   loads the hooks file.
//! - [`builtin`]: config-driven predicate hooks and built-in policies.
//! - [`identity`]: actor identity records for role-scoped hooks.
//!
//! # Example
//!
//! ```ignore
//! let registry = HookRegistry::new()
//!     .with(LifecyclePoint::PreAction, FnHook::new("no-secrets", |env| {
//!         match &env.action {
//!             Action::WriteFile { path, .. } if path.ends_with(".env") => {
//!                 HookVerdict::deny("refusing to write .env files")
//!             }
//!             _ => HookVerdict::Allow,
//!         }
//!     }));
//! ```

pub mod builtin;
pub mod external;
pub mod identity;
pub mod pipeline;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::HookError;
use crate::session::{LifecycleState, TransitionContext};

pub use pipeline::{Denial, DenialKind, EnforcementPipeline, PipelineResult};

// ── Lifecycle points ───────────────────────────────────────────────

/// Where in the session lifecycle a hook runs.
#[derive(
    Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum LifecyclePoint {
    PreAction,
    PostAction,
    SessionStart,
    SessionEnd,
    /// A deny here keeps the session running instead of blocking a side effect.
    AgentStop,
}

impl LifecyclePoint {
    pub const ALL: [LifecyclePoint; 5] = [
        LifecyclePoint::PreAction,
        LifecyclePoint::PostAction,
        LifecyclePoint::SessionStart,
        LifecyclePoint::SessionEnd,
        LifecyclePoint::AgentStop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecyclePoint::PreAction => "PreAction",
            LifecyclePoint::PostAction => "PostAction",
            LifecyclePoint::SessionStart => "SessionStart",
            LifecyclePoint::SessionEnd => "SessionEnd",
            LifecyclePoint::AgentStop => "AgentStop",
        }
    }
}

impl fmt::Display for LifecyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecyclePoint {
    type Err = String;

    /// Accepts `PreAction`, `pre-action` and `pre_action` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        LifecyclePoint::ALL
            .into_iter()
            .find(|p| p.as_str().to_ascii_lowercase() == wanted)
            .ok_or_else(|| format!("unknown lifecycle point '{s}'"))
    }
}

// ── Actions ────────────────────────────────────────────────────────

/// An externally visible operation, as hooks see it.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    WriteFile {
        path: String,
        #[serde(default)]
        content: String,
    },
    RunCommand {
        command: String,
    },
    Transition {
        to: LifecycleState,
        #[serde(default)]
        context: TransitionContext,
    },
    MarkTested {
        feature_id: String,
    },
    Stop {
        #[serde(default)]
        actor: Option<String>,
    },
    Session {
        session_id: String,
    },
}

impl Action {
    /// Name used by hook matchers.
    pub fn name(&self) -> &'static str {
        match self {
            Action::WriteFile { .. } => "write_file",
            Action::RunCommand { .. } => "run_command",
            Action::Transition { .. } => "transition",
            Action::MarkTested { .. } => "mark_tested",
            Action::Stop { .. } => "stop",
            Action::Session { .. } => "session",
        }
    }

    /// Target path for file actions.
    pub fn path(&self) -> Option<&str> {
        match self {
            Action::WriteFile { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// The action descriptor handed to every hook, and written as JSON to the
/// standard input of external hooks.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct ActionEnvelope {
    pub point: LifecyclePoint,
    pub session_id: String,
    pub state: LifecycleState,
    #[serde(default)]
    pub feature_id: Option<String>,
    pub action: Action,
}

// ── Verdicts ───────────────────────────────────────────────────────

/// What a hook decided about an action. Serialized as the structured
/// decision object external hooks may print.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HookVerdict {
    Allow,
    Deny { reason: String },
    /// Replace the action for later hooks and the executor.
    Modify { action: Action },
}

impl HookVerdict {
    pub fn deny(reason: impl Into<String>) -> Self {
        HookVerdict::Deny {
            reason: reason.into(),
        }
    }

    pub fn modify(action: Action) -> Self {
        HookVerdict::Modify { action }
    }
}

/// A verdict attributed to the hook and point that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct HookDecision {
    pub point: LifecyclePoint,
    pub hook: String,
    pub verdict: HookVerdict,
}

// ── Hook trait ─────────────────────────────────────────────────────

/// A registered interceptor.
///
/// Hooks run synchronously in registration order. Returning `Err` or
/// panicking is treated as a denial (`hook_internal_error`).
pub trait Hook: Send + Sync {
    /// Stable name reported when this hook denies.
    fn name(&self) -> &str;

    fn evaluate(&self, envelope: &ActionEnvelope) -> Result<HookVerdict, HookError>;
}

/// A hook backed by a closure.
pub struct FnHook<F>
where
    F: Fn(&ActionEnvelope) -> HookVerdict + Send + Sync,
{
    name: String,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(&ActionEnvelope) -> HookVerdict + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Hook for FnHook<F>
where
    F: Fn(&ActionEnvelope) -> HookVerdict + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, envelope: &ActionEnvelope) -> Result<HookVerdict, HookError> {
        Ok((self.f)(envelope))
    }
}

// ── Matchers ───────────────────────────────────────────────────────

/// Which actions a hook applies to: `|`-separated action names, or all
/// actions when empty or `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionMatcher {
    names: Vec<String>,
}

impl ActionMatcher {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn parse(pattern: &str) -> Self {
        let names = pattern
            .split('|')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty() && s != "*")
            .collect();
        Self { names }
    }

    pub fn from_option(pattern: Option<&str>) -> Self {
        pattern.map(Self::parse).unwrap_or_default()
    }

    pub fn matches(&self, action: &Action) -> bool {
        self.names.is_empty() || self.names.iter().any(|n| n == action.name())
    }
}

// ── Registry ───────────────────────────────────────────────────────

struct RegisteredHook {
    matcher: ActionMatcher,
    hook: Box<dyn Hook>,
}

/// Ordered hooks per lifecycle point.
#[derive(Default)]
pub struct HookRegistry {
    hooks: BTreeMap<LifecyclePoint, Vec<RegisteredHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook at `point`, matching the given actions.
    pub fn register(&mut self, point: LifecyclePoint, matcher: ActionMatcher, hook: impl Hook + 'static) {
        self.register_boxed(point, matcher, Box::new(hook));
    }

    pub fn register_boxed(&mut self, point: LifecyclePoint, matcher: ActionMatcher, hook: Box<dyn Hook>) {
        self.hooks
            .entry(point)
            .or_default()
            .push(RegisteredHook { matcher, hook });
    }

    /// Builder form of [`register`](Self::register) matching every action.
    pub fn with(mut self, point: LifecyclePoint, hook: impl Hook + 'static) -> Self {
        self.register(point, ActionMatcher::any(), hook);
        self
    }

    /// Builder form with an explicit matcher.
    pub fn with_matcher(mut self, point: LifecyclePoint, matcher: ActionMatcher, hook: impl Hook + 'static) -> Self {
        self.register(point, matcher, hook);
        self
    }

    /// Hooks at `point` whose matcher accepts `action`, in registration order.
    pub fn matching<'a>(&'a self, point: LifecyclePoint, action: &'a Action) -> impl Iterator<Item = &'a dyn Hook> + 'a {
        self.hooks
            .get(&point)
            .into_iter()
            .flatten()
            .filter(move |r| r.matcher.matches(action))
            .map(|r| r.hook.as_ref())
    }

    /// Every hook at `point` with its matcher, in registration order.
    pub(crate) fn entries(&self, point: LifecyclePoint) -> impl Iterator<Item = (&ActionMatcher, &dyn Hook)> {
        self.hooks
            .get(&point)
            .into_iter()
            .flatten()
            .map(|r| (&r.matcher, r.hook.as_ref()))
    }

    /// Names of all hooks registered at `point`.
    pub fn names(&self, point: LifecyclePoint) -> Vec<&str> {
        self.hooks
            .get(&point)
            .into_iter()
            .flatten()
            .map(|r| r.hook.name())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for point in self.hooks.keys() {
            map.entry(point, &self.names(*point));
        }
        map.finish()
    }
}
