//! Ordered, short-circuiting, fail-closed hook dispatch.
//!
//! [`EnforcementPipeline::dispatch`] evaluates the hooks registered for one
//! lifecycle point in registration order. Each hook sees the action as
//! modified by the hooks before it. The first deny halts evaluation. A hook
//! that returns an error or panics denies with `hook_internal_error`, tagged
//! [`DenialKind::InternalError`] so operators can tell tooling breakage from
//! policy.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, warn};

use super::{Action, ActionEnvelope, HookDecision, HookRegistry, HookVerdict, LifecyclePoint};

/// Reason reported when a hook errors or panics.
pub const HOOK_INTERNAL_ERROR: &str = "hook_internal_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialKind {
    /// A hook denied on policy grounds.
    Policy,
    /// A hook crashed; treated as a deny.
    InternalError,
}

/// Which hook blocked an action, where, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub point: LifecyclePoint,
    pub hook: String,
    pub reason: String,
    pub kind: DenialKind,
}

impl Denial {
    pub fn is_internal(&self) -> bool {
        self.kind == DenialKind::InternalError
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "denied by hook '{}' at {}: {}", self.hook, self.point, self.reason)
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    /// Every matching hook allowed. Carries the possibly modified action.
    Allowed(Action),
    Denied(Denial),
}

impl PipelineResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PipelineResult::Allowed(_))
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            PipelineResult::Denied(d) => Some(d),
            PipelineResult::Allowed(_) => None,
        }
    }
}

/// Dispatches envelopes through a [`HookRegistry`].
#[derive(Debug, Default)]
pub struct EnforcementPipeline {
    registry: HookRegistry,
}

impl EnforcementPipeline {
    pub fn new(registry: HookRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Run `envelope.action` through the hooks at `envelope.point`.
    pub fn dispatch(&self, envelope: ActionEnvelope) -> PipelineResult {
        self.dispatch_traced(envelope).0
    }

    /// Like [`dispatch`](Self::dispatch), also returning every decision made
    /// in evaluation order.
    pub fn dispatch_traced(&self, mut envelope: ActionEnvelope) -> (PipelineResult, Vec<HookDecision>) {
        let point = envelope.point;
        let mut trail = Vec::new();
        // Matching is checked against the current action, so a modification
        // can bring later hooks in or out of scope.
        for (matcher, hook) in self.registry.entries(point) {
            if !matcher.matches(&envelope.action) {
                continue;
            }
            let name = hook.name().to_string();
            let verdict = match catch_unwind(AssertUnwindSafe(|| hook.evaluate(&envelope))) {
                Ok(Ok(verdict)) => verdict,
                Ok(Err(e)) => {
                    warn!("Hook '{name}' failed at {point}: {e}");
                    return Self::internal_denial(point, name, trail);
                }
                Err(_) => {
                    warn!("Hook '{name}' panicked at {point}");
                    return Self::internal_denial(point, name, trail);
                }
            };
            debug!("Hook '{name}' at {point}: {verdict:?}");
            trail.push(HookDecision {
                point,
                hook: name.clone(),
                verdict: verdict.clone(),
            });

            match verdict {
                HookVerdict::Allow => {}
                HookVerdict::Deny { reason } => {
                    warn!("Hook '{name}' denied {} at {point}: {reason}", envelope.action.name());
                    return (
                        PipelineResult::Denied(Denial {
                            point,
                            hook: name,
                            reason,
                            kind: DenialKind::Policy,
                        }),
                        trail,
                    );
                }
                HookVerdict::Modify { action } => {
                    debug!("Hook '{name}' modified {} at {point}", envelope.action.name());
                    envelope.action = action;
                }
            }
        }

        (PipelineResult::Allowed(envelope.action), trail)
    }

    fn internal_denial(point: LifecyclePoint, hook: String, mut trail: Vec<HookDecision>) -> (PipelineResult, Vec<HookDecision>) {
        trail.push(HookDecision {
            point,
            hook: hook.clone(),
            verdict: HookVerdict::deny(HOOK_INTERNAL_ERROR),
        });
        (
            PipelineResult::Denied(Denial {
                point,
                hook,
                reason: HOOK_INTERNAL_ERROR.to_string(),
                kind: DenialKind::InternalError,
            }),
            trail,
        )
    }
}
