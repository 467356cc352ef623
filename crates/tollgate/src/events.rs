//! Engine events and the handlers that observe them.
//!
//! The [`SessionController`](crate::controller::SessionController) reports
//! everything it commits or rejects as an [`EngineEvent`]. Handlers are
//! observers only: policy belongs in hooks, so nothing a handler does can
//! change an outcome.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests, or when the `tracing` output of the engine is enough |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures (counters, UI updates) |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use std::path::Path;

use tracing::{debug, info, warn};

use crate::context::CompressionAction;
use crate::hooks::Denial;
use crate::session::LifecycleState;
use crate::store::EvidenceKind;

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum EngineEvent<'a> {
    SessionStarted {
        session_id: &'a str,
        /// `false` for a fresh session, `true` when loaded from disk.
        resumed: bool,
    },
    TransitionCommitted {
        from: LifecycleState,
        to: LifecycleState,
        attempt: u32,
        feature_id: Option<&'a str>,
    },
    /// Invalid edge or unsatisfied gate. `reason` is the error message.
    TransitionRejected {
        from: LifecycleState,
        to: LifecycleState,
        reason: &'a str,
    },
    FeatureBlocked {
        feature_id: &'a str,
        reason: &'a str,
        next: Option<&'a str>,
    },
    FeatureTested { feature_id: &'a str },
    EvidenceRecorded {
        kind: EvidenceKind,
        feature_id: Option<&'a str>,
        path: &'a Path,
    },
    /// A hook denied an action, at any lifecycle point.
    ActionDenied(&'a Denial),
    CompressionTriggered {
        action: &'a CompressionAction,
        usage_ratio: f64,
    },
    CheckpointSaved { path: &'a Path },
    SessionEnded {
        session_id: &'a str,
        state: LifecycleState,
    },
}

/// Observer of engine events.
///
/// # Example
///
/// ```ignore
/// struct Blocked(AtomicUsize);
///
/// impl EventHandler for Blocked {
///     fn on_event(&self, event: &EngineEvent<'_>) {
///         if let EngineEvent::FeatureBlocked { .. } = event {
///             self.0.fetch_add(1, Ordering::SeqCst);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &EngineEvent<'_>) {
        let _ = event;
    }
}

pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&EngineEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&EngineEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&EngineEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner handler, in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(verbose, FnEventHandler::new(|e| eprintln!("{e:?}")));
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler without breaking the builder chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &EngineEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &EngineEvent<'_>) {
        match event {
            EngineEvent::SessionStarted { session_id, resumed } => {
                if *resumed {
                    info!("Resumed session {session_id}");
                } else {
                    info!("Session {session_id} started");
                }
            }
            EngineEvent::TransitionCommitted {
                from,
                to,
                attempt,
                feature_id,
            } => {
                info!(
                    "{from} -> {to} (feature: {}, attempt {attempt})",
                    feature_id.unwrap_or("-")
                );
            }
            EngineEvent::TransitionRejected { from, to, reason } => {
                warn!("Rejected {from} -> {to}: {reason}");
            }
            EngineEvent::FeatureBlocked {
                feature_id,
                reason,
                next,
            } => {
                warn!(
                    "Feature '{feature_id}' blocked ({reason}); next: {}",
                    next.unwrap_or("none")
                );
            }
            EngineEvent::FeatureTested { feature_id } => {
                info!("Feature '{feature_id}' tested");
            }
            EngineEvent::EvidenceRecorded { kind, path, .. } => {
                debug!("Recorded {kind} evidence at {}", path.display());
            }
            EngineEvent::ActionDenied(denial) => {
                warn!("{denial}");
            }
            EngineEvent::CompressionTriggered { action, usage_ratio } => {
                info!(
                    "Compression {} at {:.0}% usage",
                    action.level(),
                    usage_ratio * 100.0
                );
            }
            EngineEvent::CheckpointSaved { path } => {
                info!("Checkpoint saved: {}", path.display());
            }
            EngineEvent::SessionEnded { session_id, state } => {
                info!("Session {session_id} ended in {state}");
            }
        }
    }
}
