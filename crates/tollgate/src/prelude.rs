//! Convenience re-exports for embedding the engine.
//!
//! ```ignore
//! use tollgate::prelude::*;
//! ```
//!
//! Store internals, the built-in hook types and the compression manager
//! itself are left out; import those from their modules when needed.

// ── Engine ──────────────────────────────────────────────────────────
pub use crate::config::{CompressionConfig, EngineConfig};
pub use crate::controller::{
    ActionExecutor, ActionOutcome, ControllerBuilder, Effect, Execution, SessionController, SharedController,
    StopOutcome,
};
pub use crate::error::{EngineError, HookError, StoreError, TransitionError};

// ── Session ─────────────────────────────────────────────────────────
pub use crate::session::{
    CommittedState, FeatureList, FeatureRecord, FeatureStatus, GateFailure, LifecycleState, Session,
    TransitionContext,
};
pub use crate::store::{Evidence, EvidenceKind, PayloadRef};

// ── Hooks ───────────────────────────────────────────────────────────
pub use crate::hooks::{
    Action, ActionEnvelope, ActionMatcher, Denial, FnHook, Hook, HookVerdict, LifecyclePoint,
};

// ── Context and events ──────────────────────────────────────────────
pub use crate::context::{CompressionAction, CompressionLevel, Compressor, UsageMeter};
pub use crate::events::{
    CompositeEventHandler, EngineEvent, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
};
