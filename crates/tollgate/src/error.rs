//! Error taxonomy for the engine.
//!
//! Every rejected outcome carries the same reason vocabulary end to end:
//! a [`GateFailure`] or [`Denial`] produced deep in the engine is rendered
//! verbatim in error messages, log lines, and blocked-feature records.

use std::path::PathBuf;

use thiserror::Error;

use crate::hooks::pipeline::Denial;
use crate::session::LifecycleState;
use crate::session::gate::GateFailure;

/// Failures reading or writing the on-disk state and evidence stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Evidence is immutable once written.
    #[error("evidence already exists at {}", .0.display())]
    EvidenceExists(PathBuf),

    /// Identifiers become path components and must not escape their directory.
    #[error("invalid identifier '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidId(String),
}

/// Reasons a proposed lifecycle transition was not committed.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The requested edge is not in the adjacency table. Never retried.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// The exit condition of the current state is not met yet.
    #[error("gate not satisfied for {from} -> {to}: {reason}")]
    GateNotSatisfied {
        from: LifecycleState,
        to: LifecycleState,
        reason: GateFailure,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransitionError {
    /// The gate failure, if this error came from the quality gate.
    pub fn gate_failure(&self) -> Option<&GateFailure> {
        match self {
            TransitionError::GateNotSatisfied { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Failures of a single hook evaluation. The pipeline turns every one of
/// these into a `hook_internal_error` denial.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to spawn hook command '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("hook command '{command}' I/O failed: {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },

    #[error("hook returned an invalid decision: {0}")]
    InvalidDecision(String),

    #[error("hook failed: {0}")]
    Other(String),
}

/// Top-level error returned by the [`SessionController`](crate::controller::SessionController).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// A hook denied the action. Recoverable: the denial names the hook.
    #[error("{0}")]
    Denied(Denial),

    #[error("unknown feature '{0}'")]
    UnknownFeature(String),

    #[error("cannot mark '{feature}' tested: {reason}")]
    NotTestable { feature: String, reason: GateFailure },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The external compressor failed. The checkpoint written before the
    /// call is still authoritative.
    #[error("compression failed: {0}")]
    Compression(String),

    #[error("action executor failed: {0}")]
    Execution(String),

    /// The engine was used after [`end`](crate::controller::SessionController::end).
    #[error("session '{0}' has ended")]
    SessionEnded(String),
}

impl EngineError {
    /// The gate failure behind this error, if any.
    pub fn gate_failure(&self) -> Option<&GateFailure> {
        match self {
            EngineError::Transition(t) => t.gate_failure(),
            EngineError::NotTestable { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
