//! Session data model: lifecycle states, the session aggregate, and feature
//! records.
//!
//! - [`machine`]: the [`StateMachine`](machine::StateMachine) that owns the
//!   only write path for [`Session`] and [`FeatureList`].
//! - [`gate`]: the deterministic [`QualityGate`](gate::QualityGate) that
//!   guards each transition.
//!
//! The types here serialize directly to the state file and feature list
//! file formats, so the on-disk shape and the in-memory shape never drift.

pub mod gate;
pub mod machine;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use gate::{GateFailure, GateVerdict, QualityGate};
pub use machine::{BlockedFeature, CommittedState, StateMachine};

// ── Lifecycle ──────────────────────────────────────────────────────

/// The fixed lifecycle a session moves through.
///
/// `START` is the only initial state and `COMPLETE` the only terminal one.
#[derive(
    Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Start,
    Init,
    Implement,
    Test,
    Complete,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 5] = [
        LifecycleState::Start,
        LifecycleState::Init,
        LifecycleState::Implement,
        LifecycleState::Test,
        LifecycleState::Complete,
    ];

    /// The static adjacency set for this state.
    pub fn successors(self) -> &'static [LifecycleState] {
        use LifecycleState::{Complete, Implement, Init, Start, Test};
        match self {
            Start => &[Init, Implement],
            Init => &[Implement],
            Implement => &[Test],
            Test => &[Implement, Complete],
            Complete => &[],
        }
    }

    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        self.successors().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Start => "START",
            LifecycleState::Init => "INIT",
            LifecycleState::Implement => "IMPLEMENT",
            LifecycleState::Test => "TEST",
            LifecycleState::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!("unknown lifecycle state '{s}' (expected START, INIT, IMPLEMENT, TEST or COMPLETE)")
            })
    }
}

// ── Session ────────────────────────────────────────────────────────

/// One entry of the append-only transition history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub state: LifecycleState,
    #[serde(rename = "at")]
    pub entered_at: DateTime<Utc>,
}

/// Work tracked for the attempt in progress.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub tests_written: Vec<String>,
}

/// The root aggregate, serialized as the state file.
///
/// Invariant: the last `history` entry's state equals `current_state`.
/// Only [`StateMachine`] mutates a live session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    #[serde(rename = "session_id")]
    pub id: String,
    #[serde(rename = "state")]
    pub current_state: LifecycleState,
    #[serde(rename = "feature_id", default)]
    pub active_feature_id: Option<String>,
    pub entered_at: DateTime<Utc>,
    #[serde(rename = "attempts")]
    pub attempt_count: u32,
    #[serde(default)]
    pub context: SessionContext,
    pub history: Vec<HistoryEntry>,
    /// Consecutive gate failures on the active feature.
    #[serde(default)]
    pub gate_failures: u32,
}

impl Session {
    /// A fresh session sitting in `START`.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            current_state: LifecycleState::Start,
            active_feature_id: None,
            entered_at: now,
            attempt_count: 1,
            context: SessionContext::default(),
            history: vec![HistoryEntry {
                state: LifecycleState::Start,
                entered_at: now,
            }],
            gate_failures: 0,
        }
    }

    /// Generate a session id from the current time.
    pub fn generate_id(now: DateTime<Utc>) -> String {
        format!("s-{}", now.format("%Y%m%dT%H%M%S%3f"))
    }

    /// Whether the history invariant holds.
    pub fn is_consistent(&self) -> bool {
        self.history
            .last()
            .is_some_and(|last| last.state == self.current_state)
            && self.attempt_count >= 1
    }

    pub(crate) fn enter(&mut self, state: LifecycleState, at: DateTime<Utc>) {
        self.current_state = state;
        self.entered_at = at;
        self.history.push(HistoryEntry {
            state,
            entered_at: at,
        });
    }
}

// ── Features ───────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    Coding,
    Testing,
    Tested,
    Blocked,
}

impl FeatureStatus {
    /// Coding and testing features hold the session's single writer slot.
    pub fn is_active(self) -> bool {
        matches!(self, FeatureStatus::Coding | FeatureStatus::Testing)
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeatureStatus::Pending => "pending",
            FeatureStatus::Coding => "coding",
            FeatureStatus::Testing => "testing",
            FeatureStatus::Tested => "tested",
            FeatureStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// A unit of work. `id` is a stable semantic identifier such as
/// `"auth-login-form"`, never a random UUID.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FeatureRecord {
    pub id: String,
    pub status: FeatureStatus,
    #[serde(default)]
    pub files_touched: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl FeatureRecord {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: FeatureStatus::Pending,
            files_touched: BTreeSet::new(),
            blocked_reason: None,
        }
    }
}

/// Ordered list of features, serialized as a bare JSON array.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct FeatureList(Vec<FeatureRecord>);

impl FeatureList {
    pub fn new(features: Vec<FeatureRecord>) -> Self {
        Self(features)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureRecord> {
        self.0.iter()
    }

    pub fn get(&self, id: &str) -> Option<&FeatureRecord> {
        self.0.iter().find(|f| f.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut FeatureRecord> {
        self.0.iter_mut().find(|f| f.id == id)
    }

    pub fn push(&mut self, feature: FeatureRecord) {
        self.0.push(feature);
    }

    pub fn has_pending(&self) -> bool {
        self.0.iter().any(|f| f.status == FeatureStatus::Pending)
    }

    /// First pending feature in list order, optionally skipping one id.
    pub fn next_pending(&self, except: Option<&str>) -> Option<&FeatureRecord> {
        self.0
            .iter()
            .find(|f| f.status == FeatureStatus::Pending && Some(f.id.as_str()) != except)
    }

    /// Features currently holding the writer slot.
    pub fn active(&self) -> impl Iterator<Item = &FeatureRecord> {
        self.0.iter().filter(|f| f.status.is_active())
    }

    pub fn all_tested(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|f| f.status == FeatureStatus::Tested)
    }

    pub fn into_inner(self) -> Vec<FeatureRecord> {
        self.0
    }
}

// ── Transition requests ────────────────────────────────────────────

/// Opaque key/value bag a transition carries for the gate and hooks.
pub type TransitionContext = BTreeMap<String, serde_json::Value>;

/// Ephemeral request to move the session. Never persisted unless committed.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub from_state: LifecycleState,
    pub to_state: LifecycleState,
    pub requested_at: DateTime<Utc>,
    pub context: TransitionContext,
}

impl TransitionRequest {
    /// Feature the caller wants bound on entry to `IMPLEMENT`.
    pub fn feature_id(&self) -> Option<&str> {
        self.context.get("feature_id").and_then(|v| v.as_str())
    }

    /// Test files the caller reports having written.
    pub fn tests_written(&self) -> Vec<String> {
        self.context
            .get("tests_written")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}
