//! The state machine core: the only writer of the session and feature list.
//!
//! Every mutation follows the same shape: clone the session, apply the
//! change to the clone, persist it (feature list first, then the state
//! file), and only then swap it in. A failed write leaves the in-memory
//! session untouched.
//!
//! # Retry policy
//!
//! `attempt_count` counts implement/test cycles on the active feature. It
//! is kept across `IMPLEMENT -> TEST`, incremented on a `TEST -> IMPLEMENT`
//! retry and reset to 1 on every other committed transition. A retry that
//! would push it past `max_attempts` blocks the feature instead and binds
//! the next pending one.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::gate::{GateFailure, GateVerdict, QualityGate};
use super::{
    FeatureList, FeatureRecord, FeatureStatus, LifecycleState, Session, SessionContext, TransitionContext,
    TransitionRequest,
};
use crate::error::{EngineError, StoreError, TransitionError};
use crate::store::{EvidenceKind, EvidenceScope, StateStore, validate_id};

/// A feature taken out of rotation, and what replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedFeature {
    pub feature_id: String,
    /// Stored verbatim as the feature's `blocked_reason`.
    pub reason: String,
    /// Feature bound in its place, if any remained pending.
    pub next: Option<String>,
}

/// Result of a committed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedState {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub attempt: u32,
    /// Active feature after the transition.
    pub feature_id: Option<String>,
    /// Set when the retry limit blocked the previous feature.
    pub blocked: Option<BlockedFeature>,
}

pub struct StateMachine {
    store: StateStore,
    gate: QualityGate,
    max_attempts: u32,
    session: Session,
}

impl StateMachine {
    /// Start a fresh session in `START` and persist it.
    pub fn start(store: StateStore, gate: QualityGate, max_attempts: u32, id: impl Into<String>) -> Result<Self, StoreError> {
        let session = Session::new(id, Utc::now());
        store.save_session(&session)?;
        info!("Started session {}", session.id);
        Ok(Self {
            store,
            gate,
            max_attempts: max_attempts.max(1),
            session,
        })
    }

    /// Resume the persisted session, if there is one.
    pub fn resume(store: StateStore, gate: QualityGate, max_attempts: u32) -> Result<Option<Self>, StoreError> {
        let Some(session) = store.load_session()? else {
            return Ok(None);
        };
        if !session.is_consistent() {
            warn!(
                "Session {} history does not end in {}; resuming anyway",
                session.id, session.current_state
            );
        }
        debug!("Resumed session {} in {}", session.id, session.current_state);
        Ok(Some(Self {
            store,
            gate,
            max_attempts: max_attempts.max(1),
            session,
        }))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The feature list as currently persisted. Reloaded on every call: the
    /// agent authors it during `INIT`.
    pub fn features(&self) -> Result<Option<FeatureList>, StoreError> {
        self.store.load_features()
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Move the session to `to`.
    ///
    /// Adjacency is checked before anything else. A gate failure commits
    /// nothing; see [`note_gate_failure`](Self::note_gate_failure) for the
    /// consecutive-failure policy.
    pub fn propose_transition(
        &mut self,
        to: LifecycleState,
        context: TransitionContext,
    ) -> Result<CommittedState, TransitionError> {
        let from = self.session.current_state;
        if !from.can_transition_to(to) {
            debug!("Rejected invalid transition {from} -> {to}");
            return Err(TransitionError::InvalidTransition { from, to });
        }
        let request = TransitionRequest {
            from_state: from,
            to_state: to,
            requested_at: Utc::now(),
            context,
        };

        let loaded = self.store.load_features()?;
        let active = self.session.active_feature_id.as_deref();
        if let GateVerdict::Unsatisfied(reason) = self.gate.verify(from, to, loaded.as_ref(), active) {
            warn!("Gate not satisfied for {from} -> {to}: {reason}");
            return Err(TransitionError::GateNotSatisfied { from, to, reason });
        }

        let mut session = self.session.clone();
        let mut features = loaded.clone().unwrap_or_default();
        let blocked = self.apply(&mut session, &mut features, &request);

        session.enter(to, request.requested_at);
        session.gate_failures = 0;
        let features_changed = match &loaded {
            Some(list) => list != &features,
            None => !features.is_empty(),
        };
        if features_changed {
            self.store.save_features(&features)?;
        }
        self.store.save_session(&session)?;

        let committed = CommittedState {
            from,
            to,
            attempt: session.attempt_count,
            feature_id: session.active_feature_id.clone(),
            blocked,
        };
        info!(
            "Transition {from} -> {to} committed (feature: {}, attempt {})",
            committed.feature_id.as_deref().unwrap_or("-"),
            committed.attempt
        );
        self.session = session;
        Ok(committed)
    }

    /// Apply the feature and attempt bookkeeping for a satisfied request.
    fn apply(
        &self,
        session: &mut Session,
        features: &mut FeatureList,
        request: &TransitionRequest,
    ) -> Option<BlockedFeature> {
        use LifecycleState::{Implement, Test};
        match (request.from_state, request.to_state) {
            (Implement, Test) => {
                if let Some(feature) = active_record(session, features)
                    && feature.status == FeatureStatus::Coding
                {
                    feature.status = FeatureStatus::Testing;
                }
                for test in request.tests_written() {
                    if !session.context.tests_written.contains(&test) {
                        session.context.tests_written.push(test);
                    }
                }
                None
            }
            (Test, Implement) => {
                let advancing = active_record(session, features).is_some_and(|f| f.status == FeatureStatus::Tested);
                if advancing {
                    session.active_feature_id = None;
                    bind_feature(session, features, request.feature_id());
                    session.attempt_count = 1;
                    None
                } else if session.attempt_count >= self.max_attempts {
                    let id = session.active_feature_id.clone().unwrap_or_default();
                    let reason = GateFailure::new(
                        "attempt_limit_exceeded",
                        format!("'{id}' still failing after {} attempts", session.attempt_count),
                    );
                    let blocked = block_and_rebind(session, features, &reason.to_string());
                    session.attempt_count = 1;
                    blocked
                } else {
                    session.attempt_count += 1;
                    if let Some(feature) = active_record(session, features) {
                        feature.status = FeatureStatus::Coding;
                    }
                    None
                }
            }
            (_, Implement) => {
                bind_feature(session, features, request.feature_id());
                session.attempt_count = 1;
                None
            }
            _ => {
                session.attempt_count = 1;
                None
            }
        }
    }

    // ── Feature operations ─────────────────────────────────────────

    /// Count a gate failure against the active feature while in
    /// `IMPLEMENT`. At `max_attempts` consecutive failures the feature is
    /// blocked with `failure` as its reason and the next pending feature is
    /// bound. No history entry is written.
    pub fn note_gate_failure(&mut self, failure: &GateFailure) -> Result<Option<BlockedFeature>, StoreError> {
        if self.session.current_state != LifecycleState::Implement || self.session.active_feature_id.is_none() {
            return Ok(None);
        }
        let mut session = self.session.clone();
        session.gate_failures += 1;
        if session.gate_failures < self.max_attempts {
            debug!(
                "Gate failure {}/{} on '{}'",
                session.gate_failures,
                self.max_attempts,
                session.active_feature_id.as_deref().unwrap_or_default()
            );
            self.store.save_session(&session)?;
            self.session = session;
            return Ok(None);
        }

        let mut features = self.store.load_features()?.unwrap_or_default();
        let blocked = block_and_rebind(&mut session, &mut features, &failure.to_string());
        session.gate_failures = 0;
        session.attempt_count = 1;
        self.store.save_features(&features)?;
        self.store.save_session(&session)?;
        self.session = session;
        Ok(blocked)
    }

    /// Record a file written for the active feature. A no-op without one.
    pub fn record_touched_file(&mut self, path: &str) -> Result<(), StoreError> {
        let Some(id) = self.session.active_feature_id.clone() else {
            debug!("No active feature; not recording {path}");
            return Ok(());
        };
        let mut features = self.store.load_features()?.unwrap_or_default();
        let Some(feature) = features.get_mut(&id) else {
            warn!("Active feature '{id}' missing from the feature list");
            return Ok(());
        };
        let mut session = self.session.clone();
        let new_for_feature = feature.files_touched.insert(path.to_string());
        let new_for_attempt = !session.context.files_changed.iter().any(|f| f == path);
        if new_for_attempt {
            session.context.files_changed.push(path.to_string());
        }
        if new_for_feature {
            self.store.save_features(&features)?;
        }
        if new_for_attempt {
            self.store.save_session(&session)?;
            self.session = session;
        }
        Ok(())
    }

    /// Mark `feature_id` tested. Requires its latest `test_log` evidence to
    /// have passed.
    pub fn mark_tested(&mut self, feature_id: &str) -> Result<(), EngineError> {
        let mut features = self.store.load_features()?.unwrap_or_default();
        let Some(feature) = features.get_mut(feature_id) else {
            return Err(EngineError::UnknownFeature(feature_id.to_string()));
        };
        if feature.status == FeatureStatus::Tested {
            return Ok(());
        }

        let evidence = self.gate.evidence();
        let scope = EvidenceScope::Feature(feature_id);
        let dir = evidence.kind_dir(scope, EvidenceKind::TestLog)?;
        let passed = evidence
            .latest(scope, EvidenceKind::TestLog)?
            .is_some_and(|ev| ev.is_pass());
        if !passed {
            return Err(EngineError::NotTestable {
                feature: feature_id.to_string(),
                reason: GateFailure::new(
                    "missing_test_evidence",
                    format!("cannot mark tested without evidence in {}", dir.display()),
                ),
            });
        }

        feature.status = FeatureStatus::Tested;
        feature.blocked_reason = None;
        self.store.save_features(&features)?;
        info!("Feature '{feature_id}' marked tested");
        Ok(())
    }

    /// Append new pending features. Existing ids are left alone. Returns the
    /// ids actually added.
    pub fn plan_features(&mut self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        let mut features = self.store.load_features()?.unwrap_or_default();
        let mut added = Vec::new();
        for id in ids {
            validate_id(id)?;
            if features.get(id).is_none() {
                features.push(FeatureRecord::pending(id.clone()));
                added.push(id.clone());
            }
        }
        if !added.is_empty() || !self.store.feature_list_path().exists() {
            self.store.save_features(&features)?;
        }
        Ok(added)
    }
}

// ── Binding helpers ────────────────────────────────────────────────

fn active_record<'a>(session: &Session, features: &'a mut FeatureList) -> Option<&'a mut FeatureRecord> {
    let id = session.active_feature_id.as_deref()?;
    features.get_mut(id)
}

/// Bind a feature on entry to `IMPLEMENT`: resume one already in flight,
/// else the preferred pending feature, else the first pending one.
fn bind_feature(session: &mut Session, features: &mut FeatureList, preferred: Option<&str>) {
    let resumed = features.active().next().map(|f| f.id.clone());
    let chosen = resumed.or_else(|| {
        preferred
            .and_then(|id| features.get(id))
            .filter(|f| f.status == FeatureStatus::Pending)
            .or_else(|| features.next_pending(None))
            .map(|f| f.id.clone())
    });

    if chosen != session.active_feature_id {
        session.context = SessionContext::default();
    }
    match &chosen {
        Some(id) => {
            if let Some(feature) = features.get_mut(id)
                && feature.status == FeatureStatus::Pending
            {
                feature.status = FeatureStatus::Coding;
            }
            debug!("Bound feature '{id}'");
        }
        None => debug!("No feature left to bind"),
    }
    session.active_feature_id = chosen;
}

fn block_active(session: &Session, features: &mut FeatureList, reason: &str) -> Option<BlockedFeature> {
    let id = session.active_feature_id.clone()?;
    if let Some(feature) = features.get_mut(&id) {
        feature.status = FeatureStatus::Blocked;
        feature.blocked_reason = Some(reason.to_string());
    }
    warn!("Feature '{id}' blocked: {reason}");
    Some(BlockedFeature {
        feature_id: id,
        reason: reason.to_string(),
        next: None,
    })
}

fn block_and_rebind(session: &mut Session, features: &mut FeatureList, reason: &str) -> Option<BlockedFeature> {
    let mut blocked = block_active(session, features, reason)?;
    session.active_feature_id = None;
    bind_feature(session, features, None);
    blocked.next = session.active_feature_id.clone();
    Some(blocked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Evidence, EvidenceStore, PayloadRef};
    use LifecycleState::*;
    use proptest::prelude::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        machine: StateMachine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("progress")).unwrap();
        let gate = QualityGate::new(EvidenceStore::new(dir.path().join("evidence")));
        let machine = StateMachine::start(store, gate, 3, "s-test").unwrap();
        Fixture { _dir: dir, machine }
    }

    fn go(machine: &mut StateMachine, to: LifecycleState) -> Result<CommittedState, TransitionError> {
        machine.propose_transition(to, TransitionContext::new())
    }

    fn test_log(machine: &StateMachine, feature: &str, passed: bool) {
        machine
            .gate()
            .evidence()
            .record(
                EvidenceScope::Feature(feature),
                &Evidence::new(EvidenceKind::TestLog, "cargo test", PayloadRef::passed(passed)),
            )
            .unwrap();
    }

    fn status(machine: &StateMachine, id: &str) -> FeatureStatus {
        machine.features().unwrap().unwrap().get(id).unwrap().status
    }

    /// START -> INIT -> IMPLEMENT with features `ids`.
    fn implementing(ids: &[&str]) -> Fixture {
        let mut f = fixture();
        go(&mut f.machine, Init).unwrap();
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        f.machine.plan_features(&ids).unwrap();
        go(&mut f.machine, Implement).unwrap();
        f
    }

    /// One failing IMPLEMENT -> TEST -> IMPLEMENT cycle on the active feature.
    fn fail_cycle(machine: &mut StateMachine) -> CommittedState {
        let id = machine.session().active_feature_id.clone().unwrap();
        machine.record_touched_file(&format!("src/{id}.rs")).unwrap();
        test_log(machine, &id, false);
        go(machine, Test).unwrap();
        go(machine, Implement).unwrap()
    }

    #[test]
    fn invalid_transition_is_rejected_before_the_gate() {
        let mut f = fixture();
        let err = go(&mut f.machine, Complete).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::InvalidTransition { from: Start, to: Complete }
        ));
        assert_eq!(f.machine.session().history.len(), 1);
        assert_eq!(f.machine.session().current_state, Start);
    }

    #[test]
    fn gate_failure_commits_nothing() {
        let mut f = fixture();
        go(&mut f.machine, Init).unwrap();
        assert!(!f.machine.store().feature_list_path().exists());
        let err = go(&mut f.machine, Implement).unwrap_err();
        assert_eq!(err.gate_failure().unwrap().code, "feature_list_missing");
        assert!(!f.machine.store().feature_list_path().exists());
        assert_eq!(f.machine.session().current_state, Init);
        assert_eq!(f.machine.session().history.len(), 2);

        let persisted = f.machine.store().load_session().unwrap().unwrap();
        assert_eq!(persisted.current_state, Init);
    }

    #[test]
    fn entering_implement_binds_first_pending_or_requested() {
        let f = implementing(&["a", "b"]);
        assert_eq!(f.machine.session().active_feature_id.as_deref(), Some("a"));
        assert_eq!(status(&f.machine, "a"), FeatureStatus::Coding);
        assert_eq!(status(&f.machine, "b"), FeatureStatus::Pending);

        let mut g = fixture();
        go(&mut g.machine, Init).unwrap();
        g.machine.plan_features(&["a".into(), "b".into()]).unwrap();
        let mut context = TransitionContext::new();
        context.insert("feature_id".into(), serde_json::json!("b"));
        let committed = g.machine.propose_transition(Implement, context).unwrap();
        assert_eq!(committed.feature_id.as_deref(), Some("b"));
    }

    #[test]
    fn retry_increments_attempts_and_limit_blocks() {
        let mut f = implementing(&["a", "b"]);
        assert_eq!(fail_cycle(&mut f.machine).attempt, 2);
        assert_eq!(fail_cycle(&mut f.machine).attempt, 3);

        let committed = fail_cycle(&mut f.machine);
        let blocked = committed.blocked.unwrap();
        assert_eq!(blocked.feature_id, "a");
        assert_eq!(blocked.next.as_deref(), Some("b"));
        assert!(blocked.reason.starts_with("attempt_limit_exceeded"));
        assert_eq!(committed.to, Implement);
        assert_eq!(committed.attempt, 1);
        assert_eq!(committed.feature_id.as_deref(), Some("b"));

        let features = f.machine.features().unwrap().unwrap();
        assert_eq!(features.get("a").unwrap().status, FeatureStatus::Blocked);
        assert_eq!(
            features.get("a").unwrap().blocked_reason.as_deref(),
            Some(blocked.reason.as_str())
        );
        assert_eq!(features.get("b").unwrap().status, FeatureStatus::Coding);
        assert!(f.machine.session().context.files_changed.is_empty());
    }

    #[test]
    fn blocking_last_feature_leaves_no_active_feature() {
        let mut f = implementing(&["a"]);
        fail_cycle(&mut f.machine);
        fail_cycle(&mut f.machine);
        let committed = fail_cycle(&mut f.machine);
        assert_eq!(committed.blocked.unwrap().next, None);
        assert_eq!(f.machine.session().active_feature_id, None);

        let err = go(&mut f.machine, Test).unwrap_err();
        assert_eq!(err.gate_failure().unwrap().code, "no_active_feature");
    }

    #[test]
    fn tested_feature_advances_without_counting_a_retry() {
        let mut f = implementing(&["a", "b"]);
        f.machine.record_touched_file("src/a.rs").unwrap();
        test_log(&f.machine, "a", true);
        go(&mut f.machine, Test).unwrap();
        f.machine.mark_tested("a").unwrap();

        let committed = go(&mut f.machine, Implement).unwrap();
        assert_eq!(committed.feature_id.as_deref(), Some("b"));
        assert_eq!(committed.attempt, 1);
        assert!(committed.blocked.is_none());
        assert_eq!(status(&f.machine, "a"), FeatureStatus::Tested);
    }

    #[test]
    fn consecutive_gate_failures_block_feature() {
        let mut f = implementing(&["a", "b"]);
        let failure = go(&mut f.machine, Test).unwrap_err().gate_failure().cloned().unwrap();
        assert_eq!(failure.code, "no_files_touched");

        assert_eq!(f.machine.note_gate_failure(&failure).unwrap(), None);
        assert_eq!(f.machine.note_gate_failure(&failure).unwrap(), None);
        let blocked = f.machine.note_gate_failure(&failure).unwrap().unwrap();
        assert_eq!(blocked.reason, failure.to_string());
        assert_eq!(blocked.next.as_deref(), Some("b"));

        assert_eq!(f.machine.session().current_state, Implement);
        assert_eq!(f.machine.session().gate_failures, 0);
        assert_eq!(
            f.machine.features().unwrap().unwrap().get("a").unwrap().blocked_reason,
            Some(failure.to_string())
        );
    }

    #[test]
    fn mark_tested_requires_passing_evidence() {
        let mut f = implementing(&["a"]);
        match f.machine.mark_tested("a").unwrap_err() {
            EngineError::NotTestable { feature, reason } => {
                assert_eq!(feature, "a");
                assert!(reason.detail.starts_with("cannot mark tested without evidence in "));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            f.machine.mark_tested("missing"),
            Err(EngineError::UnknownFeature(_))
        ));

        test_log(&f.machine, "a", true);
        f.machine.mark_tested("a").unwrap();
        assert_eq!(status(&f.machine, "a"), FeatureStatus::Tested);
    }

    #[test]
    fn touched_files_are_recorded_once() {
        let mut f = implementing(&["a"]);
        f.machine.record_touched_file("src/a.rs").unwrap();
        f.machine.record_touched_file("src/a.rs").unwrap();
        assert_eq!(f.machine.session().context.files_changed, vec!["src/a.rs".to_string()]);
        let features = f.machine.features().unwrap().unwrap();
        assert_eq!(features.get("a").unwrap().files_touched.len(), 1);
    }

    #[test]
    fn plan_features_skips_duplicates_and_rejects_bad_ids() {
        let mut f = fixture();
        let added = f.machine.plan_features(&["a".into(), "b".into()]).unwrap();
        assert_eq!(added.len(), 2);
        let added = f.machine.plan_features(&["b".into(), "c".into()]).unwrap();
        assert_eq!(added, vec!["c".to_string()]);
        assert!(matches!(
            f.machine.plan_features(&["../etc".into()]),
            Err(StoreError::InvalidId(_))
        ));
    }

    #[test]
    fn resume_reads_persisted_session() {
        let mut f = implementing(&["a"]);
        f.machine.record_touched_file("src/a.rs").unwrap();
        let store = f.machine.store().clone();
        let gate = f.machine.gate().clone();
        let resumed = StateMachine::resume(store, gate, 3).unwrap().unwrap();
        assert_eq!(resumed.session(), f.machine.session());
    }

    // ── Properties ─────────────────────────────────────────────────

    #[derive(Debug, Clone)]
    enum Op {
        Propose(LifecycleState),
        Touch,
        TestLog(bool),
        Health(bool),
        MarkTested,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => proptest::sample::select(LifecycleState::ALL.to_vec()).prop_map(Op::Propose),
            1 => Just(Op::Touch),
            2 => any::<bool>().prop_map(Op::TestLog),
            1 => any::<bool>().prop_map(Op::Health),
            1 => Just(Op::MarkTested),
        ]
    }

    fn run(machine: &mut StateMachine, op: &Op) {
        let active = machine.session().active_feature_id.clone();
        match op {
            Op::Propose(to) => {
                let before = machine.session().clone();
                let result = go(machine, *to);
                if !before.current_state.can_transition_to(*to) {
                    assert!(matches!(result, Err(TransitionError::InvalidTransition { .. })));
                }
                if result.is_err() {
                    assert_eq!(machine.session().current_state, before.current_state);
                    assert_eq!(machine.session().history, before.history);
                }
            }
            Op::Touch => {
                if let Some(id) = active {
                    machine.record_touched_file(&format!("src/{id}.rs")).unwrap();
                }
            }
            Op::TestLog(passed) => {
                if let Some(id) = active {
                    test_log(machine, &id, *passed);
                }
            }
            Op::Health(passed) => {
                machine
                    .gate()
                    .evidence()
                    .record(
                        EvidenceScope::Session,
                        &Evidence::new(EvidenceKind::HealthCheck, "curl", PayloadRef::passed(*passed)),
                    )
                    .unwrap();
            }
            Op::MarkTested => {
                if let Some(id) = active {
                    let _ = machine.mark_tested(&id);
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn history_tracks_state_and_single_writer_holds(ops in proptest::collection::vec(op(), 1..40)) {
            let mut f = fixture();
            f.machine.plan_features(&["a".into(), "b".into(), "c".into()]).unwrap();
            for op in &ops {
                run(&mut f.machine, op);
                let session = f.machine.session();
                prop_assert!(session.is_consistent());
                prop_assert!(session.attempt_count >= 1 && session.attempt_count <= 3);
                let features = f.machine.features().unwrap().unwrap();
                prop_assert!(features.active().count() <= 1);

                let persisted = f.machine.store().load_session().unwrap().unwrap();
                prop_assert_eq!(&persisted, session);
            }
        }

        #[test]
        fn invalid_transitions_are_no_ops(from_idx in 0usize..5, to_idx in 0usize..5) {
            let from = LifecycleState::ALL[from_idx];
            let to = LifecycleState::ALL[to_idx];
            prop_assume!(!from.can_transition_to(to));

            let mut f = fixture();
            let mut session = f.machine.session().clone();
            session.enter(from, Utc::now());
            f.machine.store().save_session(&session).unwrap();
            let store = f.machine.store().clone();
            let gate = f.machine.gate().clone();
            f.machine = StateMachine::resume(store, gate, 3).unwrap().unwrap();

            let err = go(&mut f.machine, to).unwrap_err();
            let is_invalid = matches!(err, TransitionError::InvalidTransition { .. });
            prop_assert!(is_invalid);
            prop_assert_eq!(f.machine.session(), &session);
            let persisted = f.machine.store().load_session().unwrap().unwrap();
            prop_assert_eq!(&persisted, &session);
        }
    }
}
