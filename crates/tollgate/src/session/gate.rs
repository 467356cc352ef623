//! Deterministic exit conditions for each lifecycle transition.
//!
//! Predicates read only structured evidence fields ([`Evidence::is_pass`],
//! [`Evidence::is_fail`]) and the feature list. A missing or unreadable
//! evidence directory is always unsatisfied.

use std::fmt;

use tracing::debug;

use super::{FeatureList, FeatureRecord, FeatureStatus, LifecycleState};
use crate::store::{Evidence, EvidenceKind, EvidenceScope, EvidenceStore};

/// Machine-readable reason a gate was not satisfied.
///
/// `code` is a stable identifier (`no_files_touched`, `tests_not_failing`,
/// ...). `Display` renders `"<code>: <detail>"`, which is reused verbatim in
/// errors, logs and blocked-feature records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateFailure {
    pub code: String,
    pub detail: String,
}

impl GateFailure {
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Satisfied,
    Unsatisfied(GateFailure),
}

impl GateVerdict {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, GateVerdict::Satisfied)
    }

    fn fail(code: &str, detail: impl Into<String>) -> Self {
        GateVerdict::Unsatisfied(GateFailure::new(code, detail))
    }
}

/// Evaluates transition predicates against an [`EvidenceStore`].
#[derive(Debug, Clone)]
pub struct QualityGate {
    evidence: EvidenceStore,
}

impl QualityGate {
    pub fn new(evidence: EvidenceStore) -> Self {
        Self { evidence }
    }

    pub fn evidence(&self) -> &EvidenceStore {
        &self.evidence
    }

    /// Check the exit condition for `from -> to`.
    ///
    /// `features` is `None` when no feature list has been written yet;
    /// `active` is the session's bound feature.
    pub fn verify(
        &self,
        from: LifecycleState,
        to: LifecycleState,
        features: Option<&FeatureList>,
        active: Option<&str>,
    ) -> GateVerdict {
        use LifecycleState::{Complete, Implement, Init, Start, Test};
        let verdict = match (from, to) {
            (Start, Init) => GateVerdict::Satisfied,
            (Start | Init, Implement) => Self::has_pending(features),
            (Implement, Test) => self.build_checked(features, active),
            (Test, Implement) => self.retry_or_advance(features, active),
            (Test, Complete) => self.all_verified(features),
            _ => GateVerdict::fail("invalid_transition", format!("no gate for {from} -> {to}")),
        };
        debug!("Gate {from} -> {to}: {verdict:?}");
        verdict
    }

    // ── Predicates ─────────────────────────────────────────────────

    fn has_pending(features: Option<&FeatureList>) -> GateVerdict {
        let Some(features) = features else {
            return GateVerdict::fail("feature_list_missing", "no feature list has been written");
        };
        if features.has_pending() || features.active().next().is_some() {
            GateVerdict::Satisfied
        } else {
            GateVerdict::fail("no_pending_features", "feature list has no pending items")
        }
    }

    fn build_checked(&self, features: Option<&FeatureList>, active: Option<&str>) -> GateVerdict {
        let feature = match Self::active_feature(features, active) {
            Ok(f) => f,
            Err(v) => return v,
        };
        if let Some(features) = features
            && let Some(other) = features.active().find(|f| f.id != feature.id)
        {
            return GateVerdict::fail(
                "another_feature_active",
                format!("feature '{}' is already {}", other.id, other.status),
            );
        }
        if feature.files_touched.is_empty() {
            return GateVerdict::fail(
                "no_files_touched",
                format!("feature '{}' has no touched files", feature.id),
            );
        }
        let scope = EvidenceScope::Feature(&feature.id);
        let mut recorded = 0;
        for kind in [EvidenceKind::BuildCheck, EvidenceKind::TestLog] {
            match self.evidence.count(scope, kind) {
                Ok(n) => recorded += n,
                Err(e) => return GateVerdict::fail("evidence_unreadable", e.to_string()),
            }
        }
        if recorded == 0 {
            return GateVerdict::fail(
                "missing_build_evidence",
                format!("no build_check or test_log evidence for '{}'", feature.id),
            );
        }
        GateVerdict::Satisfied
    }

    fn retry_or_advance(&self, features: Option<&FeatureList>, active: Option<&str>) -> GateVerdict {
        let feature = match Self::active_feature(features, active) {
            Ok(f) => f,
            Err(v) => return v,
        };
        if feature.status == FeatureStatus::Tested {
            return match features.and_then(|f| f.next_pending(Some(&feature.id))) {
                Some(_) => GateVerdict::Satisfied,
                None => GateVerdict::fail(
                    "no_pending_features",
                    format!("'{}' is tested and no feature is pending", feature.id),
                ),
            };
        }
        match self.latest(EvidenceScope::Feature(&feature.id), EvidenceKind::TestLog) {
            Err(v) => v,
            Ok(None) => GateVerdict::fail(
                "missing_test_evidence",
                format!("no test_log evidence for '{}'", feature.id),
            ),
            Ok(Some(ev)) if ev.is_fail() => GateVerdict::Satisfied,
            Ok(Some(_)) => GateVerdict::fail(
                "tests_not_failing",
                format!("latest test_log for '{}' did not fail", feature.id),
            ),
        }
    }

    fn all_verified(&self, features: Option<&FeatureList>) -> GateVerdict {
        let Some(features) = features else {
            return GateVerdict::fail("feature_list_missing", "no feature list has been written");
        };
        if !features.all_tested() {
            let open: Vec<String> = features
                .iter()
                .filter(|f| f.status != FeatureStatus::Tested)
                .map(|f| format!("{} ({})", f.id, f.status))
                .collect();
            let detail = if open.is_empty() {
                "feature list is empty".to_string()
            } else {
                format!("not tested: {}", open.join(", "))
            };
            return GateVerdict::fail("features_not_tested", detail);
        }
        match self.latest(EvidenceScope::Session, EvidenceKind::HealthCheck) {
            Err(v) => v,
            Ok(None) => GateVerdict::fail("missing_health_evidence", "no health_check evidence recorded"),
            Ok(Some(ev)) if ev.is_pass() => GateVerdict::Satisfied,
            Ok(Some(_)) => GateVerdict::fail("health_check_failed", "latest health_check did not pass"),
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn active_feature<'a>(
        features: Option<&'a FeatureList>,
        active: Option<&str>,
    ) -> Result<&'a FeatureRecord, GateVerdict> {
        let Some(id) = active else {
            return Err(GateVerdict::fail("no_active_feature", "session has no active feature"));
        };
        features.and_then(|f| f.get(id)).ok_or_else(|| {
            GateVerdict::fail("no_active_feature", format!("active feature '{id}' is not in the feature list"))
        })
    }

    fn latest(&self, scope: EvidenceScope<'_>, kind: EvidenceKind) -> Result<Option<Evidence>, GateVerdict> {
        self.evidence
            .latest(scope, kind)
            .map_err(|e| GateVerdict::fail("evidence_unreadable", e.to_string()))
    }
}
