//! Threshold-driven compression level selection.
//!
//! [`CompressionManager::report_usage`] maps a usage ratio onto six
//! ascending thresholds and returns an action only when usage enters a
//! bucket above the last one applied. Re-reporting the same bucket is a
//! no-op, a jump over several buckets applies only the highest, and a drop
//! in usage never lowers the level. The summarization itself is external
//! (see [`Compressor`](super::checkpoint::Compressor)).

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CompressionConfig;

/// Compression levels in ascending order of aggressiveness.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    Checkpoint,
    PreCompress,
    RemoveRaw,
    Summarize,
    Full,
    Emergency,
}

impl CompressionLevel {
    pub const ALL: [CompressionLevel; 6] = [
        CompressionLevel::Checkpoint,
        CompressionLevel::PreCompress,
        CompressionLevel::RemoveRaw,
        CompressionLevel::Summarize,
        CompressionLevel::Full,
        CompressionLevel::Emergency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CompressionLevel::Checkpoint => "checkpoint",
            CompressionLevel::PreCompress => "pre_compress",
            CompressionLevel::RemoveRaw => "remove_raw",
            CompressionLevel::Summarize => "summarize",
            CompressionLevel::Full => "full",
            CompressionLevel::Emergency => "emergency",
        }
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque instruction handed to the external compressor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CompressionAction {
    Checkpoint,
    PreCompress,
    RemoveRawOutputs,
    SummarizeHistory { keep_recent: usize },
    FullCompress { target_tokens: usize },
    EmergencyTrim,
}

impl CompressionAction {
    pub fn level(&self) -> CompressionLevel {
        match self {
            CompressionAction::Checkpoint => CompressionLevel::Checkpoint,
            CompressionAction::PreCompress => CompressionLevel::PreCompress,
            CompressionAction::RemoveRawOutputs => CompressionLevel::RemoveRaw,
            CompressionAction::SummarizeHistory { .. } => CompressionLevel::Summarize,
            CompressionAction::FullCompress { .. } => CompressionLevel::Full,
            CompressionAction::EmergencyTrim => CompressionLevel::Emergency,
        }
    }
}

/// Persisted compression progress for one session.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CompressionState {
    /// Latest reported usage, clamped to `[0, 1]`.
    pub usage_ratio: f64,
    pub last_level_applied: Option<CompressionLevel>,
    /// Authoritative checkpoint for resume.
    #[serde(default)]
    pub checkpoint_ref: Option<PathBuf>,
    /// Every checkpoint written this session, oldest first.
    #[serde(default)]
    pub checkpoint_history: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CompressionManager {
    thresholds: Vec<f64>,
    keep_recent: usize,
    target_tokens: usize,
    state: CompressionState,
}

impl CompressionManager {
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            thresholds: config.thresholds.clone(),
            keep_recent: config.keep_recent,
            target_tokens: config.target_tokens,
            state: CompressionState::default(),
        }
    }

    /// Continue from persisted state.
    pub fn with_state(mut self, state: CompressionState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &CompressionState {
        &self.state
    }

    /// Highest level whose threshold `ratio` has reached.
    pub fn level_for(&self, ratio: f64) -> Option<CompressionLevel> {
        CompressionLevel::ALL
            .into_iter()
            .zip(&self.thresholds)
            .filter(|(_, threshold)| ratio >= **threshold)
            .map(|(level, _)| level)
            .last()
    }

    pub fn action_for(&self, level: CompressionLevel) -> CompressionAction {
        match level {
            CompressionLevel::Checkpoint => CompressionAction::Checkpoint,
            CompressionLevel::PreCompress => CompressionAction::PreCompress,
            CompressionLevel::RemoveRaw => CompressionAction::RemoveRawOutputs,
            CompressionLevel::Summarize => CompressionAction::SummarizeHistory {
                keep_recent: self.keep_recent,
            },
            CompressionLevel::Full => CompressionAction::FullCompress {
                target_tokens: self.target_tokens,
            },
            CompressionLevel::Emergency => CompressionAction::EmergencyTrim,
        }
    }

    /// Record a usage report. Returns the action to apply when usage has
    /// entered a higher bucket than the last one applied.
    pub fn report_usage(&mut self, ratio: f64) -> Option<CompressionAction> {
        let action = self.observe(ratio)?;
        self.apply(action.level());
        Some(action)
    }

    /// Record the usage ratio and return the action a new bucket calls for,
    /// without marking its level applied. Pair with [`apply`](Self::apply)
    /// once the action's checkpoint is safely written.
    pub fn observe(&mut self, ratio: f64) -> Option<CompressionAction> {
        if ratio.is_nan() {
            debug!("Ignoring NaN usage report");
            return None;
        }
        let ratio = ratio.clamp(0.0, 1.0);
        self.state.usage_ratio = ratio;

        let level = self.level_for(ratio)?;
        if self.state.last_level_applied.is_some_and(|last| level <= last) {
            return None;
        }
        Some(self.action_for(level))
    }

    /// Mark `level` applied. Levels never go down.
    pub fn apply(&mut self, level: CompressionLevel) {
        if self.state.last_level_applied.is_some_and(|last| level <= last) {
            return;
        }
        info!("Context usage {:.0}% crossed into {level}", self.state.usage_ratio * 100.0);
        self.state.last_level_applied = Some(level);
    }

    /// Make `path` the authoritative checkpoint.
    pub fn record_checkpoint(&mut self, path: PathBuf) {
        self.state.checkpoint_history.push(path.clone());
        self.state.checkpoint_ref = Some(path);
    }

    /// Forget all progress (fresh session).
    pub fn reset(&mut self) {
        self.state = CompressionState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manager() -> CompressionManager {
        CompressionManager::new(&CompressionConfig::default())
    }

    fn levels(reports: &[f64]) -> Vec<CompressionLevel> {
        let mut manager = manager();
        reports
            .iter()
            .filter_map(|r| manager.report_usage(*r))
            .map(|a| a.level())
            .collect()
    }

    #[test]
    fn crossing_sequence_triggers_once_per_bucket() {
        assert_eq!(
            levels(&[0.10, 0.55, 0.55, 0.72, 0.96]),
            vec![
                CompressionLevel::Checkpoint,
                CompressionLevel::PreCompress,
                CompressionLevel::Emergency
            ]
        );
    }

    #[test]
    fn thresholds_are_inclusive() {
        let m = manager();
        assert_eq!(m.level_for(0.4999), None);
        assert_eq!(m.level_for(0.50), Some(CompressionLevel::Checkpoint));
        assert_eq!(m.level_for(0.80), Some(CompressionLevel::RemoveRaw));
        assert_eq!(m.level_for(0.85), Some(CompressionLevel::Summarize));
        assert_eq!(m.level_for(0.90), Some(CompressionLevel::Full));
        assert_eq!(m.level_for(1.0), Some(CompressionLevel::Emergency));
    }

    #[test]
    fn downgrade_never_lowers_level() {
        let mut m = manager();
        assert!(m.report_usage(0.86).is_some());
        assert_eq!(m.report_usage(0.20), None);
        assert_eq!(m.state().usage_ratio, 0.20);
        assert_eq!(m.state().last_level_applied, Some(CompressionLevel::Summarize));
        assert_eq!(m.report_usage(0.72), None);
        assert_eq!(
            m.report_usage(0.91),
            Some(CompressionAction::FullCompress { target_tokens: 2000 })
        );
    }

    #[test]
    fn observed_level_repeats_until_applied() {
        let mut m = manager();
        assert_eq!(m.observe(0.55), Some(CompressionAction::Checkpoint));
        assert_eq!(m.state().last_level_applied, None);
        assert_eq!(m.observe(0.56), Some(CompressionAction::Checkpoint));

        m.apply(CompressionLevel::Checkpoint);
        assert_eq!(m.observe(0.57), None);
        m.apply(CompressionLevel::Checkpoint);
        assert_eq!(m.state().last_level_applied, Some(CompressionLevel::Checkpoint));
    }

    #[test]
    fn summarize_carries_keep_recent() {
        let mut m = manager();
        assert_eq!(
            m.report_usage(0.85),
            Some(CompressionAction::SummarizeHistory { keep_recent: 5 })
        );
    }

    #[test]
    fn nan_is_ignored_and_out_of_range_clamped() {
        let mut m = manager();
        assert_eq!(m.report_usage(f64::NAN), None);
        assert_eq!(m.state().usage_ratio, 0.0);
        assert_eq!(m.report_usage(1.7), Some(CompressionAction::EmergencyTrim));
        assert_eq!(m.state().usage_ratio, 1.0);
        assert_eq!(m.report_usage(-3.0), None);
        assert_eq!(m.state().usage_ratio, 0.0);
    }

    #[test]
    fn resumed_state_is_respected_and_reset_clears_it() {
        let state = CompressionState {
            usage_ratio: 0.75,
            last_level_applied: Some(CompressionLevel::PreCompress),
            checkpoint_ref: None,
            checkpoint_history: Vec::new(),
        };
        let mut m = manager().with_state(state);
        assert_eq!(m.report_usage(0.74), None);

        m.record_checkpoint(PathBuf::from("checkpoint-001.json"));
        assert_eq!(m.state().checkpoint_history.len(), 1);

        m.reset();
        assert_eq!(m.state(), &CompressionState::default());
        assert_eq!(m.report_usage(0.55), Some(CompressionAction::Checkpoint));
    }

    #[test]
    fn state_json_shape() {
        let mut m = manager();
        m.report_usage(0.55);
        let json = serde_json::to_value(m.state()).unwrap();
        assert_eq!(json["last_level_applied"], "checkpoint");
        assert!(json["checkpoint_ref"].is_null());

        let action = serde_json::to_value(CompressionAction::SummarizeHistory { keep_recent: 5 }).unwrap();
        assert_eq!(action["action"], "summarize_history");
        assert_eq!(action["keep_recent"], 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn levels_strictly_increase(reports in proptest::collection::vec(0.0f64..=1.0, 0..30)) {
            let applied = levels(&reports);
            prop_assert!(applied.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(applied.len() <= CompressionLevel::ALL.len());
        }
    }
}
