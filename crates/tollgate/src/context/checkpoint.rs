//! Non-lossy checkpoints and the external compressor capability.
//!
//! A [`Checkpoint`] is written before any compression action is handed to a
//! [`Compressor`], so resume never depends on what the compressor kept.
//! Persistence is handled by [`StateStore`](crate::store::StateStore).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::compression::{CompressionAction, CompressionLevel};
use crate::session::{FeatureList, FeatureStatus, LifecycleState, Session};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FeatureSnapshot {
    pub id: String,
    pub status: FeatureStatus,
}

/// Serializable summary of session state at a compression boundary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub session_id: String,
    pub state: LifecycleState,
    pub feature_id: Option<String>,
    pub attempts: u32,
    pub features: Vec<FeatureSnapshot>,
    pub files_changed: Vec<String>,
    pub usage_ratio: f64,
    /// Level that triggered this checkpoint.
    pub level: CompressionLevel,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn capture(session: &Session, features: &FeatureList, usage_ratio: f64, level: CompressionLevel) -> Self {
        Self {
            session_id: session.id.clone(),
            state: session.current_state,
            feature_id: session.active_feature_id.clone(),
            attempts: session.attempt_count,
            features: features
                .iter()
                .map(|f| FeatureSnapshot {
                    id: f.id.clone(),
                    status: f.status,
                })
                .collect(),
            files_changed: session.context.files_changed.clone(),
            usage_ratio,
            level,
            timestamp: Utc::now(),
        }
    }

    /// One-paragraph summary suitable for re-seeding working memory.
    pub fn summary(&self) -> String {
        let features: Vec<String> = self
            .features
            .iter()
            .map(|f| format!("{}={}", f.id, f.status))
            .collect();
        format!(
            "session {} in {} (feature: {}, attempt {}); features: [{}]",
            self.session_id,
            self.state,
            self.feature_id.as_deref().unwrap_or("-"),
            self.attempts,
            features.join(", ")
        )
    }
}

/// The external summarization capability.
///
/// Receives the selected action and the current working memory and returns
/// the replacement memory.
pub trait Compressor: Send + Sync {
    fn compress(&self, action: &CompressionAction, memory: &str) -> Result<String, String>;
}

impl<F> Compressor for F
where
    F: Fn(&CompressionAction, &str) -> Result<String, String> + Send + Sync,
{
    fn compress(&self, action: &CompressionAction, memory: &str) -> Result<String, String> {
        self(action, memory)
    }
}
