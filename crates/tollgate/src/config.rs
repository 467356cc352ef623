//! Engine configuration.
//!
//! Every field has a default, so a project without a config file runs with
//! the stock policy. Relative paths resolve against `project_dir`.
//!
//! ```ignore
//! let config = EngineConfig::load(".")?
//!     .with_max_attempts(5)
//!     .with_required_env(vec!["DATABASE_URL".into()]);
//! ```
//!
//! On disk (`.tollgate/config.json`):
//!
//! ```json
//! {
//!   "max_attempts": 3,
//!   "required_env": ["DATABASE_URL"],
//!   "compression": { "keep_recent": 5, "target_tokens": 2000 }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, StoreError};
use crate::hooks::builtin::BuiltinContext;
use crate::store::{EvidenceStore, StateStore};

/// Config file location, relative to the project directory.
pub const CONFIG_FILE: &str = ".tollgate/config.json";

// ── Compression ────────────────────────────────────────────────────

/// Thresholds and parameters for [`CompressionManager`](crate::context::CompressionManager).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CompressionConfig {
    /// Six ascending usage ratios, one per compression level.
    pub thresholds: Vec<f64>,
    /// Recent turns kept verbatim by `SummarizeHistory`.
    pub keep_recent: usize,
    /// Token budget for `FullCompress`.
    pub target_tokens: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            thresholds: vec![0.50, 0.70, 0.80, 0.85, 0.90, 0.95],
            keep_recent: 5,
            target_tokens: 2000,
        }
    }
}

impl CompressionConfig {
    fn validate(&self) -> Result<(), String> {
        if self.thresholds.len() != 6 {
            return Err(format!(
                "compression.thresholds needs 6 values, got {}",
                self.thresholds.len()
            ));
        }
        if self.thresholds.iter().any(|t| !(*t > 0.0 && *t <= 1.0)) {
            return Err("compression.thresholds must lie in (0, 1]".into());
        }
        if self.thresholds.windows(2).any(|w| w[0] >= w[1]) {
            return Err("compression.thresholds must be strictly ascending".into());
        }
        Ok(())
    }
}

// ── Engine ─────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Root the other paths resolve against. Not read from the file.
    #[serde(skip)]
    pub project_dir: PathBuf,
    pub progress_dir: PathBuf,
    pub evidence_dir: PathBuf,
    pub hooks_file: PathBuf,
    /// Implement/test cycles per feature, and consecutive gate failures
    /// tolerated in `IMPLEMENT`, before the feature is blocked.
    pub max_attempts: u32,
    /// Actor identity records older than this are ignored.
    pub identity_max_age_secs: i64,
    pub tester_role: String,
    /// Environment variables that must be set before source writes.
    pub required_env: Vec<String>,
    /// Path fragments that mark a write as source code.
    pub source_dirs: Vec<String>,
    pub compression: CompressionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            progress_dir: PathBuf::from(".tollgate/progress"),
            evidence_dir: PathBuf::from(".tollgate/evidence"),
            hooks_file: PathBuf::from(".tollgate/hooks.json"),
            max_attempts: 3,
            identity_max_age_secs: 4 * 60 * 60,
            tester_role: "tester".into(),
            required_env: Vec::new(),
            source_dirs: ["/src/", "/app/", "/lib/", "/components/"]
                .into_iter()
                .map(String::from)
                .collect(),
            compression: CompressionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `project_dir`.
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            ..Self::default()
        }
    }

    /// Load `<project_dir>/.tollgate/config.json`. A missing file yields
    /// defaults; a malformed or invalid one is an error.
    pub fn load(project_dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let project_dir = project_dir.into();
        let path = project_dir.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str::<EngineConfig>(&contents)
                .map_err(|source| StoreError::Parse { path: path.clone(), source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}; using defaults", path.display());
                EngineConfig::default()
            }
            Err(source) => return Err(StoreError::Read { path, source }.into()),
        };
        config.project_dir = project_dir;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_attempts == 0 {
            return Err(EngineError::Config("max_attempts must be at least 1".into()));
        }
        if self.identity_max_age_secs <= 0 {
            return Err(EngineError::Config("identity_max_age_secs must be positive".into()));
        }
        self.compression.validate().map_err(EngineError::Config)
    }

    // ── Builders ───────────────────────────────────────────────────

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_required_env(mut self, vars: Vec<String>) -> Self {
        self.required_env = vars;
        self
    }

    pub fn with_tester_role(mut self, role: impl Into<String>) -> Self {
        self.tester_role = role.into();
        self
    }

    pub fn with_identity_max_age(mut self, max_age: Duration) -> Self {
        self.identity_max_age_secs = max_age.num_seconds();
        self
    }

    pub fn with_hooks_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.hooks_file = path.into();
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    // ── Resolved paths ─────────────────────────────────────────────

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn progress_path(&self) -> PathBuf {
        self.resolve(&self.progress_dir)
    }

    pub fn evidence_path(&self) -> PathBuf {
        self.resolve(&self.evidence_dir)
    }

    pub fn hooks_path(&self) -> PathBuf {
        self.resolve(&self.hooks_file)
    }

    pub fn identity_max_age(&self) -> Duration {
        Duration::seconds(self.identity_max_age_secs)
    }

    /// What the built-in hooks need to read.
    pub fn builtin_context(&self, store: &StateStore, evidence: &EvidenceStore) -> Arc<BuiltinContext> {
        Arc::new(BuiltinContext {
            project_dir: self.project_dir.clone(),
            store: store.clone(),
            evidence: evidence.clone(),
            required_env: self.required_env.clone(),
            source_dirs: self.source_dirs.clone(),
            tester_role: self.tester_role.clone(),
            identity_max_age: self.identity_max_age(),
        })
    }
}
