//! Durable session state: the state file, feature list, compression state,
//! checkpoints, and the actor identity record.
//!
//! [`StateStore`] is the single owner of these files. Writers go through an
//! explicit load/commit API and every write is atomic (serialize to a temp
//! file, then rename into place), so a second reader never observes a torn
//! record. Evidence lives in its own store, see [`evidence`].
//!
//! Directory layout:
//! ```text
//! progress/
//!   state.json
//!   feature-list.json
//!   compression.json
//!   identity.json
//!   checkpoints/
//!     checkpoint-001.json
//!     checkpoint-002.json
//! ```

pub mod evidence;

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::context::checkpoint::Checkpoint;
use crate::context::compression::CompressionState;
use crate::error::StoreError;
use crate::hooks::identity::ActorIdentity;
use crate::session::{FeatureList, Session};

pub use evidence::{Evidence, EvidenceKind, EvidenceScope, EvidenceStore, PayloadRef};

pub const STATE_FILE: &str = "state.json";
pub const FEATURE_LIST_FILE: &str = "feature-list.json";
pub const COMPRESSION_FILE: &str = "compression.json";
pub const IDENTITY_FILE: &str = "identity.json";
const CHECKPOINTS_DIR: &str = "checkpoints";

/// The feature list file accepts a bare array or a `{"features": [...]}`
/// wrapper. Writes always produce the bare array.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum FeatureListFile {
    Bare(FeatureList),
    Wrapped { features: FeatureList },
}

/// Owner of the progress directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open a store, creating the progress directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn feature_list_path(&self) -> PathBuf {
        self.dir.join(FEATURE_LIST_FILE)
    }

    pub fn compression_path(&self) -> PathBuf {
        self.dir.join(COMPRESSION_FILE)
    }

    pub fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.dir.join(CHECKPOINTS_DIR)
    }

    /// Whether `path` names a file only the engine may write.
    ///
    /// The feature list is excluded: the agent authors it during `INIT`.
    pub fn is_engine_owned(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if ![STATE_FILE, COMPRESSION_FILE, IDENTITY_FILE].contains(&name) {
            return false;
        }
        match (path.parent(), self.dir.canonicalize()) {
            (Some(parent), Ok(own)) if !parent.as_os_str().is_empty() => parent
                .canonicalize()
                .map(|p| p == own)
                .unwrap_or_else(|_| parent.ends_with(self.dir.file_name().unwrap_or_default())),
            // Bare file names are matched by name alone.
            _ => true,
        }
    }

    // ── Session ────────────────────────────────────────────────────

    pub fn load_session(&self) -> Result<Option<Session>, StoreError> {
        read_json(&self.state_path())
    }

    pub(crate) fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        write_atomic(&self.state_path(), session)
    }

    // ── Features ───────────────────────────────────────────────────

    /// Load the feature list. `None` when no list has been written yet.
    pub fn load_features(&self) -> Result<Option<FeatureList>, StoreError> {
        let file: Option<FeatureListFile> = read_json(&self.feature_list_path())?;
        Ok(file.map(|f| match f {
            FeatureListFile::Bare(list) | FeatureListFile::Wrapped { features: list } => list,
        }))
    }

    pub(crate) fn save_features(&self, features: &FeatureList) -> Result<(), StoreError> {
        write_atomic(&self.feature_list_path(), features)
    }

    // ── Compression ────────────────────────────────────────────────

    pub fn load_compression(&self) -> Result<Option<CompressionState>, StoreError> {
        read_json(&self.compression_path())
    }

    pub(crate) fn save_compression(&self, state: &CompressionState) -> Result<(), StoreError> {
        write_atomic(&self.compression_path(), state)
    }

    // ── Checkpoints ────────────────────────────────────────────────

    /// Checkpoint filename for a sequence number (zero-padded).
    fn checkpoint_filename(seq: u32) -> String {
        format!("checkpoint-{seq:03}.json")
    }

    fn checkpoint_sequences(&self) -> Result<Vec<(u32, PathBuf)>, StoreError> {
        let dir = self.checkpoints_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&dir).map_err(|source| StoreError::Read {
            path: dir.clone(),
            source,
        })?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Read {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(seq_str) = name
                .strip_prefix("checkpoint-")
                .and_then(|s| s.strip_suffix(".json"))
                && let Ok(seq) = seq_str.parse::<u32>()
            {
                found.push((seq, entry.path()));
            }
        }
        Ok(found)
    }

    /// Save a checkpoint under the next sequence number.
    pub(crate) fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<PathBuf, StoreError> {
        let next = self
            .checkpoint_sequences()?
            .iter()
            .map(|(seq, _)| *seq)
            .max()
            .unwrap_or(0)
            + 1;
        let path = self.checkpoints_dir().join(Self::checkpoint_filename(next));
        write_atomic(&path, checkpoint)?;
        Ok(path)
    }

    /// Load the latest (highest sequence) checkpoint.
    pub fn load_latest_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        match self.checkpoint_sequences()?.into_iter().max_by_key(|(seq, _)| *seq) {
            Some((_, path)) => read_json(&path),
            None => Ok(None),
        }
    }

    // ── Identity ───────────────────────────────────────────────────

    /// Load the actor identity record. A malformed record is logged and
    /// treated as absent: identity scopes hooks, it is not itself policy.
    pub fn load_identity(&self) -> Option<ActorIdentity> {
        match read_json(&self.identity_path()) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Ignoring unreadable identity record: {e}");
                None
            }
        }
    }

    /// Written by the actor itself at session start.
    pub fn save_identity(&self, identity: &ActorIdentity) -> Result<(), StoreError> {
        write_atomic(&self.identity_path(), identity)
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Identifiers become path components, so only a conservative alphabet is
/// accepted.
pub(crate) fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_json::from_str(&json).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(value))
}

/// Atomic write: serialize to a temp file, then rename into place.
fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp_path, json).map_err(|source| StoreError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────
