//! Immutable verification artifacts.
//!
//! Evidence is produced by the action executor (a test runner's exit code,
//! a parsed JSON report, a health check) and recorded here once. The
//! quality gate only ever reads the pre-computed fields of [`PayloadRef`];
//! raw logs are referenced by path and never parsed for pass/fail.
//!
//! Directory layout:
//! ```text
//! evidence/
//!   features/login-form/test_log/0001.json
//!   features/login-form/test_log/0002.json
//!   session/health_check/0001.json
//! ```

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::validate_id;
use crate::error::StoreError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    TestLog,
    CoverageReport,
    HealthCheck,
    Screenshot,
    BuildCheck,
}

impl EvidenceKind {
    pub const ALL: [EvidenceKind; 5] = [
        EvidenceKind::TestLog,
        EvidenceKind::CoverageReport,
        EvidenceKind::HealthCheck,
        EvidenceKind::Screenshot,
        EvidenceKind::BuildCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceKind::TestLog => "test_log",
            EvidenceKind::CoverageReport => "coverage_report",
            EvidenceKind::HealthCheck => "health_check",
            EvidenceKind::Screenshot => "screenshot",
            EvidenceKind::BuildCheck => "build_check",
        }
    }
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvidenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_ascii_lowercase();
        EvidenceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("unknown evidence kind '{s}'"))
    }
}

/// Structured, pre-computed fields of an artifact.
///
/// `passed` also reads the `all_passed` field written by results-file
/// producers.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PayloadRef {
    /// Path to the raw artifact (log, report, image). Never parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(default, alias = "all_passed", skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_failed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_percent: Option<f64>,
}

impl PayloadRef {
    pub fn passed(passed: bool) -> Self {
        Self {
            passed: Some(passed),
            ..Default::default()
        }
    }

    pub fn exit_code(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    /// Deterministic pass/fail: explicit flag, then exit code, then counts.
    /// `None` means the payload does not determine an outcome.
    pub fn outcome(&self) -> Option<bool> {
        if let Some(passed) = self.passed {
            return Some(passed);
        }
        if let Some(code) = self.exit_code {
            return Some(code == 0);
        }
        match (self.tests_passed, self.tests_failed) {
            (_, Some(failed)) if failed > 0 => Some(false),
            (Some(passed), Some(0)) if passed > 0 => Some(true),
            _ => None,
        }
    }
}

/// One immutable verification record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Evidence {
    pub kind: EvidenceKind,
    pub produced_at: DateTime<Utc>,
    pub source: String,
    pub payload_ref: PayloadRef,
}

impl Evidence {
    pub fn new(kind: EvidenceKind, source: impl Into<String>, payload_ref: PayloadRef) -> Self {
        Self {
            kind,
            produced_at: Utc::now(),
            source: source.into(),
            payload_ref,
        }
    }

    /// True only when the payload positively determines a pass.
    pub fn is_pass(&self) -> bool {
        self.payload_ref.outcome() == Some(true)
    }

    /// True only when the payload positively determines a failure.
    pub fn is_fail(&self) -> bool {
        self.payload_ref.outcome() == Some(false)
    }
}

/// Who produced a piece of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceScope<'a> {
    Feature(&'a str),
    /// Session-wide evidence such as health checks.
    Session,
}

impl<'a> EvidenceScope<'a> {
    /// Scope for an optional feature id; `None` means session-wide.
    pub fn from_feature(feature_id: Option<&'a str>) -> Self {
        feature_id.map_or(EvidenceScope::Session, EvidenceScope::Feature)
    }
}

/// Durable evidence directory.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding evidence of `kind` for `scope`.
    pub fn kind_dir(&self, scope: EvidenceScope<'_>, kind: EvidenceKind) -> Result<PathBuf, StoreError> {
        let base = match scope {
            EvidenceScope::Feature(id) => {
                validate_id(id)?;
                self.root.join("features").join(id)
            }
            EvidenceScope::Session => self.root.join("session"),
        };
        Ok(base.join(kind.as_str()))
    }

    /// Record evidence under the next sequence number. Existing records are
    /// never overwritten.
    pub fn record(&self, scope: EvidenceScope<'_>, evidence: &Evidence) -> Result<PathBuf, StoreError> {
        let dir = self.kind_dir(scope, evidence.kind)?;
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
            path: dir.clone(),
            source,
        })?;

        let next = Self::sequence_numbers(&dir)?
            .into_iter()
            .max()
            .unwrap_or(0)
            + 1;
        let path = dir.join(format!("{next:04}.json"));
        let json = serde_json::to_string_pretty(evidence)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::AlreadyExists {
                    StoreError::EvidenceExists(path.clone())
                } else {
                    StoreError::Write {
                        path: path.clone(),
                        source,
                    }
                }
            })?;
        file.write_all(json.as_bytes())
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;

        debug!("Recorded {} evidence at {}", evidence.kind, path.display());
        Ok(path)
    }

    /// Latest evidence of `kind` for `scope`, by sequence number.
    pub fn latest(&self, scope: EvidenceScope<'_>, kind: EvidenceKind) -> Result<Option<Evidence>, StoreError> {
        let dir = self.kind_dir(scope, kind)?;
        if !dir.is_dir() {
            return Ok(None);
        }
        let Some(seq) = Self::sequence_numbers(&dir)?.into_iter().max() else {
            return Ok(None);
        };
        let path = dir.join(format!("{seq:04}.json"));
        let json = std::fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;
        let evidence = serde_json::from_str(&json).map_err(|source| StoreError::Parse { path, source })?;
        Ok(Some(evidence))
    }

    /// Number of records of `kind` for `scope`.
    pub fn count(&self, scope: EvidenceScope<'_>, kind: EvidenceKind) -> Result<usize, StoreError> {
        let dir = self.kind_dir(scope, kind)?;
        if !dir.is_dir() {
            return Ok(0);
        }
        Ok(Self::sequence_numbers(&dir)?.len())
    }

    fn sequence_numbers(dir: &Path) -> Result<Vec<u32>, StoreError> {
        let entries = std::fs::read_dir(dir).map_err(|source| StoreError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut seqs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Read {
                path: dir.to_path_buf(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(seq) = name
                .strip_suffix(".json")
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                seqs.push(seq);
            }
        }
        Ok(seqs)
    }
}
