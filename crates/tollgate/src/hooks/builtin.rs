//! Built-in policy hooks and the config-driven predicate hook.
//!
//! Built-ins inspect structured action fields and store accessors only.
//! They are registered ahead of anything from the hooks file by
//! [`register_builtins`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use super::identity::ActorIdentity;
use super::{Action, ActionEnvelope, ActionMatcher, Hook, HookRegistry, HookVerdict, LifecyclePoint};
use crate::error::HookError;
use crate::session::{FeatureList, FeatureStatus};
use crate::store::{EvidenceKind, EvidenceScope, EvidenceStore, StateStore};

/// Everything the built-in hooks read.
#[derive(Debug, Clone)]
pub struct BuiltinContext {
    pub project_dir: PathBuf,
    pub store: StateStore,
    pub evidence: EvidenceStore,
    pub required_env: Vec<String>,
    pub source_dirs: Vec<String>,
    pub tester_role: String,
    pub identity_max_age: Duration,
}

impl BuiltinContext {
    /// `path` as written by the agent, resolved against the project.
    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path.trim_start_matches("./"));
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.project_dir.join(p)
        }
    }

    /// Failure message when `feature_id` lacks passing test evidence.
    fn missing_test_evidence(&self, feature_id: &str) -> Option<String> {
        let scope = EvidenceScope::Feature(feature_id);
        let dir = match self.evidence.kind_dir(scope, EvidenceKind::TestLog) {
            Ok(dir) => dir,
            Err(e) => return Some(e.to_string()),
        };
        match self.evidence.latest(scope, EvidenceKind::TestLog) {
            Ok(Some(ev)) if ev.is_pass() => None,
            _ => Some(format!(
                "cannot mark tested without evidence in {}",
                dir.display()
            )),
        }
    }
}

/// Register every built-in hook at its lifecycle point.
pub fn register_builtins(registry: &mut HookRegistry, ctx: &Arc<BuiltinContext>) {
    registry.register(
        LifecyclePoint::PreAction,
        ActionMatcher::parse("write_file"),
        GuardStateFile(Arc::clone(ctx)),
    );
    registry.register(
        LifecyclePoint::PreAction,
        ActionMatcher::parse("write_file|mark_tested"),
        RequireTestEvidence(Arc::clone(ctx)),
    );
    registry.register(
        LifecyclePoint::PreAction,
        ActionMatcher::parse("write_file"),
        RequireEnv::from_context(ctx),
    );
    registry.register(
        LifecyclePoint::PreAction,
        ActionMatcher::parse("write_file"),
        SandboxedMcp,
    );
    registry.register(
        LifecyclePoint::AgentStop,
        ActionMatcher::any(),
        TesterStopGuard(Arc::clone(ctx)),
    );
}

// ── guard_state_file ───────────────────────────────────────────────

/// Denies agent writes to engine-owned progress files.
pub struct GuardStateFile(pub Arc<BuiltinContext>);

impl Hook for GuardStateFile {
    fn name(&self) -> &str {
        "guard_state_file"
    }

    fn evaluate(&self, envelope: &ActionEnvelope) -> Result<HookVerdict, HookError> {
        let Some(path) = envelope.action.path() else {
            return Ok(HookVerdict::Allow);
        };
        if self.0.store.is_engine_owned(&self.0.resolve(path)) {
            return Ok(HookVerdict::deny(format!(
                "{path} is owned by the session engine; use the transition interface"
            )));
        }
        Ok(HookVerdict::Allow)
    }
}

// ── require_test_evidence ──────────────────────────────────────────

/// Denies marking a feature tested unless its latest test log passed.
pub struct RequireTestEvidence(pub Arc<BuiltinContext>);

impl RequireTestEvidence {
    /// Features a feature-list write would newly mark tested.
    fn newly_tested(&self, content: &str) -> Result<Vec<String>, String> {
        let proposed: FeatureList = serde_json::from_str::<serde_json::Value>(content)
            .map_err(|e| format!("feature list is not valid JSON: {e}"))
            .and_then(|v| {
                let list = v.get("features").cloned().unwrap_or(v);
                serde_json::from_value(list).map_err(|e| format!("feature list is malformed: {e}"))
            })?;
        let current = self.0.store.load_features().ok().flatten().unwrap_or_default();
        Ok(proposed
            .iter()
            .filter(|f| f.status == FeatureStatus::Tested)
            .filter(|f| {
                current
                    .get(&f.id)
                    .is_none_or(|c| c.status != FeatureStatus::Tested)
            })
            .map(|f| f.id.clone())
            .collect())
    }
}

impl Hook for RequireTestEvidence {
    fn name(&self) -> &str {
        "require_test_evidence"
    }

    fn evaluate(&self, envelope: &ActionEnvelope) -> Result<HookVerdict, HookError> {
        let ids = match &envelope.action {
            Action::MarkTested { feature_id } => vec![feature_id.clone()],
            Action::WriteFile { path, content } => {
                if self.0.resolve(path) != self.0.store.feature_list_path() {
                    return Ok(HookVerdict::Allow);
                }
                match self.newly_tested(content) {
                    Ok(ids) => ids,
                    Err(why) => return Ok(HookVerdict::deny(why)),
                }
            }
            _ => return Ok(HookVerdict::Allow),
        };
        for id in ids {
            if let Some(why) = self.0.missing_test_evidence(&id) {
                return Ok(HookVerdict::deny(why));
            }
        }
        Ok(HookVerdict::Allow)
    }
}

// ── require_env ────────────────────────────────────────────────────

type EnvLookup = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Denies source writes while a required environment variable is unset.
pub struct RequireEnv {
    required: Vec<String>,
    source_dirs: Vec<String>,
    is_set: EnvLookup,
}

impl RequireEnv {
    pub fn new(required: Vec<String>, source_dirs: Vec<String>) -> Self {
        Self {
            required,
            source_dirs,
            is_set: Box::new(|name| std::env::var_os(name).is_some_and(|v| !v.is_empty())),
        }
    }

    fn from_context(ctx: &BuiltinContext) -> Self {
        Self::new(ctx.required_env.clone(), ctx.source_dirs.clone())
    }

    /// Replace the environment lookup.
    pub fn with_lookup(mut self, is_set: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.is_set = Box::new(is_set);
        self
    }

    fn is_source_file(&self, path: &str) -> bool {
        let rooted = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        self.source_dirs.iter().any(|d| rooted.contains(d.as_str()))
    }
}

impl Hook for RequireEnv {
    fn name(&self) -> &str {
        "require_env"
    }

    fn evaluate(&self, envelope: &ActionEnvelope) -> Result<HookVerdict, HookError> {
        if self.required.is_empty() {
            return Ok(HookVerdict::Allow);
        }
        let Some(path) = envelope.action.path() else {
            return Ok(HookVerdict::Allow);
        };
        if !self.is_source_file(path) {
            return Ok(HookVerdict::Allow);
        }
        let missing: Vec<&str> = self
            .required
            .iter()
            .map(String::as_str)
            .filter(|name| !(self.is_set)(name))
            .collect();
        if missing.is_empty() {
            Ok(HookVerdict::Allow)
        } else {
            Ok(HookVerdict::deny(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )))
        }
    }
}

// ── sandboxed_mcp ──────────────────────────────────────────────────

/// Denies `.mcp.json` writes declaring `npx` servers not wrapped by `srt`.
pub struct SandboxedMcp;

impl SandboxedMcp {
    fn unsandboxed(content: &str) -> Vec<String> {
        let Ok(config) = serde_json::from_str::<serde_json::Value>(content) else {
            return Vec::new();
        };
        let Some(servers) = config.get("mcpServers").and_then(|s| s.as_object()) else {
            return Vec::new();
        };
        servers
            .iter()
            .filter(|(_, server)| {
                let command = server.get("command").and_then(|c| c.as_str()).unwrap_or_default();
                let local = ["./", "python", "node"].iter().any(|p| command.starts_with(p));
                !local && command.contains("npx") && !command.contains("srt")
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Hook for SandboxedMcp {
    fn name(&self) -> &str {
        "sandboxed_mcp"
    }

    fn evaluate(&self, envelope: &ActionEnvelope) -> Result<HookVerdict, HookError> {
        let Action::WriteFile { path, content } = &envelope.action else {
            return Ok(HookVerdict::Allow);
        };
        if Path::new(path).file_name().and_then(|n| n.to_str()) != Some(".mcp.json") {
            return Ok(HookVerdict::Allow);
        }
        let unsandboxed = Self::unsandboxed(content);
        if unsandboxed.is_empty() {
            Ok(HookVerdict::Allow)
        } else {
            Ok(HookVerdict::deny(format!(
                "MCP servers must be wrapped with 'srt'; unsandboxed: {}",
                unsandboxed.join(", ")
            )))
        }
    }
}

// ── tester_stop_guard ──────────────────────────────────────────────

/// Keeps a tester running until the active feature has passing tests.
pub struct TesterStopGuard(pub Arc<BuiltinContext>);

impl Hook for TesterStopGuard {
    fn name(&self) -> &str {
        "tester_stop_guard"
    }

    fn evaluate(&self, envelope: &ActionEnvelope) -> Result<HookVerdict, HookError> {
        let ctx = &self.0;
        let identity = ActorIdentity::resolve(
            ctx.store.load_identity(),
            &envelope.session_id,
            Utc::now(),
            ctx.identity_max_age,
        );
        if identity.is_none_or(|i| i.role != ctx.tester_role) {
            return Ok(HookVerdict::Allow);
        }
        let Some(feature_id) = envelope.feature_id.as_deref() else {
            return Ok(HookVerdict::Allow);
        };
        match ctx.missing_test_evidence(feature_id) {
            Some(_) => Ok(HookVerdict::deny(format!(
                "tester must record passing test evidence for '{feature_id}' before stopping"
            ))),
            None => Ok(HookVerdict::Allow),
        }
    }
}

// ── Predicate hooks ────────────────────────────────────────────────

/// A declarative deny rule from the hooks file. Denies when every given
/// condition matches; a rule with no conditions denies everything its
/// matcher selects.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PredicateSpec {
    pub name: String,
    #[serde(default)]
    pub path_contains: Option<String>,
    #[serde(default)]
    pub content_contains: Option<String>,
    #[serde(default)]
    pub command_contains: Option<String>,
    pub reason: String,
}

pub struct PredicateHook {
    spec: PredicateSpec,
}

impl PredicateHook {
    pub fn new(spec: PredicateSpec) -> Self {
        Self { spec }
    }

    fn field_matches(wanted: Option<&str>, actual: Option<&str>) -> bool {
        match wanted {
            None => true,
            Some(w) => actual.is_some_and(|a| a.contains(w)),
        }
    }

    pub fn matches(&self, action: &Action) -> bool {
        let (path, content, command) = match action {
            Action::WriteFile { path, content } => (Some(path.as_str()), Some(content.as_str()), None),
            Action::RunCommand { command } => (None, None, Some(command.as_str())),
            _ => (None, None, None),
        };
        Self::field_matches(self.spec.path_contains.as_deref(), path)
            && Self::field_matches(self.spec.content_contains.as_deref(), content)
            && Self::field_matches(self.spec.command_contains.as_deref(), command)
    }
}

impl Hook for PredicateHook {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn evaluate(&self, envelope: &ActionEnvelope) -> Result<HookVerdict, HookError> {
        if self.matches(&envelope.action) {
            Ok(HookVerdict::deny(self.spec.reason.clone()))
        } else {
            Ok(HookVerdict::Allow)
        }
    }
}
