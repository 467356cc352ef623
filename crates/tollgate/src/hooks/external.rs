//! External command hooks and the hooks file.
//!
//! A [`CommandHook`] runs `sh -c <command>` in the project directory with
//! the action descriptor as JSON on stdin. The exit code decides:
//!
//! - `0` proceeds. If stdout holds a JSON decision object
//!   (`{"decision": "deny", "reason": ...}` or
//!   `{"decision": "modify", "action": {...}}`) it is honoured.
//! - anything else blocks, with stderr (or stdout) as the reason.
//!
//! Context is also passed through environment variables:
//! - `TOLLGATE_HOOK_EVENT`: lifecycle point (e.g. `PreAction`)
//! - `TOLLGATE_ACTION`: action name (e.g. `write_file`)
//! - `TOLLGATE_SESSION_ID`
//! - `TOLLGATE_PROJECT_DIR`
//!
//! # Hooks file
//!
//! ```json
//! {
//!   "PreAction": [
//!     {
//!       "matcher": "write_file|run_command",
//!       "hooks": [
//!         { "type": "command", "command": "./scripts/check.sh" },
//!         { "type": "predicate", "name": "no-env-files",
//!           "path_contains": ".env", "reason": "do not write .env files" }
//!       ]
//!     }
//!   ],
//!   "AgentStop": [
//!     { "hooks": [ { "type": "command", "command": "./scripts/stop-check.sh" } ] }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::builtin::{BuiltinContext, PredicateHook, PredicateSpec, register_builtins};
use super::{ActionEnvelope, ActionMatcher, Hook, HookRegistry, HookVerdict, LifecyclePoint};
use crate::error::{EngineError, HookError, StoreError};

// ── CommandHook ────────────────────────────────────────────────────

/// A hook backed by an external program.
#[derive(Debug, Clone)]
pub struct CommandHook {
    name: String,
    command: String,
    workdir: PathBuf,
}

impl CommandHook {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        let command = command.into();
        Self {
            name: command.clone(),
            command,
            workdir: workdir.into(),
        }
    }

    /// Report denials under `name` instead of the command line.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command with `envelope` on stdin. Returns the exit code and
    /// trimmed stdout and stderr.
    fn run(&self, envelope: &ActionEnvelope) -> Result<(i32, String, String), HookError> {
        let input = serde_json::to_vec(envelope).map_err(|e| HookError::Other(e.to_string()))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.workdir)
            .env("TOLLGATE_HOOK_EVENT", envelope.point.as_str())
            .env("TOLLGATE_ACTION", envelope.action.name())
            .env("TOLLGATE_SESSION_ID", &envelope.session_id)
            .env("TOLLGATE_PROJECT_DIR", &self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| HookError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        // Stdin is fed from its own thread while this one drains the pipes.
        let stdin = child.stdin.take();
        let (written, output) = thread::scope(|scope| {
            let writer = scope.spawn(move || match stdin {
                Some(mut stdin) => match stdin.write_all(&input) {
                    // A hook that ignores stdin may exit before reading it.
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                    result => result,
                },
                None => Ok(()),
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
            (written, output)
        });

        written.map_err(|source| HookError::Io {
            command: self.command.clone(),
            source,
        })?;
        let output = output.map_err(|source| HookError::Io {
            command: self.command.clone(),
            source,
        })?;

        let exit_code = output.status.code().unwrap_or(1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok((exit_code, stdout, stderr))
    }
}

impl Hook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, envelope: &ActionEnvelope) -> Result<HookVerdict, HookError> {
        let (exit_code, stdout, stderr) = self.run(envelope)?;
        debug!("Hook command '{}' exited with {exit_code}", self.command);

        if exit_code != 0 {
            let reason = if !stderr.is_empty() {
                stderr
            } else if !stdout.is_empty() {
                stdout
            } else {
                format!("hook '{}' blocked {}", self.name, envelope.action.name())
            };
            return Ok(HookVerdict::Deny { reason });
        }

        if stdout.starts_with('{') {
            return serde_json::from_str(&stdout)
                .map_err(|e| HookError::InvalidDecision(format!("{e}: {stdout}")));
        }
        Ok(HookVerdict::Allow)
    }
}

// ── HookConfig ─────────────────────────────────────────────────────

/// One hook declared in the hooks file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookSpec {
    Command {
        command: String,
        #[serde(default)]
        name: Option<String>,
    },
    Predicate(PredicateSpec),
}

/// Hooks sharing one action matcher.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HookGroup {
    /// `|`-separated action names; absent or `*` matches every action.
    #[serde(default)]
    pub matcher: Option<String>,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
}

/// The hooks file: groups keyed by lifecycle point name.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct HookConfig {
    pub points: BTreeMap<String, Vec<HookGroup>>,
}

impl HookConfig {
    /// Load the hooks file. A missing file is an empty config; an unreadable
    /// or malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No hooks file at {}", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn with_group(mut self, point: LifecyclePoint, group: HookGroup) -> Self {
        self.points
            .entry(point.as_str().to_string())
            .or_default()
            .push(group);
        self
    }

    /// Build a registry: the built-ins first, then the configured hooks in
    /// file order. Command hooks run in `ctx.project_dir`.
    pub fn into_registry(self, ctx: &Arc<BuiltinContext>) -> Result<HookRegistry, EngineError> {
        let mut registry = HookRegistry::new();
        register_builtins(&mut registry, ctx);

        for (key, groups) in self.points {
            let point: LifecyclePoint = key.parse().map_err(EngineError::Config)?;
            for group in groups {
                let matcher = ActionMatcher::from_option(group.matcher.as_deref());
                for spec in group.hooks {
                    let hook: Box<dyn Hook> = match spec {
                        HookSpec::Command { command, name } => {
                            if command.trim().is_empty() {
                                warn!("Skipping empty hook command at {point}");
                                continue;
                            }
                            let hook = CommandHook::new(command, &ctx.project_dir);
                            Box::new(match name {
                                Some(name) => hook.with_name(name),
                                None => hook,
                            })
                        }
                        HookSpec::Predicate(spec) => Box::new(PredicateHook::new(spec)),
                    };
                    registry.register_boxed(point, matcher.clone(), hook);
                }
            }
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Action;
    use crate::session::LifecycleState;
    use crate::store::{EvidenceStore, StateStore};

    fn envelope(action: Action) -> ActionEnvelope {
        ActionEnvelope {
            point: LifecyclePoint::PreAction,
            session_id: "s-1".into(),
            state: LifecycleState::Implement,
            feature_id: Some("login".into()),
            action,
        }
    }

    fn write(path: &str) -> Action {
        Action::WriteFile {
            path: path.into(),
            content: "fn main() {}".into(),
        }
    }

    fn hook(command: &str) -> CommandHook {
        CommandHook::new(command, std::env::temp_dir())
    }

    // ── CommandHook execution ──────────────────────────────────────

    #[test]
    fn exit_zero_allows() {
        let verdict = hook("exit 0").evaluate(&envelope(write("src/a.rs"))).unwrap();
        assert_eq!(verdict, HookVerdict::Allow);
    }

    #[test]
    fn nonzero_exit_denies_with_stderr() {
        let verdict = hook("echo 'blocked by policy' >&2; exit 2")
            .evaluate(&envelope(write("src/a.rs")))
            .unwrap();
        assert_eq!(verdict, HookVerdict::deny("blocked by policy"));
    }

    #[test]
    fn nonzero_exit_without_output_has_default_reason() {
        let verdict = hook("exit 1")
            .with_name("quiet")
            .evaluate(&envelope(write("src/a.rs")))
            .unwrap();
        assert_eq!(verdict, HookVerdict::deny("hook 'quiet' blocked write_file"));
    }

    #[test]
    fn large_input_echoed_back_does_not_stall() {
        let big = Action::WriteFile {
            path: "src/generated.rs".into(),
            content: "x".repeat(2 * 1024 * 1024),
        };

        let verdict = hook("cat >&2; exit 0").evaluate(&envelope(big.clone())).unwrap();
        assert_eq!(verdict, HookVerdict::Allow);

        // The echoed envelope is not a decision object.
        let err = hook("cat").evaluate(&envelope(big)).unwrap_err();
        assert!(matches!(err, HookError::InvalidDecision(_)), "{err}");
    }

    #[test]
    fn hook_reads_descriptor_and_env() {
        // Denies only when stdin carries the expected path and the env
        // names the point.
        let command = r#"grep -q '"path":"src/a.rs"' && [ "$TOLLGATE_HOOK_EVENT" = PreAction ] && [ "$TOLLGATE_ACTION" = write_file ] && { echo matched >&2; exit 2; }; exit 0"#;
        let verdict = hook(command).evaluate(&envelope(write("src/a.rs"))).unwrap();
        assert_eq!(verdict, HookVerdict::deny("matched"));

        let verdict = hook(command).evaluate(&envelope(write("src/b.rs"))).unwrap();
        assert_eq!(verdict, HookVerdict::Allow);
    }

    #[test]
    fn stdout_decision_object_is_honoured() {
        let command = r#"printf '%s' '{"decision":"modify","action":{"kind":"run_command","command":"cargo test -q"}}'"#;
        let verdict = hook(command)
            .evaluate(&envelope(Action::RunCommand {
                command: "cargo test".into(),
            }))
            .unwrap();
        assert_eq!(
            verdict,
            HookVerdict::modify(Action::RunCommand {
                command: "cargo test -q".into()
            })
        );
    }

    #[test]
    fn malformed_decision_is_an_error() {
        let result = hook("echo '{not json'").evaluate(&envelope(write("src/a.rs")));
        assert!(matches!(result, Err(HookError::InvalidDecision(_))));
    }

    #[test]
    fn plain_stdout_is_ignored() {
        let verdict = hook("echo all good").evaluate(&envelope(write("src/a.rs"))).unwrap();
        assert_eq!(verdict, HookVerdict::Allow);
    }

    #[test]
    fn missing_workdir_is_spawn_error() {
        let hook = CommandHook::new("exit 0", "/nonexistent/tollgate-workdir");
        let result = hook.evaluate(&envelope(write("src/a.rs")));
        assert!(matches!(result, Err(HookError::Spawn { .. })));
    }

    // ── HookConfig ─────────────────────────────────────────────────

    #[test]
    fn config_deserializes_settings_shape() {
        let json = r#"{
            "PreAction": [
                {
                    "matcher": "write_file",
                    "hooks": [
                        { "type": "command", "command": "./check.sh" },
                        { "type": "predicate", "name": "no-env", "path_contains": ".env", "reason": "no" }
                    ]
                }
            ],
            "AgentStop": [ { "hooks": [ { "type": "command", "command": "true", "name": "stop" } ] } ]
        }"#;
        let config: HookConfig = serde_json::from_str(json).unwrap();
        let pre = &config.points["PreAction"];
        assert_eq!(pre[0].matcher.as_deref(), Some("write_file"));
        assert_eq!(
            pre[0].hooks[0],
            HookSpec::Command {
                command: "./check.sh".into(),
                name: None
            }
        );
        assert!(matches!(&pre[0].hooks[1], HookSpec::Predicate(p) if p.name == "no-env"));
        assert_eq!(config.points["AgentStop"][0].matcher, None);
    }

    #[test]
    fn missing_file_is_empty_and_malformed_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = HookConfig::load(dir.path().join("hooks.json")).unwrap();
        assert!(config.points.is_empty());

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(HookConfig::load(&path), Err(StoreError::Parse { .. })));
    }

    fn context(dir: &Path) -> Arc<BuiltinContext> {
        Arc::new(BuiltinContext {
            project_dir: dir.to_path_buf(),
            store: StateStore::open(dir.join(".tollgate/progress")).unwrap(),
            evidence: EvidenceStore::new(dir.join(".tollgate/evidence")),
            required_env: Vec::new(),
            source_dirs: Vec::new(),
            tester_role: "tester".into(),
            identity_max_age: chrono::Duration::hours(4),
        })
    }

    #[test]
    fn registry_puts_builtins_first() {
        let dir = tempfile::tempdir().unwrap();
        let config = HookConfig::default().with_group(
            LifecyclePoint::PreAction,
            HookGroup {
                matcher: Some("run_command".into()),
                hooks: vec![HookSpec::Command {
                    command: "exit 0".into(),
                    name: Some("lint".into()),
                }],
            },
        );
        let registry = config.into_registry(&context(dir.path())).unwrap();
        let names = registry.names(LifecyclePoint::PreAction);
        assert_eq!(names.first(), Some(&"guard_state_file"));
        assert_eq!(names.last(), Some(&"lint"));
    }

    #[test]
    fn unknown_point_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config: HookConfig =
            serde_json::from_str(r#"{"PreToolUse": [{"hooks": []}]}"#).unwrap();
        let result = config.into_registry(&context(dir.path()));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
