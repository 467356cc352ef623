//! Session orchestration and enforcement engine for autonomous coding agents.
//!
//! `tollgate` drives a long-running agent session through a fixed lifecycle
//! and refuses to let it advance on the agent's word alone:
//!
//! ```text
//! START ──▶ INIT ──▶ IMPLEMENT ──▶ TEST ──▶ COMPLETE
//!   │                  ▲  ▲           │
//!   └──────────────────┘  └───────────┘ retry (max 3, then blocked)
//! ```
//!
//! Every externally visible action passes through an ordered pipeline of
//! policy hooks that may allow, deny or rewrite it. Every transition is
//! guarded by a quality gate that reads only structured evidence (exit
//! codes, parsed counts) recorded by the action executor. A compression
//! manager watches working-memory usage and escalates through six
//! compression levels, saving a checkpoint before each one.
//!
//! # Getting started
//!
//! ```ignore
//! use tollgate::prelude::*;
//!
//! let config = EngineConfig::load("/path/to/project")?;
//! let mut controller = SessionController::builder(config)
//!     .with_event_handler(LoggingHandler)
//!     .open()?;
//!
//! controller.plan_features(&["auth-login-form".into()])?;
//! controller.propose_transition(LifecycleState::Implement, TransitionContext::new())?;
//!
//! let outcome = controller.handle(
//!     Action::WriteFile { path: "src/login.rs".into(), content: source },
//!     &mut executor,
//! )?;
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`controller`] | [`SessionController`](controller::SessionController): the action loop, stop signals, usage reports |
//! | [`session`] | Lifecycle states, the session aggregate, the [`StateMachine`](session::StateMachine) and [`QualityGate`](session::QualityGate) |
//! | [`hooks`] | [`Hook`](hooks::Hook) trait, registry, [`EnforcementPipeline`](hooks::EnforcementPipeline), external command hooks, built-in policies |
//! | [`store`] | Atomic state files and the immutable evidence store |
//! | [`context`] | Usage metering, compression level selection, checkpoints |
//! | [`events`] | [`EventHandler`](events::EventHandler) observers |
//! | [`config`] | [`EngineConfig`](config::EngineConfig) |

pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod events;
pub mod hooks;
pub mod prelude;
pub mod session;
pub mod store;

/// JSON Schema of the action descriptor that external hooks receive on
/// standard input.
pub fn action_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(hooks::ActionEnvelope);
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}
