//! Actor identity records for hooks that scope themselves to a role.
//!
//! Stop signals arrive without an actor identifier, so an actor that wants
//! role-scoped enforcement writes a small identity record at session start.
//! The pipeline never attributes actions itself; hooks read this record.
//!
//! A record left behind by an earlier session is a hazard: a stale
//! "tester" record would keep enforcing tester policy on a different actor.
//! [`ActorIdentity::resolve`] therefore rejects records that are older than
//! the configured freshness window or were written for another session.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActorIdentity {
    /// Role name, e.g. `"tester"` or `"coder"`.
    pub role: String,
    /// Session the record was written for.
    pub session_id: String,
    pub written_at: DateTime<Utc>,
}

impl ActorIdentity {
    pub fn new(role: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            session_id: session_id.into(),
            written_at: Utc::now(),
        }
    }

    /// Why this record cannot be trusted for `session_id` at `now`, if at all.
    pub fn staleness(&self, session_id: &str, now: DateTime<Utc>, max_age: Duration) -> Option<String> {
        if self.session_id != session_id {
            return Some(format!(
                "identity record belongs to session '{}', not '{session_id}'",
                self.session_id
            ));
        }
        let age = now.signed_duration_since(self.written_at);
        if age > max_age {
            return Some(format!(
                "identity record is {}s old (limit {}s)",
                age.num_seconds(),
                max_age.num_seconds()
            ));
        }
        None
    }

    /// The record if it is fresh, otherwise `None` (logged).
    pub fn resolve(
        record: Option<ActorIdentity>,
        session_id: &str,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Option<ActorIdentity> {
        let record = record?;
        match record.staleness(session_id, now, max_age) {
            Some(why) => {
                warn!("Ignoring stale actor identity ({}): {why}", record.role);
                None
            }
            None => Some(record),
        }
    }
}
