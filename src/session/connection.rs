//! The connection session (component F, spec §3): the map of logical
//! clients multiplexed onto one physical transport, plus the single
//! active-replay flag that makes "only one replay in flight per
//! connection" an invariant of the type rather than a convention.

use std::sync::Arc;

use chrono_tz::Tz;
use indexmap::IndexMap;
use serde_json::Value;

use crate::datasource::DataSource;
use crate::protocol::envelope::{EventPayload, ResponseEnvelope};
use crate::session::client::ClientSession;

/// Time-representation config negotiated from the server's default table
/// (spec §3): the epoch unit and timezone used for day-rollover
/// calculations.
#[derive(Clone, Copy, Debug)]
pub struct TimeConfig {
    pub timezone: Tz,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self { timezone: Tz::UTC }
    }
}

pub struct ConnectionSession {
    pub(crate) clients: IndexMap<String, ClientSession>,
    /// The `replayId` of the in-flight replay, if any. Only one replay may
    /// be active per connection (spec §4.4 preconditions).
    pub(crate) active_replay: Option<String>,
    pub(crate) time_config: TimeConfig,
    pub(crate) datasource: Arc<dyn DataSource>,
}

impl ConnectionSession {
    pub fn new(datasource: Arc<dyn DataSource>) -> Self {
        Self {
            clients: IndexMap::new(),
            active_replay: None,
            time_config: TimeConfig::default(),
            datasource,
        }
    }

    pub fn is_replay_active(&self) -> bool {
        self.active_replay.is_some()
    }

    pub fn client(&self, cid: &str) -> Option<&ClientSession> {
        self.clients.get(cid)
    }

    pub fn client_mut(&mut self, cid: &str) -> Option<&mut ClientSession> {
        self.clients.get_mut(cid)
    }

    /// Wraps an arbitrary payload as an `external` event addressed to `cid`
    /// (spec §6: `external` is emitted "optionally", with no producing
    /// request method of its own). The injection point a host embedding
    /// this core outside the JSON transport would use to push payloads that
    /// did not originate from a `DataSource` or the matching engine.
    pub fn emit_external(cid: Option<String>, payload: Value) -> ResponseEnvelope {
        ResponseEnvelope::event(cid, EventPayload::External(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_external_wraps_payload_for_the_given_cid() {
        let event = ConnectionSession::emit_external(Some("c1".to_string()), serde_json::json!({"k": 1}));
        match event {
            ResponseEnvelope::Event { cid, event: EventPayload::External(v) } => {
                assert_eq!(cid.as_deref(), Some("c1"));
                assert_eq!(v["k"], 1);
            }
            _ => panic!("expected an external event"),
        }
    }
}
