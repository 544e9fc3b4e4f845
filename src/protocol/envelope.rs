//! Request/response envelope shapes (spec §4.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::order::{Fill, OrderState};
use crate::datasource::SymbolRow;
use crate::error::ErrorPayload;
use crate::metrics::MetricsReport;

/// The sentinel `cid` used for the multiplex fan-out channel (spec
/// glossary: "multiplex mode").
pub const MULTIPLEX_CID: &str = "__multiplex__";

#[derive(Clone, Debug, Deserialize)]
pub struct RequestEnvelope {
    pub method: String,
    pub id: u64,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default = "default_params")]
    pub params: Value,
}

fn default_params() -> Value {
    Value::Null
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum ResponseEnvelope {
    #[serde(rename = "result")]
    Result {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        cid: Option<String>,
        result: Value,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cid: Option<String>,
        error: ErrorPayload,
    },
    #[serde(rename = "event")]
    Event {
        #[serde(skip_serializing_if = "Option::is_none")]
        cid: Option<String>,
        event: EventPayload,
    },
}

impl ResponseEnvelope {
    pub fn result(id: u64, cid: Option<String>, result: Value) -> Self {
        ResponseEnvelope::Result { id, cid, result }
    }

    pub fn error(id: Option<u64>, cid: Option<String>, error: ErrorPayload) -> Self {
        ResponseEnvelope::Error { id, cid, error }
    }

    pub fn event(cid: Option<String>, event: EventPayload) -> Self {
        ResponseEnvelope::Event { cid, event }
    }
}

/// The payload carried by an `event` frame (spec §6).
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "eventType", rename_all = "lowercase")]
pub enum EventPayload {
    Market {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
        rows: Vec<SymbolRow>,
    },
    Order {
        updated: Vec<OrderState>,
        fill: Vec<Fill>,
    },
    Metrics(MetricsReport),
    External(Value),
}
