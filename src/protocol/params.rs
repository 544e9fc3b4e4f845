//! Per-method typed request params and results (spec §6 method surface
//! table). The router decodes `RequestEnvelope::params` into one of these
//! depending on `method`, instead of a single dynamically-typed shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::config::BacktestConfig;
use crate::broker::order::{Order, PartialOrder};
use crate::datasource::TableInfo;

#[derive(Clone, Debug, Deserialize)]
pub struct LoginParams {
    pub config: BacktestConfig,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResult {
    pub connected: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutResult {
    pub connected: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResult {
    pub replay_tables: Vec<TableInfo>,
}

/// `from`/`to` are decoded as raw integers rather than `DateTime<Utc>`
/// because the unit they're encoded in is declared per-table (component A);
/// the router can't resolve that until it has looked `table` up against the
/// advertised list, so [`crate::replay::run_replay`] converts them with
/// [`crate::timeutil::from_epoch`] once the table is known.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayParams {
    pub table: String,
    pub from: i64,
    pub to: i64,
    pub replay_interval: u64,
    pub replay_id: String,
    #[serde(default)]
    pub periodic_report: u32,
    #[serde(default)]
    pub trade_report: bool,
    #[serde(default)]
    pub end_of_day_report: bool,
    #[serde(default)]
    pub market_multiplex: bool,
}

/// `begin`/`end` are raw integers in the replayed table's declared epoch
/// unit, produced via [`crate::timeutil::to_epoch`] — the mirror of
/// [`ReplayParams`]'s decode.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub replay_id: String,
    pub begin: i64,
    pub end: i64,
}

/// `submitOrders`/`amendOrders`/`cancelOrders`/`cancelAllOrders` all return
/// an integer count per spec §6; the `Order`/`PartialOrder` batches are the
/// request params verbatim.
pub type SubmitOrdersParams = Vec<Order>;
pub type AmendOrdersParams = Vec<PartialOrder>;
pub type CancelOrdersParams = Vec<String>;
pub type SubscribeParams = Vec<String>;
