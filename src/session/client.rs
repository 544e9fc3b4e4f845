//! The client session (component E, spec §4.2): owns a `Broker` and three
//! `Metrics` instances, the subscription set, and the replay-time cursor.
//! Translates market/order batches into outbound events; created by
//! `login`, destroyed by `logout` or transport close.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use indexmap::{IndexMap, IndexSet};

use crate::broker::config::BacktestConfig;
use crate::broker::Broker;
use crate::datasource::{MarketRow, SymbolRow};
use crate::metrics::{Metrics, ReportType};
use crate::protocol::envelope::EventPayload;
use crate::timeutil::to_day_index;

/// The sentinel that subscribes to every symbol.
pub const WILDCARD: &str = "*";

pub struct ClientSession {
    pub cid: String,
    subscriptions: IndexSet<String>,
    broker: Broker,
    periodic: Metrics,
    trade: Metrics,
    eod: Metrics,
    periodic_period: u32,
    trade_report: bool,
    eod_report: bool,
    replay_time: Option<DateTime<Utc>>,
    periodic_tick: u32,
    day_index: Option<i64>,
}

impl ClientSession {
    pub fn new(cid: String, config: BacktestConfig) -> Self {
        Self {
            cid,
            subscriptions: IndexSet::new(),
            broker: Broker::new(config),
            periodic: Metrics::new(config.risk_free, config.initial_cash),
            trade: Metrics::new(config.risk_free, config.initial_cash),
            eod: Metrics::new(config.risk_free, config.initial_cash),
            periodic_period: 0,
            trade_report: false,
            eod_report: false,
            replay_time: None,
            periodic_tick: 0,
            day_index: None,
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut Broker {
        &mut self.broker
    }

    pub fn subscriptions(&self) -> &IndexSet<String> {
        &self.subscriptions
    }

    pub fn has_wildcard(&self) -> bool {
        self.subscriptions.contains(WILDCARD)
    }

    pub fn matches_symbol(&self, symbol: &str) -> bool {
        self.has_wildcard() || self.subscriptions.contains(symbol)
    }

    /// `addSubscriptions`. During an active replay this is frozen to a
    /// no-op that returns an empty list (spec §4.2) — the caller is
    /// responsible for passing `replay_active` from the connection.
    pub fn add_subscriptions(&mut self, symbols: &[String], replay_active: bool) -> Vec<String> {
        if replay_active {
            return Vec::new();
        }
        symbols
            .iter()
            .filter(|s| self.subscriptions.insert((*s).clone()))
            .cloned()
            .collect()
    }

    /// `removeSubscriptions`, same freeze rule as `add_subscriptions`.
    pub fn remove_subscriptions(&mut self, symbols: &[String], replay_active: bool) -> Vec<String> {
        if replay_active {
            return Vec::new();
        }
        symbols
            .iter()
            .filter(|s| self.subscriptions.shift_remove(*s))
            .cloned()
            .collect()
    }

    /// Snapshots reporting flags from `replay` params at replay start
    /// (spec §4.4 step 1).
    pub fn arm_reporting(&mut self, periodic_period: u32, trade_report: bool, eod_report: bool) {
        self.periodic_period = periodic_period;
        self.trade_report = trade_report;
        self.eod_report = eod_report;
        self.periodic_tick = 0;
    }

    pub fn set_replay_time(&mut self, ts: DateTime<Utc>) {
        self.replay_time = Some(ts);
    }

    /// `processOrderUpdate(batch, snapshot)`: runs the broker's matching
    /// pass and emits an `order` event if anything updated, plus a `TRADE`
    /// metrics event if fills occurred and `tradeReport` is armed.
    pub fn process_order_update(
        &mut self,
        rows_by_symbol: &IndexMap<String, MarketRow>,
        snapshot: &IndexMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Vec<EventPayload> {
        let outcome = self.broker.process_open_orders(rows_by_symbol, now);
        let mut events = Vec::new();
        if !outcome.updated.is_empty() {
            events.push(EventPayload::Order {
                updated: outcome.updated,
                fill: outcome.filled.clone(),
            });
        }
        if !outcome.filled.is_empty() && self.trade_report {
            self.trade.update(self.broker.position(), snapshot, now);
            events.push(EventPayload::Metrics(self.trade.report(ReportType::Trade, now)));
        }
        events
    }

    /// `processMarketData(batch, snapshot)`: updates periodic and EOD
    /// running stats on every batch; emits `ENDOFDAY` on day rollover
    /// (computed via `toEpoch(timestamp, days, tz)`) before resetting EOD,
    /// then emits `PERIODIC` every `periodicPeriod` batches.
    pub fn process_market_data(
        &mut self,
        snapshot: &IndexMap<String, f64>,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Vec<EventPayload> {
        let mut events = Vec::new();

        self.periodic.update(self.broker.position(), snapshot, now);
        self.eod.update(self.broker.position(), snapshot, now);

        let day = to_day_index(now, tz);
        if let Some(prev_day) = self.day_index {
            if day > prev_day && self.eod_report {
                events.push(EventPayload::Metrics(self.eod.report(ReportType::Endofday, now)));
                self.eod.reset();
            }
        }
        self.day_index = Some(day);

        if self.periodic_period > 0 {
            self.periodic_tick += 1;
            if self.periodic_tick >= self.periodic_period {
                self.periodic_tick = 0;
                events.push(EventPayload::Metrics(self.periodic.report(ReportType::Periodic, now)));
            }
        }

        events
    }

    /// Builds the filtered market event payload for this client:
    /// `"*"` subscribers see the full batch, everyone else sees only rows
    /// for symbols they subscribe to.
    pub fn filter_rows<'a>(&self, rows: &'a [SymbolRow]) -> Vec<SymbolRow> {
        if self.has_wildcard() {
            rows.to_vec()
        } else {
            rows.iter()
                .filter(|r| self.subscriptions.contains(&r.symbol))
                .cloned()
                .collect()
        }
    }
}
