//! The replay orchestrator (component G, spec §4.4): drives a `DataSource`
//! iterator, advances the shared clock, fans out to every client in two
//! ordered phases per batch, and paces emission for client-side
//! backpressure. This is the one long-running request in the protocol; it
//! is spawned onto the connection's local task set (see [`crate::router`])
//! so other handlers keep being served between its pacing sleeps.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::datasource::{Batch, MarketRow};
use crate::error::RouterError;
use crate::protocol::envelope::{EventPayload, ResponseEnvelope, MULTIPLEX_CID};
use crate::protocol::params::{ReplayParams, ReplayResult};
use crate::session::client::WILDCARD;
use crate::session::ConnectionSession;
use crate::timeutil::{from_epoch, to_epoch};

/// Clears the connection's active-replay flag on drop, so cancellation at
/// any suspension point (iterator read, pacing sleep) still releases the
/// "only one replay in flight" invariant (spec §5 Cancellation).
struct ActiveReplayGuard {
    conn: Rc<RefCell<ConnectionSession>>,
}

impl Drop for ActiveReplayGuard {
    fn drop(&mut self) {
        self.conn.borrow_mut().active_replay = None;
    }
}

/// Validates preconditions and, if they pass, spawns the replay loop onto
/// the current `LocalSet`. Precondition failures respond synchronously and
/// never spawn anything.
pub fn spawn_replay(
    conn: Rc<RefCell<ConnectionSession>>,
    request_id: u64,
    params: ReplayParams,
    out: UnboundedSender<ResponseEnvelope>,
) {
    {
        let mut guard = conn.borrow_mut();
        if guard.is_replay_active() {
            let _ = out.send(ResponseEnvelope::error(Some(request_id), None, RouterError::ReplayAlreadyActive.into()));
            return;
        }
        guard.active_replay = Some(params.replay_id.clone());
    }

    tokio::task::spawn_local(async move {
        let _guard = ActiveReplayGuard { conn: conn.clone() };
        let result = run_replay(&conn, request_id, &params, &out).await;
        match result {
            Ok(response) => {
                let _ = out.send(response);
            }
            Err(err) => {
                let _ = out.send(ResponseEnvelope::error(Some(request_id), None, err.into()));
            }
        }
    });
}

async fn run_replay(
    conn: &Rc<RefCell<ConnectionSession>>,
    request_id: u64,
    params: &ReplayParams,
    out: &UnboundedSender<ResponseEnvelope>,
) -> Result<ResponseEnvelope, RouterError> {
    // Precondition: the table must be in the advertised list.
    let datasource = conn.borrow().datasource.clone();
    let tables = datasource
        .enumerate_tables()
        .await
        .map_err(|e| RouterError::DataSourceError(e.to_string()))?;
    let Some(table) = tables.iter().find(|t| t.name == params.table) else {
        return Err(RouterError::InvalidTable {
            table: params.table.clone(),
            available: tables.iter().map(|t| t.name.clone()).collect(),
        });
    };
    let epoch_unit = table.epoch_unit;

    // `from`/`to` are wire integers in the table's declared epoch unit
    // (component A); resolve them to absolute time now that the table is
    // known.
    let tz = conn.borrow().time_config.timezone;
    let from = from_epoch(params.from, epoch_unit, tz)
        .ok_or_else(|| RouterError::InvalidParams("from is out of range for the table's epoch unit".to_string()))?;
    let to = from_epoch(params.to, epoch_unit, tz)
        .ok_or_else(|| RouterError::InvalidParams("to is out of range for the table's epoch unit".to_string()))?;

    // Step 1 — snapshot every client's reporting flags.
    // Step 2 — compute the union of subscriptions (wildcard -> no filter).
    let (symbol_filter, has_wildcard) = {
        let mut conn = conn.borrow_mut();
        let mut union = BTreeSet::new();
        let mut wildcard = false;
        for client in conn.clients.values_mut() {
            client.arm_reporting(params.periodic_report, params.trade_report, params.end_of_day_report);
            if client.has_wildcard() {
                wildcard = true;
            }
            for symbol in client.subscriptions() {
                if symbol != WILDCARD {
                    union.insert(symbol.clone());
                }
            }
        }
        (union, wildcard)
    };
    let filter = if has_wildcard { BTreeSet::new() } else { symbol_filter };

    // Step 3 — open the iterator and record the begin timestamp.
    let mut iterator = datasource
        .open(&params.table, from, to, &filter)
        .await
        .map_err(|e| RouterError::DataSourceError(e.to_string()))?;
    let replay_begin = Utc::now();
    info!(replay_id = %params.replay_id, table = %params.table, "replay started");

    let mut snapshot: IndexMap<String, f64> = IndexMap::new();

    let run_result = drive_batches(conn, &mut *iterator, params, &mut snapshot, out).await;
    iterator.close().await;

    run_result?;

    let replay_end = Utc::now();
    info!(replay_id = %params.replay_id, "replay finished");
    Ok(ResponseEnvelope::result(
        request_id,
        None,
        serde_json::to_value(ReplayResult {
            replay_id: params.replay_id.clone(),
            begin: to_epoch(replay_begin, epoch_unit, tz),
            end: to_epoch(replay_end, epoch_unit, tz),
        })
        .unwrap(),
    ))
}

async fn drive_batches(
    conn: &Rc<RefCell<ConnectionSession>>,
    iterator: &mut dyn crate::datasource::BatchIterator,
    params: &ReplayParams,
    snapshot: &mut IndexMap<String, f64>,
    out: &UnboundedSender<ResponseEnvelope>,
) -> Result<(), RouterError> {
    loop {
        let batch = iterator
            .next_batch()
            .await
            .map_err(|e| RouterError::ReplayError(e.to_string()))?;
        let Some(batch) = batch else { break };

        process_one_batch(conn, &batch, params, snapshot, out);

        if params.replay_interval > 0 {
            tokio::time::sleep(Duration::from_millis(params.replay_interval)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
    Ok(())
}

fn process_one_batch(
    conn: &Rc<RefCell<ConnectionSession>>,
    batch: &Batch,
    params: &ReplayParams,
    snapshot: &mut IndexMap<String, f64>,
    out: &UnboundedSender<ResponseEnvelope>,
) {
    let mut conn = conn.borrow_mut();
    let tz = conn.time_config.timezone;
    let now = batch.timestamp;

    // Step 5a — merge into the shared snapshot.
    let mut rows_by_symbol: IndexMap<String, MarketRow> = IndexMap::new();
    for row in &batch.rows {
        snapshot.insert(row.symbol.clone(), row.row.mark_price());
        rows_by_symbol.insert(row.symbol.clone(), row.row);
    }

    // Step 5b — advance every client's replay-time cursor.
    for client in conn.clients.values_mut() {
        client.set_replay_time(now);
    }

    let cids: Vec<String> = conn.clients.keys().cloned().collect();

    // Phase 1 — orders, for every client, before any client's phase 2.
    for cid in &cids {
        let client = conn.clients.get_mut(cid).unwrap();
        let has_open_symbol = client.broker().open_symbol_set().any(|s| rows_by_symbol.contains_key(s));
        if !has_open_symbol {
            continue;
        }
        let events = client.process_order_update(&rows_by_symbol, snapshot, now);
        for event in events {
            let _ = out.send(ResponseEnvelope::event(Some(cid.clone()), event));
        }
    }

    // Phase 2 — market data.
    if params.market_multiplex {
        for cid in &cids {
            let client = conn.clients.get_mut(cid).unwrap();
            let events = client.process_market_data(snapshot, now, tz);
            for event in events {
                let _ = out.send(ResponseEnvelope::event(Some(cid.clone()), event));
            }
        }
        let _ = out.send(ResponseEnvelope::event(
            Some(MULTIPLEX_CID.to_string()),
            EventPayload::Market { timestamp: now, rows: batch.rows.clone() },
        ));
    } else {
        for cid in &cids {
            let client = conn.clients.get_mut(cid).unwrap();
            let filtered = client.filter_rows(&batch.rows);
            if filtered.is_empty() {
                continue;
            }
            let metrics_events = client.process_market_data(snapshot, now, tz);
            for event in metrics_events {
                let _ = out.send(ResponseEnvelope::event(Some(cid.clone()), event));
            }
            let _ = out.send(ResponseEnvelope::event(
                Some(cid.clone()),
                EventPayload::Market { timestamp: now, rows: filtered },
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::config::{BacktestConfig, CommissionConfig, SlippageConfig};
    use crate::broker::order::{Effect, Order, OrderType, Side};
    use crate::datasource::testutil::InMemoryDataSource;
    use crate::datasource::{SymbolRow, TableInfo};
    use crate::session::ClientSession;
    use crate::timeutil::EpochUnit;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::task::LocalSet;

    fn table(name: &str) -> TableInfo {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        TableInfo { name: name.to_string(), start_time: start, end_time: end, epoch_unit: EpochUnit::Millis }
    }

    fn default_config() -> BacktestConfig {
        BacktestConfig {
            initial_cash: 10_000.0,
            risk_free: 0.0,
            commission: CommissionConfig::default(),
            slippage: SlippageConfig::default(),
        }
    }

    fn replay_params(replay_id: &str, multiplex: bool) -> ReplayParams {
        ReplayParams {
            table: "ticks".to_string(),
            from: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().timestamp_millis(),
            to: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap().timestamp_millis(),
            replay_interval: 0,
            replay_id: replay_id.to_string(),
            periodic_report: 0,
            trade_report: false,
            end_of_day_report: false,
            market_multiplex: multiplex,
        }
    }

    // S5 — a second replay on the same connection is rejected while one is
    // active; the first replay's own response is unaffected.
    #[tokio::test]
    async fn second_replay_on_same_connection_is_rejected() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let ds = Arc::new(InMemoryDataSource { tables: vec![table("ticks")], batches: Vec::new() });
                let conn = Rc::new(RefCell::new(ConnectionSession::new(ds)));
                let (tx, mut rx) = unbounded_channel();

                spawn_replay(conn.clone(), 1, replay_params("r1", false), tx.clone());
                assert!(conn.borrow().is_replay_active());
                spawn_replay(conn.clone(), 2, replay_params("r2", false), tx.clone());

                // The second request's rejection was enqueued synchronously,
                // before the first replay task ever got polled.
                match rx.recv().await.unwrap() {
                    ResponseEnvelope::Error { id, error, .. } => {
                        assert_eq!(id, Some(2));
                        assert_eq!(error.code, crate::error::ErrorCode::ReplayAlreadyActive);
                    }
                    other => panic!("expected an error for request 2, got {other:?}"),
                }
            })
            .await;
    }

    // S6 — two wildcard-subscribed clients in multiplex mode see exactly one
    // market event addressed to the sentinel cid, never a per-client one.
    #[test]
    fn multiplex_mode_emits_one_market_event_for_all_clients() {
        let ds = Arc::new(InMemoryDataSource { tables: Vec::new(), batches: Vec::new() });
        let mut conn = ConnectionSession::new(ds);
        let mut c1 = ClientSession::new("c1".to_string(), default_config());
        c1.add_subscriptions(&["*".to_string()], false);
        let mut c2 = ClientSession::new("c2".to_string(), default_config());
        c2.add_subscriptions(&["*".to_string()], false);
        conn.clients.insert("c1".to_string(), c1);
        conn.clients.insert("c2".to_string(), c2);
        let conn = Rc::new(RefCell::new(conn));

        let (tx, mut rx) = unbounded_channel();
        let params = replay_params("r1", true);
        let batch = Batch {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap(),
            rows: vec![SymbolRow {
                symbol: "X".to_string(),
                row: MarketRow::Quote { price: 100.0, bid: None, ask: None, volume: None },
            }],
        };
        let mut snapshot = IndexMap::new();
        process_one_batch(&conn, &batch, &params, &mut snapshot, &tx);
        drop(tx);

        let mut market_events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let ResponseEnvelope::Event { cid, event: EventPayload::Market { .. } } = msg {
                market_events.push(cid);
            }
        }
        assert_eq!(market_events, vec![Some(MULTIPLEX_CID.to_string())]);
    }

    // End-to-end: a single MARKET BUY fills within one replay batch and the
    // client sees an `order` event ahead of the table's own `replay` result.
    #[tokio::test]
    async fn full_replay_fills_a_resting_market_order() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let batch = Batch {
                    timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap(),
                    rows: vec![SymbolRow {
                        symbol: "X".to_string(),
                        row: MarketRow::Quote { price: 100.0, bid: None, ask: None, volume: None },
                    }],
                };
                let ds = Arc::new(InMemoryDataSource { tables: vec![table("ticks")], batches: vec![batch] });
                let conn = Rc::new(RefCell::new(ConnectionSession::new(ds)));
                let mut client = ClientSession::new("c1".to_string(), default_config());
                client.add_subscriptions(&["X".to_string()], false);
                client.broker_mut().submit(
                    &[Order {
                        id: "o1".to_string(),
                        symbol: "X".to_string(),
                        side: Side::Buy,
                        effect: Effect::OpenLong,
                        order_type: OrderType::Market,
                        quantity: 10.0,
                        price: None,
                        stop_price: None,
                    }],
                    Utc::now(),
                );
                conn.borrow_mut().clients.insert("c1".to_string(), client);

                let (tx, mut rx) = unbounded_channel();
                spawn_replay(conn.clone(), 1, replay_params("r1", false), tx);

                let mut saw_order_event = false;
                let mut saw_result = false;
                while let Some(msg) = rx.recv().await {
                    match msg {
                        ResponseEnvelope::Event { event: EventPayload::Order { updated, .. }, .. } => {
                            assert_eq!(updated[0].status, crate::broker::order::OrderStatus::Filled);
                            saw_order_event = true;
                        }
                        ResponseEnvelope::Result { .. } => {
                            saw_result = true;
                            break;
                        }
                        _ => {}
                    }
                }
                assert!(saw_order_event);
                assert!(saw_result);
                assert!(!conn.borrow().is_replay_active());
            })
            .await;
    }
}
