//! The backtest broker (component C, spec §4.3): per-client order book,
//! matching against quotes/bars, slippage, commission, and FIFO position
//! accounting. Ingress operations are atomic and synchronous — nothing here
//! ever suspends, so a `Broker` is a plain single-writer data structure
//! (spec §5) owned by exactly one `ClientSession`.

pub mod config;
pub mod matching;
pub mod order;
pub mod position;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::broker::config::BacktestConfig;
use crate::broker::matching::{run_matching_pass, MatchOutcome};
use crate::broker::order::{Effect, Fill, Order, OrderState, OrderStatus, PartialOrder};
use crate::broker::position::Position;
use crate::datasource::MarketRow;

pub struct Broker {
    open_orders: IndexMap<String, OrderState>,
    /// `openSymbols[sym]` is the refcount of open orders on `sym`; must
    /// equal `|{o in open_orders : o.symbol == sym}|` at every quiescent
    /// point (spec §3, invariant 1 of §8).
    open_symbols: IndexMap<String, usize>,
    position: Position,
    config: BacktestConfig,
    fill_seq: u64,
}

impl Broker {
    pub fn new(config: BacktestConfig) -> Self {
        Self {
            open_orders: IndexMap::new(),
            open_symbols: IndexMap::new(),
            position: Position::new(config.initial_cash),
            config,
            fill_seq: 0,
        }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn open_orders(&self) -> Vec<OrderState> {
        self.open_orders.values().cloned().collect()
    }

    /// The set of symbols with at least one open order, used by the replay
    /// orchestrator to decide whether `processOrderUpdate` has anything to
    /// do for a given batch (spec §4.4 step 5c).
    pub fn open_symbol_set(&self) -> impl Iterator<Item = &str> {
        self.open_symbols.keys().map(|s| s.as_str())
    }

    /// `submit(orders)`: id-collision yields REJECTED without a map insert;
    /// otherwise the order is OPEN and `openSymbols[sym]` is incremented.
    pub fn submit(&mut self, orders: &[Order], now: DateTime<Utc>) -> Vec<OrderState> {
        orders
            .iter()
            .map(|order| {
                if self.open_orders.contains_key(&order.id) || !order.effect.valid_for(order.side) {
                    return OrderState::from_order(order, OrderStatus::Rejected, now);
                }
                let state = OrderState::from_order(order, OrderStatus::Open, now);
                self.open_orders.insert(order.id.clone(), state.clone());
                *self.open_symbols.entry(order.symbol.clone()).or_insert(0) += 1;
                state
            })
            .collect()
    }

    /// `amend(partials)`: mutates matched ids in place; if the new
    /// `remainingQuantity` would go negative, cancels and removes instead.
    /// Returns only the ids that matched an open order.
    pub fn amend(&mut self, partials: &[PartialOrder], now: DateTime<Utc>) -> Vec<OrderState> {
        let mut out = Vec::new();
        for partial in partials {
            let Some(order) = self.open_orders.get_mut(&partial.id) else {
                continue;
            };
            if let Some(price) = partial.price {
                order.price = Some(price);
            }
            if let Some(stop_price) = partial.stop_price {
                order.stop_price = Some(stop_price);
            }
            if let Some(quantity) = partial.quantity {
                order.quantity = quantity;
            }
            order.remaining_quantity = order.quantity - order.filled_quantity;
            order.modified = now;
            if order.remaining_quantity < 0.0 {
                order.status = OrderStatus::Cancelled;
                order.remaining_quantity = 0.0;
                let removed = self.open_orders.shift_remove(&partial.id).unwrap();
                decrement(&mut self.open_symbols, &removed.symbol);
                out.push(removed);
            } else {
                out.push(order.clone());
            }
        }
        out
    }

    /// `cancel(ids)`: cancels and removes each matched open order.
    pub fn cancel(&mut self, ids: &[String], now: DateTime<Utc>) -> Vec<OrderState> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(mut order) = self.open_orders.shift_remove(id) {
                order.status = OrderStatus::Cancelled;
                order.modified = now;
                decrement(&mut self.open_symbols, &order.symbol);
                out.push(order);
            }
        }
        out
    }

    /// `cancelAll()`: cancels every open order and clears both maps.
    pub fn cancel_all(&mut self, now: DateTime<Utc>) -> Vec<OrderState> {
        let out: Vec<OrderState> = self.open_orders.drain(..).map(|(_, mut o)| {
            o.status = OrderStatus::Cancelled;
            o.modified = now;
            o
        }).collect();
        self.open_symbols.clear();
        out
    }

    /// `processOpenOrders(batch)`: runs the full matching pass (spec
    /// §4.3). `rows_by_symbol` must be built by iterating the batch in the
    /// order its rows appear, so that symbol-to-symbol ordering in the
    /// output is itself deterministic.
    pub fn process_open_orders(
        &mut self,
        rows_by_symbol: &IndexMap<String, MarketRow>,
        now: DateTime<Utc>,
    ) -> MatchOutcome {
        run_matching_pass(
            &mut self.open_orders,
            &mut self.open_symbols,
            &mut self.position,
            &self.config,
            rows_by_symbol,
            now,
            &mut self.fill_seq,
        )
    }

    /// Applies commission directly to the position (used for the "close"
    /// side of `apply_fill_to_position`, and exercised directly by tests
    /// checking invariant 4 of spec §8).
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let total_refcount: usize = self.open_symbols.values().sum();
        assert_eq!(total_refcount, self.open_orders.len());
        for order in self.open_orders.values() {
            assert!(matches!(order.status, OrderStatus::Open | OrderStatus::Partial));
            assert!((order.filled_quantity + order.remaining_quantity - order.quantity).abs() < 1e-9);
        }
        for lots in self.position.long.values().chain(self.position.short.values()) {
            for lot in lots {
                assert!(lot.quantity > 0.0);
            }
        }
    }
}

fn decrement(open_symbols: &mut IndexMap<String, usize>, symbol: &str) {
    if let Some(count) = open_symbols.get_mut(symbol) {
        *count -= 1;
        if *count == 0 {
            open_symbols.shift_remove(symbol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::config::{CommissionConfig, SlippageConfig, VolumeSlippageConfig};
    use crate::broker::order::{Effect, OrderType, PartialOrder, Side};
    use chrono::TimeZone;
    use indexmap::indexmap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn order(id: &str, side: Side, effect: Effect, order_type: OrderType, qty: f64, price: Option<f64>) -> Order {
        Order {
            id: id.to_string(),
            symbol: "X".to_string(),
            side,
            effect,
            order_type,
            quantity: qty,
            price,
            stop_price: None,
        }
    }

    // S1 — MARKET BUY, fully filled.
    #[test]
    fn market_buy_fully_filled() {
        let mut broker = Broker::new(BacktestConfig {
            initial_cash: 10_000.0,
            risk_free: 0.0,
            commission: CommissionConfig::default(),
            slippage: SlippageConfig::default(),
        });
        broker.submit(
            &[order("o1", Side::Buy, Effect::OpenLong, OrderType::Market, 10.0, None)],
            now(),
        );
        let rows = indexmap! { "X".to_string() => MarketRow::Quote { price: 100.0, bid: None, ask: None, volume: None } };
        let outcome = broker.process_open_orders(&rows, now());
        assert_eq!(outcome.updated.len(), 1);
        assert_eq!(outcome.updated[0].status, OrderStatus::Filled);
        assert_eq!(outcome.updated[0].filled_quantity, 10.0);
        assert_eq!(outcome.filled[0].price, 100.0);
        assert_eq!(outcome.filled[0].commission, 0.0);
        assert_eq!(broker.position().cash, 9_000.0);
        assert_eq!(broker.position().long["X"][0].quantity, 10.0);
        broker.check_invariants();
    }

    // S2 — LIMIT not triggered.
    #[test]
    fn limit_not_triggered_stays_open() {
        let mut broker = Broker::new(BacktestConfig {
            initial_cash: 10_000.0,
            risk_free: 0.0,
            commission: CommissionConfig::default(),
            slippage: SlippageConfig::default(),
        });
        broker.submit(
            &[order("o2", Side::Buy, Effect::OpenLong, OrderType::Limit, 5.0, Some(99.0))],
            now(),
        );
        let rows = indexmap! { "X".to_string() => MarketRow::Quote { price: 100.0, bid: None, ask: Some(100.0), volume: None } };
        let outcome = broker.process_open_orders(&rows, now());
        assert!(outcome.filled.is_empty());
        assert_eq!(broker.open_orders()[0].status, OrderStatus::Open);
        broker.check_invariants();
    }

    // S3 — partial fill with volume cap.
    #[test]
    fn partial_fill_respects_volume_cap() {
        let mut broker = Broker::new(BacktestConfig {
            initial_cash: 1_000_000.0,
            risk_free: 0.0,
            commission: CommissionConfig::default(),
            slippage: SlippageConfig {
                price: Default::default(),
                volume: VolumeSlippageConfig {
                    max_participation: Some(0.1),
                    allow_partial_fills: true,
                },
            },
        });
        broker.submit(
            &[order("o3", Side::Buy, Effect::OpenLong, OrderType::Market, 1000.0, None)],
            now(),
        );
        let rows = indexmap! { "X".to_string() => MarketRow::Quote { price: 50.0, bid: None, ask: None, volume: Some(5000.0) } };
        let outcome = broker.process_open_orders(&rows, now());
        assert_eq!(outcome.filled[0].quantity, 500.0);
        let state = &broker.open_orders()[0];
        assert_eq!(state.status, OrderStatus::Partial);
        assert_eq!(state.remaining_quantity, 500.0);
        broker.check_invariants();
    }

    // S4 — duplicate id rejection.
    #[test]
    fn duplicate_id_is_rejected_without_mutating_state() {
        let mut broker = Broker::new(BacktestConfig {
            initial_cash: 10_000.0,
            risk_free: 0.0,
            commission: CommissionConfig::default(),
            slippage: SlippageConfig::default(),
        });
        let states = broker.submit(
            &[
                order("o4", Side::Buy, Effect::OpenLong, OrderType::Limit, 1.0, Some(100.0)),
                order("o4", Side::Buy, Effect::OpenLong, OrderType::Limit, 1.0, Some(100.0)),
            ],
            now(),
        );
        assert_eq!(states[0].status, OrderStatus::Open);
        assert_eq!(states[1].status, OrderStatus::Rejected);
        assert_eq!(broker.open_orders().len(), 1);
        broker.check_invariants();
    }

    #[test]
    fn invalid_side_effect_combination_is_rejected() {
        let mut broker = Broker::new(BacktestConfig {
            initial_cash: 10_000.0,
            risk_free: 0.0,
            commission: CommissionConfig::default(),
            slippage: SlippageConfig::default(),
        });
        let states = broker.submit(
            &[order("bad", Side::Buy, Effect::CloseLong, OrderType::Market, 1.0, None)],
            now(),
        );
        assert_eq!(states[0].status, OrderStatus::Rejected);
        assert!(broker.open_orders().is_empty());
    }

    #[test]
    fn open_orders_preserve_submit_order_under_interleaved_cancel_amend() {
        let mut broker = Broker::new(BacktestConfig {
            initial_cash: 10_000.0,
            risk_free: 0.0,
            commission: CommissionConfig::default(),
            slippage: SlippageConfig::default(),
        });
        broker.submit(
            &[
                order("a", Side::Buy, Effect::OpenLong, OrderType::Limit, 1.0, Some(90.0)),
                order("b", Side::Buy, Effect::OpenLong, OrderType::Limit, 1.0, Some(91.0)),
                order("c", Side::Buy, Effect::OpenLong, OrderType::Limit, 1.0, Some(92.0)),
            ],
            now(),
        );
        broker.cancel(&["b".to_string()], now());
        broker.amend(
            &[PartialOrder { id: "a".to_string(), price: Some(89.0), stop_price: None, quantity: None }],
            now(),
        );
        broker.submit(
            &[order("d", Side::Buy, Effect::OpenLong, OrderType::Limit, 1.0, Some(93.0))],
            now(),
        );
        let ids: Vec<String> = broker.open_orders().iter().map(|o| o.id.clone()).collect();
        assert_eq!(ids, vec!["a".to_string(), "c".to_string(), "d".to_string()]);
    }

    #[test]
    fn stop_buy_converts_to_market_on_trigger() {
        let mut broker = Broker::new(BacktestConfig {
            initial_cash: 10_000.0,
            risk_free: 0.0,
            commission: CommissionConfig::default(),
            slippage: SlippageConfig::default(),
        });
        broker.submit(
            &[Order {
                id: "s1".to_string(),
                symbol: "X".to_string(),
                side: Side::Buy,
                effect: Effect::OpenLong,
                order_type: OrderType::Stop,
                quantity: 1.0,
                price: None,
                stop_price: Some(100.0),
            }],
            now(),
        );
        let rows = indexmap! { "X".to_string() => MarketRow::Quote { price: 101.0, bid: None, ask: None, volume: None } };
        let outcome = broker.process_open_orders(&rows, now());
        // One event for the conversion, one for the resulting fill.
        assert_eq!(outcome.updated.len(), 2);
        assert_eq!(outcome.filled.len(), 1);
    }
}
