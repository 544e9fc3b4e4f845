//! The matching pass (spec §4.3): stop conversion, fill determination,
//! volume-slippage quantity shaping, price-slippage adjustment, commission,
//! and position application. Executed once per replay batch by
//! [`super::Broker::process_open_orders`].
//!
//! The pass is order-deterministic: callers must iterate `openOrders` via an
//! insertion-ordered map (`IndexMap`) and build the symbol lookup from the
//! batch in the order rows appear there — this module never reads from a
//! `HashMap` for anything whose iteration order is observable in the
//! output.
//!
//! The tick/bar stop-trigger asymmetry (strict `price` comparison on tick,
//! `high`/`low` on bar) is intentional, not a bug (spec §9 Open Questions).

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::broker::config::BacktestConfig;
use crate::broker::order::{Effect, Fill, OrderState, OrderStatus, OrderType, Side};
use crate::broker::position::Position;
use crate::datasource::MarketRow;

pub struct MatchOutcome {
    pub updated: Vec<OrderState>,
    pub filled: Vec<Fill>,
}

/// Runs the full six-step pass described in spec §4.3 over every open order
/// that has a row in `rows_by_symbol` this batch.
pub fn run_matching_pass(
    open_orders: &mut IndexMap<String, OrderState>,
    open_symbols: &mut IndexMap<String, usize>,
    position: &mut Position,
    config: &BacktestConfig,
    rows_by_symbol: &IndexMap<String, MarketRow>,
    now: DateTime<Utc>,
    fill_seq: &mut u64,
) -> MatchOutcome {
    let mut updated = Vec::new();
    let mut filled = Vec::new();

    // Step 1 — stop conversion. Collect ids first: the conversion mutates
    // `order_type` in place, so there is no aliasing hazard, but we still
    // snapshot the id list up front to keep iteration order pinned to the
    // state at pass entry.
    let ids: Vec<String> = open_orders.keys().cloned().collect();
    for id in &ids {
        let order = open_orders.get_mut(id).unwrap();
        let Some(row) = rows_by_symbol.get(&order.symbol) else {
            continue;
        };
        if !matches!(order.order_type, OrderType::Stop | OrderType::StopLimit) {
            continue;
        }
        let Some(stop_price) = order.stop_price else {
            continue;
        };
        let triggered = match (order.side, row) {
            (Side::Buy, MarketRow::Quote { price, .. }) => *price >= stop_price,
            (Side::Buy, MarketRow::Bar { high, .. }) => *high >= stop_price,
            (Side::Sell, MarketRow::Quote { price, .. }) => *price <= stop_price,
            (Side::Sell, MarketRow::Bar { low, .. }) => *low <= stop_price,
        };
        if !triggered {
            continue;
        }
        order.order_type = match order.order_type {
            OrderType::Stop => OrderType::Market,
            OrderType::StopLimit => OrderType::Limit,
            other => other,
        };
        order.modified = now;
        updated.push(order.clone());
    }

    // Step 2-6 — fill pass, over MARKET/LIMIT orders (including those just
    // converted above), in the same pinned insertion order.
    let mut to_remove = Vec::new();
    for id in &ids {
        let order = open_orders.get(id).unwrap();
        let Some(row) = rows_by_symbol.get(&order.symbol) else {
            continue;
        };
        if !matches!(order.order_type, OrderType::Market | OrderType::Limit) {
            continue;
        }

        let Some((raw_price, bar_volume)) = match_price(order, row) else {
            continue;
        };

        // Step 3 — quantity shaping (volume slippage).
        let remaining = order.remaining_quantity;
        let cap = match (bar_volume, config.slippage.volume.max_participation) {
            (Some(vol), Some(max_participation)) => vol * max_participation,
            _ => f64::INFINITY,
        };
        let fill_qty = if remaining <= cap {
            remaining
        } else if config.slippage.volume.allow_partial_fills {
            cap
        } else {
            0.0
        };
        if fill_qty <= 1e-12 {
            continue;
        }

        // Step 4 — price adjustment (price slippage).
        let mut slip = (config.slippage.price.fixed / 10_000.0) * raw_price;
        if let Some(vol) = bar_volume {
            if vol > 0.0 {
                slip += (fill_qty / vol) * config.slippage.price.market_impact * raw_price;
            }
        }
        let adj_price = match order.side {
            Side::Buy => raw_price + slip,
            Side::Sell => raw_price - slip,
        };

        // Step 5 — commission.
        let notional = adj_price * fill_qty;
        let commission = config.commission.commission(notional);

        // Step 6 — apply.
        *fill_seq += 1;
        let fill = Fill {
            id: format!("f{}", fill_seq),
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price: adj_price,
            quantity: fill_qty,
            commission,
            created: now,
        };

        let order = open_orders.get_mut(id).unwrap();
        order.filled_quantity += fill_qty;
        order.remaining_quantity -= fill_qty;
        order.status = if order.remaining_quantity > 1e-12 {
            OrderStatus::Partial
        } else {
            OrderStatus::Filled
        };
        order.modified = now;

        apply_fill_to_position(position, order, &fill, now);

        if order.status == OrderStatus::Filled {
            to_remove.push(id.clone());
        }
        updated.push(order.clone());
        filled.push(fill);
    }

    for id in to_remove {
        if let Some(order) = open_orders.shift_remove(&id) {
            decrement_symbol(open_symbols, &order.symbol);
        }
    }

    MatchOutcome { updated, filled }
}

/// Returns `(matched_price, bar_volume)` if `order` is triggered against
/// `row`, or `None` if it does not match this batch.
fn match_price(order: &OrderState, row: &MarketRow) -> Option<(f64, Option<f64>)> {
    match row {
        MarketRow::Quote { price, bid, ask, volume, .. } => match (order.order_type, order.side) {
            (OrderType::Market, Side::Buy) => Some((ask.unwrap_or(*price), *volume)),
            (OrderType::Market, Side::Sell) => Some((bid.unwrap_or(*price), *volume)),
            (OrderType::Limit, Side::Buy) => {
                let fill_px = ask.unwrap_or(*price);
                (fill_px <= order.price?).then_some((fill_px, *volume))
            }
            (OrderType::Limit, Side::Sell) => {
                let fill_px = bid.unwrap_or(*price);
                (fill_px >= order.price?).then_some((fill_px, *volume))
            }
            _ => None,
        },
        MarketRow::Bar { open, high, low, volume, .. } => match (order.order_type, order.side) {
            (OrderType::Market, _) => Some((*open, *volume)),
            (OrderType::Limit, Side::Buy) => {
                let limit = order.price?;
                (*low <= limit).then_some((limit.min(*open), *volume))
            }
            (OrderType::Limit, Side::Sell) => {
                let limit = order.price?;
                (*high >= limit).then_some((limit.max(*open), *volume))
            }
            _ => None,
        },
    }
}

fn apply_fill_to_position(position: &mut Position, order: &OrderState, fill: &Fill, now: DateTime<Utc>) {
    position.total_commission += fill.commission;
    position.cash -= fill.commission;
    match order.effect {
        Effect::OpenLong => {
            position.open_long(&order.symbol, fill.quantity, fill.price, now);
            position.cash -= fill.price * fill.quantity;
        }
        Effect::OpenShort => {
            position.open_short(&order.symbol, fill.quantity, fill.price, now);
            position.cash += fill.price * fill.quantity;
        }
        Effect::CloseLong => {
            position.close_long(&order.symbol, fill.quantity, fill.price, now);
            position.cash += fill.price * fill.quantity;
        }
        Effect::CloseShort => {
            position.close_short(&order.symbol, fill.quantity, fill.price, now);
            position.cash -= fill.price * fill.quantity;
        }
    }
}

fn decrement_symbol(open_symbols: &mut IndexMap<String, usize>, symbol: &str) {
    if let Some(count) = open_symbols.get_mut(symbol) {
        *count -= 1;
        if *count == 0 {
            open_symbols.shift_remove(symbol);
        }
    }
}
