//! Position accounting (spec §3): FIFO long/short lots per symbol, realised
//! PnL, and cumulative commission. Closing fills always consume from the
//! head of the opposite-side lot queue.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One FIFO lot. `total_cost` is the teacher-style name for the cumulative
/// basis of the lot: cash paid for a long lot, cash received for a short lot
/// (spec §3's `totalCost`/`totalProceeds` are mirror images of the same
/// number, so one field carries both meanings depending on which map it's
/// found in).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lot {
    pub quantity: f64,
    pub price: f64,
    pub total_cost: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub cash: f64,
    pub long: IndexMap<String, VecDeque<Lot>>,
    pub short: IndexMap<String, VecDeque<Lot>>,
    pub total_commission: f64,
    #[serde(rename = "realisedPnL")]
    pub realised_pnl: f64,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub modified: Option<DateTime<Utc>>,
}

impl Position {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            cash: initial_cash,
            ..Default::default()
        }
    }

    /// Appends a new long lot (`OpenLong`).
    pub fn open_long(&mut self, symbol: &str, quantity: f64, price: f64, now: DateTime<Utc>) {
        self.long
            .entry(symbol.to_string())
            .or_default()
            .push_back(Lot {
                quantity,
                price,
                total_cost: quantity * price,
            });
        self.modified = Some(now);
    }

    /// Appends a new short lot (`OpenShort`).
    pub fn open_short(&mut self, symbol: &str, quantity: f64, price: f64, now: DateTime<Utc>) {
        self.short
            .entry(symbol.to_string())
            .or_default()
            .push_back(Lot {
                quantity,
                price,
                total_cost: quantity * price,
            });
        self.modified = Some(now);
    }

    /// Consumes `quantity` from the head of the long queue for `symbol` at
    /// `exit_price`, crediting realised PnL. Returns the realised PnL from
    /// this close.
    pub fn close_long(&mut self, symbol: &str, quantity: f64, exit_price: f64, now: DateTime<Utc>) -> f64 {
        let mut remaining = quantity;
        let mut pnl = 0.0;
        if let Some(lots) = self.long.get_mut(symbol) {
            while remaining > 1e-12 {
                let Some(front) = lots.front_mut() else { break };
                let take = remaining.min(front.quantity);
                pnl += (exit_price - front.price) * take;
                front.quantity -= take;
                front.total_cost = front.quantity * front.price;
                remaining -= take;
                if front.quantity <= 1e-12 {
                    lots.pop_front();
                }
            }
            if lots.is_empty() {
                self.long.shift_remove(symbol);
            }
        }
        self.realised_pnl += pnl;
        self.modified = Some(now);
        pnl
    }

    /// Consumes `quantity` from the head of the short queue for `symbol` at
    /// `exit_price`, crediting realised PnL.
    pub fn close_short(&mut self, symbol: &str, quantity: f64, exit_price: f64, now: DateTime<Utc>) -> f64 {
        let mut remaining = quantity;
        let mut pnl = 0.0;
        if let Some(lots) = self.short.get_mut(symbol) {
            while remaining > 1e-12 {
                let Some(front) = lots.front_mut() else { break };
                let take = remaining.min(front.quantity);
                pnl += (front.price - exit_price) * take;
                front.quantity -= take;
                front.total_cost = front.quantity * front.price;
                remaining -= take;
                if front.quantity <= 1e-12 {
                    lots.pop_front();
                }
            }
            if lots.is_empty() {
                self.short.shift_remove(symbol);
            }
        }
        self.realised_pnl += pnl;
        self.modified = Some(now);
        pnl
    }

    /// Marks-to-market `equity = cash + Σ long − Σ short`, valued at the
    /// given snapshot prices. Symbols with no snapshot price yet contribute
    /// nothing (they have not been observed in the replay).
    pub fn equity(&self, snapshot: &IndexMap<String, f64>) -> f64 {
        let mut equity = self.cash;
        for (symbol, lots) in &self.long {
            if let Some(price) = snapshot.get(symbol) {
                let qty: f64 = lots.iter().map(|l| l.quantity).sum();
                equity += qty * price;
            }
        }
        for (symbol, lots) in &self.short {
            if let Some(price) = snapshot.get(symbol) {
                let qty: f64 = lots.iter().map(|l| l.quantity).sum();
                equity -= qty * price;
            }
        }
        equity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_close_consumes_oldest_lot_first() {
        let mut pos = Position::new(0.0);
        let now = Utc::now();
        pos.open_long("X", 10.0, 100.0, now);
        pos.open_long("X", 10.0, 110.0, now);
        let pnl = pos.close_long("X", 12.0, 120.0, now);
        // 10 @ 100 fully closed (+20*10=200), 2 @ 110 closed (+10*2=20)
        assert_eq!(pnl, 220.0);
        let remaining = &pos.long["X"];
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].quantity, 8.0);
    }

    #[test]
    fn empty_lots_are_removed() {
        let mut pos = Position::new(0.0);
        let now = Utc::now();
        pos.open_long("X", 5.0, 100.0, now);
        pos.close_long("X", 5.0, 100.0, now);
        assert!(!pos.long.contains_key("X"));
    }

    #[test]
    fn partial_close_rescales_total_cost() {
        let mut pos = Position::new(0.0);
        let now = Utc::now();
        pos.open_long("X", 10.0, 100.0, now);
        pos.close_long("X", 4.0, 120.0, now);
        let remaining = &pos.long["X"][0];
        assert_eq!(remaining.quantity, 6.0);
        assert_eq!(remaining.total_cost, 600.0);
    }
}
