//! The metrics engine (component D, spec §4.5): online running
//! Sharpe/Sortino/drawdown/win-rate/PnL estimators, updated on every
//! fill/tick and reported in three flavors (`PERIODIC`, `TRADE`,
//! `ENDOFDAY`). Each `ClientSession` owns three independent `Metrics`
//! instances so that, e.g., resetting the EOD instance at day rollover
//! never disturbs the periodic or trade running totals.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::broker::position::Position;

#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportType {
    Periodic,
    Trade,
    Endofday,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub report_type: ReportType,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub total_return: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub win_rate: f64,
    pub avg_gain_loss_ratio: f64,
    pub expectancy: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub max_drawdown_duration: i64,
}

/// Online running estimators shared by all three report flavors. Each field
/// is updated incrementally so that `report()` is O(1) and idempotent
/// (spec §8, invariant 9: calling `report` twice without an intervening
/// `update` returns identical output).
#[derive(Clone, Debug)]
pub struct Metrics {
    risk_free: f64,
    initial_equity: f64,
    prev_equity: Option<f64>,

    return_count: u64,
    return_mean: f64,
    return_m2: f64,
    downside_count: u64,
    downside_mean: f64,
    downside_m2: f64,

    peak_equity: f64,
    max_drawdown: f64,
    drawdown_start: Option<DateTime<Utc>>,
    max_drawdown_duration: i64,

    wins: u64,
    losses: u64,
    gain_sum: f64,
    loss_sum: f64,

    last_equity: f64,
    last_ts: Option<DateTime<Utc>>,
}

impl Metrics {
    pub fn new(risk_free: f64, initial_equity: f64) -> Self {
        Self {
            risk_free,
            initial_equity,
            prev_equity: None,
            return_count: 0,
            return_mean: 0.0,
            return_m2: 0.0,
            downside_count: 0,
            downside_mean: 0.0,
            downside_m2: 0.0,
            peak_equity: initial_equity,
            max_drawdown: 0.0,
            drawdown_start: None,
            max_drawdown_duration: 0,
            wins: 0,
            losses: 0,
            gain_sum: 0.0,
            loss_sum: 0.0,
            last_equity: initial_equity,
            last_ts: None,
        }
    }

    /// Marks-to-market, computes the period return, and feeds it to the
    /// running estimators (spec §4.5).
    pub fn update(&mut self, position: &Position, snapshot: &IndexMap<String, f64>, ts: DateTime<Utc>) {
        let equity = position.equity(snapshot);
        if let Some(prev) = self.prev_equity {
            if prev.abs() > 1e-12 {
                let ret = (equity - prev) / prev;
                self.push_return(ret);
                if ret > 0.0 {
                    self.wins += 1;
                    self.gain_sum += ret;
                } else if ret < 0.0 {
                    self.losses += 1;
                    self.loss_sum += -ret;
                }
            }
        }
        if equity > self.peak_equity {
            self.peak_equity = equity;
            self.drawdown_start = None;
        } else if equity < self.peak_equity {
            let drawdown = (self.peak_equity - equity) / self.peak_equity;
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
            let start = *self.drawdown_start.get_or_insert(ts);
            let duration = (ts - start).num_seconds();
            if duration > self.max_drawdown_duration {
                self.max_drawdown_duration = duration;
            }
        }
        self.prev_equity = Some(equity);
        self.last_equity = equity;
        self.last_ts = Some(ts);
    }

    fn push_return(&mut self, ret: f64) {
        self.return_count += 1;
        let delta = ret - self.return_mean;
        self.return_mean += delta / self.return_count as f64;
        let delta2 = ret - self.return_mean;
        self.return_m2 += delta * delta2;

        if ret < 0.0 {
            self.downside_count += 1;
            let d = ret - self.downside_mean;
            self.downside_mean += d / self.downside_count as f64;
            let d2 = ret - self.downside_mean;
            self.downside_m2 += d * d2;
        }
    }

    fn return_std(&self) -> f64 {
        if self.return_count < 2 {
            0.0
        } else {
            (self.return_m2 / (self.return_count as f64 - 1.0)).sqrt()
        }
    }

    fn downside_std(&self) -> f64 {
        if self.downside_count < 2 {
            0.0
        } else {
            (self.downside_m2 / (self.downside_count as f64 - 1.0)).sqrt()
        }
    }

    fn sharpe(&self) -> f64 {
        let std = self.return_std();
        if std <= 1e-12 {
            0.0
        } else {
            (self.return_mean - self.risk_free) / std
        }
    }

    fn sortino(&self) -> f64 {
        let std = self.downside_std();
        if std <= 1e-12 {
            0.0
        } else {
            (self.return_mean - self.risk_free) / std
        }
    }

    fn win_rate(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            0.0
        } else {
            self.wins as f64 / total as f64
        }
    }

    fn avg_gain_loss_ratio(&self) -> f64 {
        if self.losses == 0 || self.loss_sum <= 1e-12 {
            0.0
        } else {
            let avg_gain = if self.wins > 0 { self.gain_sum / self.wins as f64 } else { 0.0 };
            let avg_loss = self.loss_sum / self.losses as f64;
            avg_gain / avg_loss
        }
    }

    fn expectancy(&self) -> f64 {
        self.win_rate() * self.avg_gain_loss_ratio() - (1.0 - self.win_rate())
    }

    fn profit_factor(&self) -> f64 {
        if self.loss_sum <= 1e-12 {
            0.0
        } else {
            self.gain_sum / self.loss_sum
        }
    }

    /// Produces a report snapshot; pure, does not mutate any running state,
    /// so repeated calls are idempotent (spec §8 invariant 9).
    pub fn report(&self, report_type: ReportType, ts: DateTime<Utc>) -> MetricsReport {
        MetricsReport {
            report_type,
            timestamp: ts,
            equity: self.last_equity,
            total_return: if self.initial_equity.abs() > 1e-12 {
                (self.last_equity - self.initial_equity) / self.initial_equity
            } else {
                0.0
            },
            sharpe: self.sharpe(),
            sortino: self.sortino(),
            win_rate: self.win_rate(),
            avg_gain_loss_ratio: self.avg_gain_loss_ratio(),
            expectancy: self.expectancy(),
            profit_factor: self.profit_factor(),
            max_drawdown: self.max_drawdown,
            max_drawdown_duration: self.max_drawdown_duration,
        }
    }

    /// Resets running state for a new accounting period, keeping
    /// `risk_free` and re-basing `initial_equity` to the current equity —
    /// used when the EOD instance rolls over to a new day.
    pub fn reset(&mut self) {
        let carry_equity = self.last_equity;
        *self = Metrics::new(self.risk_free, carry_equity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn report_is_idempotent_without_intervening_update() {
        let mut metrics = Metrics::new(0.0, 1000.0);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let position = Position::new(1000.0);
        let snapshot = IndexMap::new();
        metrics.update(&position, &snapshot, ts);
        let r1 = metrics.report(ReportType::Periodic, ts);
        let r2 = metrics.report(ReportType::Periodic, ts);
        assert_eq!(r1.equity, r2.equity);
        assert_eq!(r1.sharpe, r2.sharpe);
        assert_eq!(r1.max_drawdown, r2.max_drawdown);
    }

    #[test]
    fn drawdown_tracks_peak_to_trough() {
        let mut metrics = Metrics::new(0.0, 100.0);
        let mut snapshot = IndexMap::new();
        snapshot.insert("X".to_string(), 1.0);
        let mut position = Position::new(100.0);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        metrics.update(&position, &snapshot, t0);
        position.cash = 80.0;
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        metrics.update(&position, &snapshot, t1);
        let report = metrics.report(ReportType::Periodic, t1);
        assert!((report.max_drawdown - 0.2).abs() < 1e-9);
    }
}
