//! `BacktestConfig` (spec §6): the per-client parameters that shape a
//! `Broker`'s commission and slippage behavior, negotiated at `login`.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionConfig {
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub per_trade: f64,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

impl CommissionConfig {
    /// `comm = rate·notional + perTrade`, clamped to `[minimum, maximum]`
    /// when configured (spec §4.3 step 5).
    pub fn commission(&self, notional: f64) -> f64 {
        let mut comm = self.rate * notional + self.per_trade;
        if let Some(min) = self.minimum {
            comm = comm.max(min);
        }
        if let Some(max) = self.maximum {
            comm = comm.min(max);
        }
        comm
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSlippageConfig {
    #[serde(default)]
    pub fixed: f64,
    #[serde(default)]
    pub market_impact: f64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSlippageConfig {
    pub max_participation: Option<f64>,
    #[serde(default)]
    pub allow_partial_fills: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SlippageConfig {
    #[serde(default)]
    pub price: PriceSlippageConfig,
    #[serde(default)]
    pub volume: VolumeSlippageConfig,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestConfig {
    pub initial_cash: f64,
    #[serde(default)]
    pub risk_free: f64,
    #[serde(default)]
    pub commission: CommissionConfig,
    #[serde(default)]
    pub slippage: SlippageConfig,
}
