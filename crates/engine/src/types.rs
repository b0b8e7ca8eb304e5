//! Types for the backtesting engine

use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::regime::Regime;

/// A single daily bar (OHLCV) as delivered by a data provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

impl Kline {
    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Signal,
    EndOfData,
}

/// One closed round-trip position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub entry_time: i64,
    pub exit_time: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub shares: f64,
    /// Bars held, measured on the reference timeline
    pub holding_period: usize,
    pub pnl: f64,
    pub exit_reason: ExitReason,
}

/// A point on the equity curve
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: i64,
    pub equity: f64,
}

/// Returns attributed to one market regime during a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeStats {
    pub cumulative_return: f64,
    pub sharpe: f64,
    pub days: usize,
}

/// Result of a backtest run. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    /// `f64::INFINITY` with profits and no losses; stored as `null` in JSON
    #[serde(with = "unbounded")]
    pub profit_factor: f64,
    pub total_trades: u32,
    pub avg_holding_period: f64,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub equity_curve: Vec<EquityPoint>,
    pub daily_returns: Vec<f64>,
    pub regime_returns: BTreeMap<Regime, RegimeStats>,
    /// Regime detected on the last simulated bar
    pub final_regime: Regime,
    pub trades: Vec<Trade>,
}

impl BacktestResult {
    /// Sentinel for data-starved runs: heavily penalized by fitness, never an error.
    pub fn empty(initial_capital: f64) -> Self {
        Self {
            total_return: -1.0,
            sharpe_ratio: -10.0,
            sortino_ratio: -10.0,
            calmar_ratio: -10.0,
            max_drawdown: 1.0,
            win_rate: 0.0,
            profit_factor: 0.0,
            total_trades: 0,
            avg_holding_period: 0.0,
            initial_capital,
            final_equity: 0.0,
            equity_curve: Vec::new(),
            daily_returns: Vec::new(),
            regime_returns: BTreeMap::new(),
            final_regime: Regime::Unknown,
            trades: Vec::new(),
        }
    }

    pub fn is_empty_sentinel(&self) -> bool {
        self.equity_curve.is_empty() && self.total_trades == 0 && self.total_return == -1.0
    }
}

/// JSON has no infinity; map it to `null` and back.
mod unbounded {
    use super::*;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}
