//! Bar-by-bar portfolio backtesting engine
//!
//! Replays the reference symbol's timeline across the whole universe. Each
//! bar runs regime detection, the exit pass, the entry pass, then marks
//! equity. All inputs are borrowed read-only, so a run is a pure function
//! of `(market, genes, settings)`.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::BacktestSettings;
use crate::error::{EngineError, EngineResult};
use crate::indicators::at;
use crate::market::MarketData;
use crate::params::{Genes, ParamId};
use crate::regime::Regime;
use crate::signals::{self, IndicatorSet};
use crate::types::*;

const TRADING_DAYS: f64 = 252.0;
const MS_PER_YEAR: f64 = 365.25 * 86_400_000.0;

/// Position state during simulation
struct OpenPosition {
    symbol: usize,
    entry_idx: usize,
    entry_time: i64,
    entry_price: f64,
    shares: f64,
    stop: f64,
    target: f64,
}

/// Backtesting engine that simulates a multi-symbol portfolio
pub struct BacktestEngine;

impl BacktestEngine {
    pub fn run(
        market: &MarketData,
        genes: &Genes,
        settings: &BacktestSettings,
    ) -> EngineResult<BacktestResult> {
        let capital = settings.initial_capital;
        let Some(reference) = market.reference() else {
            return Ok(BacktestResult::empty(capital));
        };
        if reference.len() < settings.min_reference_bars.max(1) {
            return Ok(BacktestResult::empty(capital));
        }

        let last = reference.len() - 1;
        let start = settings.start_index.unwrap_or(settings.warmup_bars);
        let end = settings.end_index.unwrap_or(last).min(last);
        if start > end {
            return Ok(BacktestResult::empty(capital));
        }

        let symbols = market.symbols();
        let indicators = symbols
            .iter()
            .map(|s| IndicatorSet::compute(s, genes))
            .collect::<EngineResult<Vec<_>>>()?;

        let max_positions = genes.period(ParamId::MaxPositions);
        let max_position_pct = genes[ParamId::MaxPositionPct];
        let buy_threshold = genes[ParamId::BuyThreshold];
        let sell_threshold = genes[ParamId::SellThreshold];
        let confidence_min = genes[ParamId::ConfidenceMin];
        let stop_mult = genes[ParamId::AtrMultStop];
        let target_mult = genes[ParamId::AtrMultTarget];

        let mut cash = capital;
        let mut positions: Vec<OpenPosition> = Vec::new();
        let mut last_close: Vec<Option<f64>> = vec![None; symbols.len()];
        let mut trades: Vec<Trade> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(end - start + 1);
        let mut daily_returns: Vec<f64> = Vec::with_capacity(end - start + 1);
        let mut regime_buckets: BTreeMap<Regime, Vec<f64>> = BTreeMap::new();
        let mut prev_equity = capital;
        let mut regime = Regime::Unknown;

        for t in start..=end {
            let time = reference.times[t];
            regime = settings.regime.classify(&reference.close, t);

            for (s, slot) in last_close.iter_mut().enumerate() {
                if let Some(i) = market.local_index(s, t) {
                    *slot = Some(symbols[s].close[i]);
                }
            }

            // Exit pass: stop, then target, then signal reversal
            let mut still_open = Vec::with_capacity(positions.len());
            for pos in positions.drain(..) {
                let series = &symbols[pos.symbol];
                let Some(i) = market.local_index(pos.symbol, t) else {
                    still_open.push(pos);
                    continue;
                };

                let exit = check_bounds(pos.stop, pos.target, series.high[i], series.low[i])
                    .or_else(|| {
                        let signal = signals::generate(series, &indicators[pos.symbol], genes, i);
                        (signal.score <= sell_threshold && signal != signals::Signal::NEUTRAL)
                            .then_some((series.close[i], ExitReason::Signal))
                    });

                match exit {
                    Some((price, reason)) => {
                        cash += pos.shares * price;
                        trades.push(close_trade(&pos, &series.symbol, t, time, price, reason));
                    }
                    None => still_open.push(pos),
                }
            }
            positions = still_open;

            // Entry pass
            if positions.len() < max_positions {
                let mut candidates: Vec<(usize, usize, f64)> = Vec::new();
                for (s, series) in symbols.iter().enumerate() {
                    if positions.iter().any(|p| p.symbol == s) {
                        continue;
                    }
                    let Some(i) = market.local_index(s, t) else {
                        continue;
                    };
                    let signal = signals::generate(series, &indicators[s], genes, i);
                    if signal.score > buy_threshold && signal.confidence >= confidence_min {
                        candidates.push((s, i, signal.score));
                    }
                }
                candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

                let slots = max_positions - positions.len();
                for (s, i, _) in candidates.into_iter().take(slots) {
                    let series = &symbols[s];
                    let price = series.close[i];
                    let Some(atr) = at(&indicators[s].atr, i) else {
                        continue;
                    };
                    let equity = mark_to_market(cash, &positions, &last_close);
                    let shares = (equity * max_position_pct / price).floor();
                    let cost = shares * price;
                    if shares <= 0.0 || cost > cash {
                        continue;
                    }

                    cash -= cost;
                    positions.push(OpenPosition {
                        symbol: s,
                        entry_idx: t,
                        entry_time: time,
                        entry_price: price,
                        shares,
                        stop: price - atr * stop_mult,
                        target: price + atr * target_mult,
                    });
                }
            }

            // Mark
            let equity = mark_to_market(cash, &positions, &last_close);
            let ret = if prev_equity > 0.0 {
                equity / prev_equity - 1.0
            } else {
                0.0
            };
            equity_curve.push(EquityPoint { time, equity });
            daily_returns.push(ret);
            regime_buckets.entry(regime).or_default().push(ret);
            prev_equity = equity;
        }

        // Force-close at the last available price
        let end_time = reference.times[end];
        for pos in positions.drain(..) {
            let price = last_close[pos.symbol].unwrap_or(pos.entry_price);
            cash += pos.shares * price;
            let symbol = &symbols[pos.symbol].symbol;
            trades.push(close_trade(&pos, symbol, end, end_time, price, ExitReason::EndOfData));
        }

        if !cash.is_finite() {
            return Err(EngineError::Evaluation(format!(
                "non-finite final equity for {}",
                market.reference_symbol()
            )));
        }

        let result = summarize(
            capital,
            cash,
            equity_curve,
            daily_returns,
            regime_buckets,
            regime,
            trades,
        );

        debug!(
            trades = result.total_trades,
            total_return = result.total_return,
            sharpe = result.sharpe_ratio,
            max_drawdown = result.max_drawdown,
            "Backtest complete"
        );

        Ok(result)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Stop/target check for one bar. The stop wins when both are touched.
pub fn check_bounds(stop: f64, target: f64, high: f64, low: f64) -> Option<(f64, ExitReason)> {
    if low <= stop {
        Some((stop, ExitReason::StopLoss))
    } else if high >= target {
        Some((target, ExitReason::TakeProfit))
    } else {
        None
    }
}

fn mark_to_market(cash: f64, positions: &[OpenPosition], last_close: &[Option<f64>]) -> f64 {
    cash + positions
        .iter()
        .map(|p| p.shares * last_close[p.symbol].unwrap_or(p.entry_price))
        .sum::<f64>()
}

fn close_trade(
    pos: &OpenPosition,
    symbol: &str,
    exit_idx: usize,
    exit_time: i64,
    exit_price: f64,
    exit_reason: ExitReason,
) -> Trade {
    Trade {
        symbol: symbol.to_string(),
        entry_time: pos.entry_time,
        exit_time,
        entry_price: pos.entry_price,
        exit_price,
        shares: pos.shares,
        holding_period: exit_idx - pos.entry_idx,
        pnl: (exit_price - pos.entry_price) * pos.shares,
        exit_reason,
    }
}

// ============================================================================
// Metrics
// ============================================================================

fn summarize(
    initial_capital: f64,
    final_equity: f64,
    equity_curve: Vec<EquityPoint>,
    daily_returns: Vec<f64>,
    regime_buckets: BTreeMap<Regime, Vec<f64>>,
    final_regime: Regime,
    trades: Vec<Trade>,
) -> BacktestResult {
    let total_return = final_equity / initial_capital - 1.0;
    let equities: Vec<f64> = equity_curve.iter().map(|p| p.equity).collect();
    let max_drawdown = max_drawdown(&equities);

    let years = match (equity_curve.first(), equity_curve.last()) {
        (Some(first), Some(last)) if last.time > first.time => {
            (last.time - first.time) as f64 / MS_PER_YEAR
        }
        _ => daily_returns.len() as f64 / TRADING_DAYS,
    };
    let cagr = if years > 0.0 && total_return > -1.0 {
        (1.0 + total_return).powf(1.0 / years) - 1.0
    } else {
        -1.0
    };

    let total_trades = trades.len() as u32;
    let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
    let win_rate = if trades.is_empty() {
        0.0
    } else {
        wins as f64 / trades.len() as f64
    };
    let avg_holding_period = if trades.is_empty() {
        0.0
    } else {
        trades.iter().map(|t| t.holding_period as f64).sum::<f64>() / trades.len() as f64
    };

    let regime_returns = regime_buckets
        .into_iter()
        .map(|(regime, returns)| {
            let cumulative = returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;
            let stats = RegimeStats {
                cumulative_return: cumulative,
                sharpe: sharpe_ratio(&returns),
                days: returns.len(),
            };
            (regime, stats)
        })
        .collect();

    BacktestResult {
        total_return,
        sharpe_ratio: sharpe_ratio(&daily_returns),
        sortino_ratio: sortino_ratio(&daily_returns),
        calmar_ratio: calmar_ratio(cagr, max_drawdown),
        max_drawdown,
        win_rate,
        profit_factor: profit_factor(&trades),
        total_trades,
        avg_holding_period,
        initial_capital,
        final_equity,
        equity_curve,
        daily_returns,
        regime_returns,
        final_regime,
        trades,
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Largest `(running_peak - equity) / running_peak` over the curve.
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst: f64 = 0.0;
    for &e in equity {
        peak = peak.max(e);
        if peak > 0.0 {
            worst = worst.max((peak - e) / peak);
        }
    }
    worst
}

/// Annualized: `(mean · 252) / (std · √252)`, 0 for a flat series.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let (mean, std) = mean_std(returns);
    if std <= f64::EPSILON {
        return 0.0;
    }
    (mean * TRADING_DAYS) / (std * TRADING_DAYS.sqrt())
}

/// Sharpe with only the negative returns' std-dev in the denominator.
pub fn sortino_ratio(returns: &[f64]) -> f64 {
    let negatives: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if negatives.len() < 2 {
        return 0.0;
    }
    let (mean, _) = mean_std(returns);
    let (_, downside) = mean_std(&negatives);
    if downside <= f64::EPSILON {
        return 0.0;
    }
    (mean * TRADING_DAYS) / (downside * TRADING_DAYS.sqrt())
}

/// CAGR / max drawdown, 0 when the curve never drew down.
pub fn calmar_ratio(cagr: f64, max_drawdown: f64) -> f64 {
    if max_drawdown > 0.0 {
        cagr / max_drawdown
    } else {
        0.0
    }
}

/// Gross profit / |gross loss|; infinite with profits and no losses.
pub fn profit_factor(trades: &[Trade]) -> f64 {
    let gross_profit: f64 = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.pnl < 0.0)
        .map(|t| t.pnl.abs())
        .sum();
    if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}
