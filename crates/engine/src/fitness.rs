//! Fitness function: a pure scalar score over a BacktestResult. Higher is better.

use crate::types::BacktestResult;

/// Fewer closed trades than this is statistically meaningless.
pub const MIN_TRADES: u32 = 20;
/// Drawdown beyond this is catastrophic regardless of returns.
pub const MAX_DRAWDOWN: f64 = 0.35;
/// Assigned when an evaluation fails outright.
pub const FAILED_FITNESS: f64 = -10_000.0;

pub fn fitness(result: &BacktestResult) -> f64 {
    if result.total_trades < MIN_TRADES {
        return -1000.0 + result.total_trades as f64;
    }
    if result.max_drawdown > MAX_DRAWDOWN {
        return -500.0 * result.max_drawdown;
    }

    let score = result.sharpe_ratio * 25.0
        + result.sortino_ratio * 15.0
        + result.calmar_ratio * 20.0
        + result.win_rate * 15.0
        + result.total_return * 15.0
        + (1.0 - result.max_drawdown) * 10.0
        + result.profit_factor.min(3.0) * 10.0
        + (result.total_trades as f64 / 300.0).min(1.0) * 5.0;

    if score.is_finite() {
        score
    } else {
        FAILED_FITNESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(trades: u32, dd: f64) -> BacktestResult {
        let mut r = BacktestResult::empty(10_000.0);
        r.total_trades = trades;
        r.max_drawdown = dd;
        r.total_return = 0.25;
        r.sharpe_ratio = 1.5;
        r.sortino_ratio = 2.0;
        r.calmar_ratio = 1.2;
        r.win_rate = 0.55;
        r.profit_factor = 1.8;
        r
    }

    #[test]
    fn test_trade_floor() {
        for trades in 0..MIN_TRADES {
            let mut r = result_with(trades, 0.05);
            r.sharpe_ratio = 50.0;
            let f = fitness(&r);
            assert!(f < -979.0);
            assert_eq!(f, -1000.0 + trades as f64);
        }
    }

    #[test]
    fn test_sentinel_is_heavily_penalized() {
        assert_eq!(fitness(&BacktestResult::empty(10_000.0)), -1000.0);
    }

    #[test]
    fn test_drawdown_ceiling() {
        let f = fitness(&result_with(100, 0.5));
        assert_eq!(f, -250.0);
    }

    #[test]
    fn test_weighted_combination() {
        let r = result_with(150, 0.1);
        let expected = 1.5 * 25.0
            + 2.0 * 15.0
            + 1.2 * 20.0
            + 0.55 * 15.0
            + 0.25 * 15.0
            + 0.9 * 10.0
            + 1.8 * 10.0
            + 0.5 * 5.0;
        assert!((fitness(&r) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_profit_factor_is_capped() {
        let mut r = result_with(300, 0.1);
        r.profit_factor = f64::INFINITY;
        let capped = fitness(&r);
        r.profit_factor = 3.0;
        assert_eq!(capped, fitness(&r));
    }
}
