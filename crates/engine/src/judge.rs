//! Judge: an independent quality score and overfitting gate
//!
//! The optimizer only accepts a new global best when the verdict is not
//! `Suspicious`.

use serde::{Deserialize, Serialize};

use crate::types::BacktestResult;

const DRAWDOWN_WARNING: f64 = 0.25;
const FEW_TRADES_WARNING: u32 = 30;
const LOW_WIN_RATE_WARNING: f64 = 0.35;
const OVERFIT_SHARPE: f64 = 4.0;
const OVERFIT_WIN_RATE: f64 = 0.85;
const OVERFIT_MIN_TRADES: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Excellent,
    Good,
    Acceptable,
    Poor,
    Suspicious,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Excellent => write!(f, "EXCELLENT"),
            Verdict::Good => write!(f, "GOOD"),
            Verdict::Acceptable => write!(f, "ACCEPTABLE"),
            Verdict::Poor => write!(f, "POOR"),
            Verdict::Suspicious => write!(f, "SUSPICIOUS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgement {
    pub score: f64,
    pub verdict: Verdict,
    pub warnings: Vec<String>,
    /// True when any warning is an overfitting flag
    pub overfit: bool,
}

impl Judgement {
    pub fn accepts(&self) -> bool {
        self.verdict != Verdict::Suspicious
    }
}

#[derive(Debug, Clone, Default)]
pub struct Judge;

impl Judge {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, result: &BacktestResult) -> Judgement {
        let score = Self::score(result);
        let mut warnings = Vec::new();
        let mut overfit = false;

        if result.max_drawdown > DRAWDOWN_WARNING {
            warnings.push(format!(
                "High drawdown: {:.1}%",
                result.max_drawdown * 100.0
            ));
        }
        if result.total_trades < FEW_TRADES_WARNING {
            warnings.push(format!("Few trades: {}", result.total_trades));
        }
        if result.win_rate < LOW_WIN_RATE_WARNING {
            warnings.push(format!("Low win rate: {:.1}%", result.win_rate * 100.0));
        }
        if result.sharpe_ratio > OVERFIT_SHARPE {
            overfit = true;
            warnings.push(format!(
                "Possible overfitting: Sharpe {:.2} is implausibly high",
                result.sharpe_ratio
            ));
        }
        if result.win_rate > OVERFIT_WIN_RATE && result.total_trades > OVERFIT_MIN_TRADES {
            overfit = true;
            warnings.push(format!(
                "Possible overfitting: {:.1}% win rate over {} trades",
                result.win_rate * 100.0,
                result.total_trades
            ));
        }

        let verdict = if overfit {
            Verdict::Suspicious
        } else if score >= 150.0 {
            Verdict::Excellent
        } else if score >= 100.0 {
            Verdict::Good
        } else if score >= 60.0 {
            Verdict::Acceptable
        } else {
            Verdict::Poor
        };

        Judgement {
            score,
            verdict,
            warnings,
            overfit,
        }
    }

    /// Roughly 0..220: capped ratios plus win rate and return, minus a drawdown penalty.
    pub fn score(result: &BacktestResult) -> f64 {
        let capped = |v: f64, hi: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, hi) };

        let drawdown_penalty = if result.max_drawdown > 0.1 {
            (result.max_drawdown - 0.1) * 100.0
        } else {
            0.0
        };

        capped(result.sharpe_ratio, 3.0) * 15.0
            + capped(result.sortino_ratio, 4.0) * 8.0
            + capped(result.calmar_ratio, 3.0) * 10.0
            + capped(result.profit_factor, 3.0) * 10.0
            + result.win_rate.clamp(0.0, 1.0) * 40.0
            + result.total_return.clamp(-1.0, 1.0) * 40.0
            - drawdown_penalty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid() -> BacktestResult {
        let mut r = BacktestResult::empty(10_000.0);
        r.total_trades = 120;
        r.max_drawdown = 0.08;
        r.total_return = 0.6;
        r.sharpe_ratio = 2.2;
        r.sortino_ratio = 3.0;
        r.calmar_ratio = 2.5;
        r.win_rate = 0.58;
        r.profit_factor = 2.1;
        r
    }

    #[test]
    fn test_solid_result_is_accepted() {
        let j = Judge::new().evaluate(&solid());
        assert!(j.accepts());
        assert!(j.warnings.is_empty());
        assert_eq!(j.verdict, Verdict::Excellent);
    }

    #[test]
    fn test_high_sharpe_is_suspicious() {
        let mut r = solid();
        r.sharpe_ratio = 4.5;
        let j = Judge::new().evaluate(&r);
        assert_eq!(j.verdict, Verdict::Suspicious);
        assert!(!j.accepts());
        assert!(j.overfit);
    }

    #[test]
    fn test_high_win_rate_with_many_trades_is_suspicious() {
        let mut r = solid();
        r.win_rate = 0.9;
        assert_eq!(Judge::new().evaluate(&r).verdict, Verdict::Suspicious);

        // the same win rate over few trades is not an overfit flag
        r.total_trades = 40;
        assert_ne!(Judge::new().evaluate(&r).verdict, Verdict::Suspicious);
    }

    #[test]
    fn test_warnings() {
        let mut r = solid();
        r.max_drawdown = 0.3;
        r.total_trades = 25;
        r.win_rate = 0.3;
        let j = Judge::new().evaluate(&r);
        assert_eq!(j.warnings.len(), 3);
        assert!(!j.overfit);
    }

    #[test]
    fn test_sentinel_is_poor() {
        let j = Judge::new().evaluate(&BacktestResult::empty(10_000.0));
        assert_eq!(j.verdict, Verdict::Poor);
    }

    #[test]
    fn test_verdict_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&Verdict::Acceptable).unwrap(),
            "\"ACCEPTABLE\""
        );
    }
}
