//! Signal generator: eight bounded factors blended by the genome's weights
//!
//! Indicators are computed once per symbol and genome over the full series.
//! Every indicator is lookahead-free, so reading index `i` only ever sees
//! bars `..=i`.

use crate::error::EngineResult;
use crate::indicators::{self, at, BollingerSeries, Series};
use crate::market::SymbolSeries;
use crate::params::{Genes, ParamId};

/// Bars of local history required before any signal is produced.
pub const WARMUP_BARS: usize = 60;

/// Factor magnitude that counts as "agreeing" with the composite direction.
const AGREEMENT_THRESHOLD: f64 = 0.2;

/// ATR% at which the volatility factor is neutral.
const NEUTRAL_ATR_PCT: f64 = 0.03;

const VOLUME_AVG_PERIOD: usize = 20;
const SENTIMENT_LOOKBACK: usize = 5;

// ============================================================================
// Types
// ============================================================================

/// Composite signal at one bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    /// Weighted factor sum, in `[-1, 1] · Σweights`
    pub score: f64,
    /// Agreement-scaled strength, in `[0, 1]`
    pub confidence: f64,
}

impl Signal {
    pub const NEUTRAL: Signal = Signal {
        score: 0.0,
        confidence: 0.0,
    };
}

/// The eight factors, in weight order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factor {
    Technical,
    Momentum,
    Volatility,
    Volume,
    Sentiment,
    Pattern,
    Breadth,
    Correlation,
}

impl Factor {
    pub const ALL: [Factor; 8] = [
        Factor::Technical,
        Factor::Momentum,
        Factor::Volatility,
        Factor::Volume,
        Factor::Sentiment,
        Factor::Pattern,
        Factor::Breadth,
        Factor::Correlation,
    ];

    pub fn weight_param(self) -> ParamId {
        match self {
            Factor::Technical => ParamId::WeightTechnical,
            Factor::Momentum => ParamId::WeightMomentum,
            Factor::Volatility => ParamId::WeightVolatility,
            Factor::Volume => ParamId::WeightVolume,
            Factor::Sentiment => ParamId::WeightSentiment,
            Factor::Pattern => ParamId::WeightPattern,
            Factor::Breadth => ParamId::WeightBreadth,
            Factor::Correlation => ParamId::WeightCorrelation,
        }
    }
}

/// Indicators a genome needs for one symbol.
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    pub rsi: Series,
    pub macd_histogram: Series,
    pub atr: Series,
    pub bollinger: BollingerSeries,
    pub sma_short: Series,
    pub sma_medium: Series,
    pub volume_avg: Series,
}

impl IndicatorSet {
    pub fn compute(series: &SymbolSeries, genes: &Genes) -> EngineResult<Self> {
        let close = &series.close;
        let macd = indicators::macd(
            close,
            genes.period(ParamId::MacdFast),
            genes.period(ParamId::MacdSlow),
            genes.period(ParamId::MacdSignal),
        )?;

        Ok(Self {
            rsi: indicators::rsi(close, genes.period(ParamId::RsiPeriod))?,
            macd_histogram: macd.histogram,
            atr: indicators::atr(
                &series.high,
                &series.low,
                close,
                genes.period(ParamId::AtrPeriod),
            )?,
            bollinger: indicators::bollinger(
                close,
                genes.period(ParamId::BbPeriod),
                genes[ParamId::BbStdDev],
            )?,
            sma_short: indicators::sma(close, genes.period(ParamId::SmaShort))?,
            sma_medium: indicators::sma(close, genes.period(ParamId::SmaMedium))?,
            volume_avg: indicators::sma(&series.volume, VOLUME_AVG_PERIOD)?,
        })
    }
}

// ============================================================================
// Generator
// ============================================================================

/// Composite signal for `series` at local index `i`.
pub fn generate(series: &SymbolSeries, ind: &IndicatorSet, genes: &Genes, i: usize) -> Signal {
    if i < WARMUP_BARS || i >= series.len() {
        return Signal::NEUTRAL;
    }

    // No movement means no signal: zero range or a frozen close.
    match at(&ind.atr, i) {
        Some(atr) if atr > 0.0 => {}
        _ => return Signal::NEUTRAL,
    }
    let quiet_window = genes
        .period(ParamId::RsiPeriod)
        .max(genes.period(ParamId::MomentumMedium))
        .min(i);
    let close = &series.close;
    if close[i - quiet_window..=i].iter().all(|&c| c == close[i]) {
        return Signal::NEUTRAL;
    }

    let mut score = 0.0;
    let mut active: Vec<f64> = Vec::with_capacity(Factor::ALL.len());
    for factor in Factor::ALL {
        let weight = genes[factor.weight_param()];
        if weight <= 0.0 {
            continue;
        }
        if let Some(value) = factor_value(factor, series, ind, genes, i) {
            score += value * weight;
            active.push(value);
        }
    }

    if active.is_empty() || score == 0.0 {
        return Signal { score, confidence: 0.0 };
    }

    let agreeing = active
        .iter()
        .filter(|f| f.signum() == score.signum() && f.abs() > AGREEMENT_THRESHOLD)
        .count();
    let fraction = agreeing as f64 / active.len() as f64;

    Signal {
        score,
        confidence: (fraction * score.abs()).clamp(0.0, 1.0),
    }
}

/// Bounded factor value in `[-1, 1]`, or `None` while its inputs are undefined.
pub fn factor_value(
    factor: Factor,
    series: &SymbolSeries,
    ind: &IndicatorSet,
    genes: &Genes,
    i: usize,
) -> Option<f64> {
    let close = &series.close;
    let c = close[i];
    if c <= 0.0 {
        return None;
    }

    let value = match factor {
        Factor::Technical => {
            let rsi = at(&ind.rsi, i)?;
            let hist = at(&ind.macd_histogram, i)?;
            let oversold = genes[ParamId::RsiOversold];
            let overbought = genes[ParamId::RsiOverbought];
            let rsi_term = if rsi < oversold {
                (oversold - rsi) / oversold
            } else if rsi > overbought {
                -(rsi - overbought) / (100.0 - overbought)
            } else {
                0.0
            };
            0.5 * rsi_term + 0.5 * bound(hist / (0.01 * c))
        }
        Factor::Momentum => {
            let short = rate_of_change(close, i, genes.period(ParamId::MomentumShort))?;
            let medium = rate_of_change(close, i, genes.period(ParamId::MomentumMedium))?;
            (0.6 * short + 0.4 * medium) * 10.0
        }
        Factor::Volatility => {
            let atr_pct = at(&ind.atr, i)? / c;
            (NEUTRAL_ATR_PCT - atr_pct) / NEUTRAL_ATR_PCT
        }
        Factor::Volume => {
            let avg = at(&ind.volume_avg, i)?;
            if avg <= 0.0 || i == 0 {
                return Some(0.0);
            }
            let direction = sign(c - close[i - 1]);
            bound(series.volume[i] / avg - 1.0) * direction
        }
        Factor::Sentiment => rate_of_change(close, i, SENTIMENT_LOOKBACK)? * 10.0,
        Factor::Pattern => {
            let upper = at(&ind.bollinger.upper, i)?;
            let lower = at(&ind.bollinger.lower, i)?;
            let width = upper - lower;
            if width <= 0.0 {
                return Some(0.0);
            }
            let position = (c - lower) / width;
            if position < 0.0 {
                0.5 - position * 2.0
            } else if position > 1.0 {
                -(0.5 + (position - 1.0) * 2.0)
            } else {
                0.0
            }
        }
        Factor::Breadth => {
            let short = at(&ind.sma_short, i)?;
            let medium = at(&ind.sma_medium, i)?;
            0.5 * sign(c - short) + 0.5 * sign(c - medium)
        }
        Factor::Correlation => {
            let upper = at(&ind.bollinger.upper, i)?;
            let middle = at(&ind.bollinger.middle, i)?;
            let half_width = upper - middle;
            if half_width <= 0.0 {
                return Some(0.0);
            }
            (c - middle) / half_width
        }
    };

    Some(bound(value))
}

fn bound(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn rate_of_change(close: &[f64], i: usize, lookback: usize) -> Option<f64> {
    if lookback == 0 || i < lookback {
        return None;
    }
    let base = close[i - lookback];
    if base <= 0.0 {
        return None;
    }
    Some(close[i] / base - 1.0)
}
