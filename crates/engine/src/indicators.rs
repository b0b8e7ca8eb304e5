//! Indicator library
//!
//! Pure transforms over price series. Every function returns one `Point` per
//! input bar, `NotYetAvailable` until the indicator has enough history, and
//! never reads past the index it is producing. SMA, EMA, MACD and Bollinger
//! Bands run on the `ta` streaming indicators; RSI and ATR use Wilder smoothing, which `ta`
//! does not provide.

use ta::indicators::{
    BollingerBands, ExponentialMovingAverage, MovingAverageConvergenceDivergence,
    SimpleMovingAverage,
};
use ta::Next;

use crate::error::{EngineError, EngineResult};

// ============================================================================
// Point
// ============================================================================

/// One computed indicator value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Point {
    Defined(f64),
    NotYetAvailable,
}

impl Point {
    pub fn value(self) -> Option<f64> {
        match self {
            Point::Defined(v) => Some(v),
            Point::NotYetAvailable => None,
        }
    }

    pub fn is_defined(self) -> bool {
        matches!(self, Point::Defined(_))
    }
}

pub type Series = Vec<Point>;

/// Value at `idx`, or `None` when out of range or not yet available.
pub fn at(series: &[Point], idx: usize) -> Option<f64> {
    series.get(idx).and_then(|p| p.value())
}

fn check_period(name: &str, period: usize) -> EngineResult<()> {
    if period == 0 {
        return Err(EngineError::Indicator(format!("{name} period must be positive")));
    }
    Ok(())
}

fn ta_error(name: &str, err: ta::errors::TaError) -> EngineError {
    EngineError::Indicator(format!("{name}: {err:?}"))
}

// ============================================================================
// Moving averages
// ============================================================================

/// Simple trailing mean, undefined for `index < period - 1`.
pub fn sma(prices: &[f64], period: usize) -> EngineResult<Series> {
    check_period("SMA", period)?;
    let mut sma = SimpleMovingAverage::new(period).map_err(|e| ta_error("SMA", e))?;
    Ok(prices
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let v = sma.next(p);
            if i + 1 >= period {
                Point::Defined(v)
            } else {
                Point::NotYetAvailable
            }
        })
        .collect())
}

/// EMA seeded with the first price, `k = 2 / (period + 1)`.
pub fn ema(prices: &[f64], period: usize) -> EngineResult<Series> {
    check_period("EMA", period)?;
    let mut ema = ExponentialMovingAverage::new(period).map_err(|e| ta_error("EMA", e))?;
    Ok(prices.iter().map(|&p| Point::Defined(ema.next(p))).collect())
}

// ============================================================================
// RSI / ATR (Wilder)
// ============================================================================

/// Wilder RSI. First defined at `index == period`; 100 when the average loss is zero.
pub fn rsi(prices: &[f64], period: usize) -> EngineResult<Series> {
    check_period("RSI", period)?;
    let mut out = vec![Point::NotYetAvailable; prices.len()];
    if prices.len() <= period {
        return Ok(out);
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = prices[i] - prices[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = Point::Defined(rsi_value(avg_gain, avg_loss));

    let p = period as f64;
    for i in (period + 1)..prices.len() {
        let change = prices[i] - prices[i - 1];
        let (gain, loss) = if change > 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        out[i] = Point::Defined(rsi_value(avg_gain, avg_loss));
    }

    Ok(out)
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Wilder-smoothed true range. First defined at `index == period - 1`.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> EngineResult<Series> {
    check_period("ATR", period)?;
    if high.len() != close.len() || low.len() != close.len() {
        return Err(EngineError::Indicator(
            "ATR inputs must have equal length".to_string(),
        ));
    }
    let n = close.len();
    let mut out = vec![Point::NotYetAvailable; n];
    if n < period {
        return Ok(out);
    }

    let true_range = |i: usize| -> f64 {
        let range = high[i] - low[i];
        if i == 0 {
            return range;
        }
        let prev_close = close[i - 1];
        range
            .max((high[i] - prev_close).abs())
            .max((low[i] - prev_close).abs())
    };

    let p = period as f64;
    let mut value = (0..period).map(true_range).sum::<f64>() / p;
    out[period - 1] = Point::Defined(value);
    for (i, slot) in out.iter_mut().enumerate().skip(period) {
        value = (value * (p - 1.0) + true_range(i)) / p;
        *slot = Point::Defined(value);
    }

    Ok(out)
}

// ============================================================================
// MACD
// ============================================================================

#[derive(Debug, Clone)]
pub struct MacdSeries {
    pub macd: Series,
    pub signal: Series,
    pub histogram: Series,
}

/// EMA(fast) - EMA(slow), its EMA(signal), and the difference of the two.
pub fn macd(prices: &[f64], fast: usize, slow: usize, signal: usize) -> EngineResult<MacdSeries> {
    check_period("MACD fast", fast)?;
    check_period("MACD slow", slow)?;
    check_period("MACD signal", signal)?;
    let mut ind = MovingAverageConvergenceDivergence::new(fast, slow, signal)
        .map_err(|e| ta_error("MACD", e))?;

    let mut out = MacdSeries {
        macd: Vec::with_capacity(prices.len()),
        signal: Vec::with_capacity(prices.len()),
        histogram: Vec::with_capacity(prices.len()),
    };
    for &p in prices {
        let o = ind.next(p);
        out.macd.push(Point::Defined(o.macd));
        out.signal.push(Point::Defined(o.signal));
        out.histogram.push(Point::Defined(o.histogram));
    }
    Ok(out)
}

// ============================================================================
// Bollinger Bands
// ============================================================================

#[derive(Debug, Clone)]
pub struct BollingerSeries {
    pub upper: Series,
    pub middle: Series,
    pub lower: Series,
}

/// SMA(period) ± multiple × population std-dev of the trailing window.
pub fn bollinger(prices: &[f64], period: usize, multiple: f64) -> EngineResult<BollingerSeries> {
    check_period("Bollinger", period)?;
    let mut bb = BollingerBands::new(period, multiple).map_err(|e| ta_error("Bollinger", e))?;

    let mut out = BollingerSeries {
        upper: Vec::with_capacity(prices.len()),
        middle: Vec::with_capacity(prices.len()),
        lower: Vec::with_capacity(prices.len()),
    };
    for (i, &p) in prices.iter().enumerate() {
        let o = bb.next(p);
        if i + 1 >= period {
            out.upper.push(Point::Defined(o.upper));
            out.middle.push(Point::Defined(o.average));
            out.lower.push(Point::Defined(o.lower));
        } else {
            out.upper.push(Point::NotYetAvailable);
            out.middle.push(Point::NotYetAvailable);
            out.lower.push(Point::NotYetAvailable);
        }
    }
    Ok(out)
}
