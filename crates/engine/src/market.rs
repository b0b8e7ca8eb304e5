//! Market data assembly
//!
//! Bars are fetched once, up front, through a `HistoricalDataProvider`, then
//! frozen into a `MarketData` that every evaluation shares read-only.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::Kline;

// ============================================================================
// Provider contract
// ============================================================================

/// Source of daily OHLCV bars.
#[async_trait]
pub trait HistoricalDataProvider: Send + Sync {
    /// Ordered daily bars for `symbol` in `[start, end]`.
    async fn daily_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>>;
}

// ============================================================================
// Series
// ============================================================================

/// One symbol's bars as parallel f64 columns.
#[derive(Debug, Clone)]
pub struct SymbolSeries {
    pub symbol: String,
    pub times: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl SymbolSeries {
    /// Convert provider bars, sorting by open time and dropping duplicate timestamps.
    pub fn from_klines(symbol: &str, klines: &[Kline]) -> Self {
        let mut sorted: Vec<&Kline> = klines.iter().collect();
        sorted.sort_by_key(|k| k.open_time);
        sorted.dedup_by_key(|k| k.open_time);

        let f = |d: &rust_decimal::Decimal| d.to_f64().unwrap_or(0.0);
        Self {
            symbol: symbol.to_string(),
            times: sorted.iter().map(|k| k.open_time).collect(),
            open: sorted.iter().map(|k| f(&k.open)).collect(),
            high: sorted.iter().map(|k| f(&k.high)).collect(),
            low: sorted.iter().map(|k| f(&k.low)).collect(),
            close: sorted.iter().map(|k| f(&k.close)).collect(),
            volume: sorted.iter().map(|k| f(&k.volume)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }
}

// ============================================================================
// MarketData
// ============================================================================

/// Immutable universe for a run: the reference timeline plus every symbol
/// aligned to it by timestamp.
#[derive(Debug, Clone)]
pub struct MarketData {
    reference: String,
    symbols: Vec<SymbolSeries>,
    /// `alignment[s][t]`: local bar index of symbol `s` at reference index `t`
    alignment: Vec<Vec<Option<usize>>>,
}

impl MarketData {
    pub fn new(reference: &str, symbols: Vec<SymbolSeries>) -> Self {
        let ref_times: Vec<i64> = symbols
            .iter()
            .find(|s| s.symbol == reference)
            .map(|s| s.times.clone())
            .unwrap_or_default();

        let alignment = symbols
            .iter()
            .map(|series| {
                let local: HashMap<i64, usize> = series
                    .times
                    .iter()
                    .enumerate()
                    .map(|(i, &t)| (t, i))
                    .collect();
                ref_times.iter().map(|t| local.get(t).copied()).collect()
            })
            .collect();

        Self {
            reference: reference.to_string(),
            symbols,
            alignment,
        }
    }

    pub fn reference_symbol(&self) -> &str {
        &self.reference
    }

    /// The reference series, if it survived loading.
    pub fn reference(&self) -> Option<&SymbolSeries> {
        self.symbols.iter().find(|s| s.symbol == self.reference)
    }

    pub fn symbols(&self) -> &[SymbolSeries] {
        &self.symbols
    }

    pub fn symbol_names(&self) -> Vec<String> {
        self.symbols.iter().map(|s| s.symbol.clone()).collect()
    }

    /// Local bar index of symbol `s` at reference index `t`.
    pub fn local_index(&self, s: usize, t: usize) -> Option<usize> {
        self.alignment.get(s).and_then(|a| a.get(t)).copied().flatten()
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Fetch every symbol once and build the run's `MarketData`.
///
/// Provider failures and short series exclude the symbol; the run only fails
/// when nothing usable remains.
pub async fn load_market_data(
    provider: &dyn HistoricalDataProvider,
    symbols: &[String],
    reference: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    min_bars: usize,
) -> EngineResult<MarketData> {
    let mut loaded = Vec::with_capacity(symbols.len());

    for symbol in symbols {
        let klines = match provider.daily_bars(symbol, start, end).await {
            Ok(k) => k,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Failed to fetch bars, excluding symbol");
                continue;
            }
        };

        let series = SymbolSeries::from_klines(symbol, &klines);
        if series.len() < min_bars {
            warn!(
                symbol = %symbol,
                bars = series.len(),
                min_bars,
                "Insufficient history, excluding symbol"
            );
            continue;
        }

        info!(symbol = %symbol, bars = series.len(), "Loaded bars");
        loaded.push(series);
    }

    if loaded.is_empty() {
        return Err(EngineError::Data(
            "no symbol has enough history for a run".to_string(),
        ));
    }
    if !loaded.iter().any(|s| s.symbol == reference) {
        warn!(reference, "Reference symbol excluded, every backtest will be empty");
    }

    Ok(MarketData::new(reference, loaded))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const DAY_MS: i64 = 86_400_000;

    /// Daily klines from a close series; high/low are ±1% of close.
    pub(crate) fn make_klines(start: i64, closes: &[f64], volume: f64) -> Vec<Kline> {
        let d = |v: f64| Decimal::from_f64_retain(v).unwrap_or_default();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let t = start + i as i64 * DAY_MS;
                Kline {
                    open_time: t,
                    open: d(c),
                    high: d(c * 1.01),
                    low: d(c * 0.99),
                    close: d(c),
                    volume: d(volume),
                    close_time: t + DAY_MS - 1,
                }
            })
            .collect()
    }

    struct FixedProvider {
        bars: HashMap<String, Vec<Kline>>,
    }

    #[async_trait]
    impl HistoricalDataProvider for FixedProvider {
        async fn daily_bars(
            &self,
            symbol: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<Kline>> {
            self.bars
                .get(symbol)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown symbol {symbol}"))
        }
    }

    #[test]
    fn test_alignment_by_timestamp() {
        let a = SymbolSeries::from_klines("AAA", &make_klines(0, &[1.0, 2.0, 3.0, 4.0], 10.0));
        // BBB starts one day later
        let b = SymbolSeries::from_klines("BBB", &make_klines(DAY_MS, &[5.0, 6.0, 7.0], 10.0));
        let market = MarketData::new("AAA", vec![a, b]);

        assert_eq!(market.local_index(0, 2), Some(2));
        assert_eq!(market.local_index(1, 0), None);
        assert_eq!(market.local_index(1, 1), Some(0));
        assert_eq!(market.local_index(1, 3), Some(2));
        assert_eq!(market.local_index(5, 0), None);
    }

    #[test]
    fn test_from_klines_sorts_and_dedups() {
        let mut klines = make_klines(0, &[1.0, 2.0, 3.0], 1.0);
        klines.reverse();
        klines.push(klines[0].clone());
        let s = SymbolSeries::from_klines("X", &klines);
        assert_eq!(s.len(), 3);
        assert_eq!(s.close, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_load_excludes_short_and_failed_symbols() {
        let mut bars = HashMap::new();
        bars.insert("LONG".to_string(), make_klines(0, &vec![100.0; 150], 1.0));
        bars.insert("SHORT".to_string(), make_klines(0, &vec![100.0; 20], 1.0));
        let provider = FixedProvider { bars };

        let symbols = vec!["LONG".to_string(), "SHORT".to_string(), "MISSING".to_string()];
        let market = load_market_data(&provider, &symbols, "LONG", Utc::now(), Utc::now(), 100)
            .await
            .unwrap();

        assert_eq!(market.symbol_names(), vec!["LONG".to_string()]);
        assert_eq!(market.reference().map(|s| s.len()), Some(150));
    }

    #[tokio::test]
    async fn test_load_fails_when_nothing_usable() {
        let provider = FixedProvider {
            bars: HashMap::new(),
        };
        let symbols = vec!["NONE".to_string()];
        let result = load_market_data(&provider, &symbols, "NONE", Utc::now(), Utc::now(), 100).await;
        assert!(matches!(result, Err(EngineError::Data(_))));
    }
}
