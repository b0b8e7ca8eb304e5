//! Offline provider reading `<dir>/<SYMBOL>.json` files of serialized `Kline`s

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::market::HistoricalDataProvider;
use crate::types::Kline;

pub struct JsonDirProvider {
    dir: PathBuf,
}

impl JsonDirProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl HistoricalDataProvider for JsonDirProvider {
    async fn daily_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>> {
        let path = self.path_for(symbol);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let klines: Vec<Kline> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;

        let (from, to) = (start.timestamp_millis(), end.timestamp_millis());
        let mut bars: Vec<Kline> = klines
            .into_iter()
            .filter(|k| k.open_time >= from && k.open_time <= to)
            .collect();
        bars.sort_by_key(|k| k.open_time);

        debug!(symbol, bars = bars.len(), "Read bars from disk");
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::tests::make_klines;
    use chrono::TimeZone;

    const DAY_MS: i64 = 86_400_000;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("evolver-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_reads_and_filters_range() {
        let dir = scratch_dir("json-range");
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let klines = make_klines(0, &closes, 1000.0);
        std::fs::write(dir.join("AAA.json"), serde_json::to_string(&klines).unwrap()).unwrap();

        let provider = JsonDirProvider::new(&dir);
        let start = Utc.timestamp_millis_opt(2 * DAY_MS).unwrap();
        let end = Utc.timestamp_millis_opt(5 * DAY_MS).unwrap();
        let bars = provider.daily_bars("AAA", start, end).await.unwrap();

        assert_eq!(bars.len(), 4);
        assert_eq!(bars[0].open_time, 2 * DAY_MS);
        assert_eq!(bars[3].close_f64(), 105.0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let provider = JsonDirProvider::new(scratch_dir("json-missing"));
        let now = Utc::now();
        assert!(provider.daily_bars("NOPE", now, now).await.is_err());
    }
}
