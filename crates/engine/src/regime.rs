//! Market regime classification from the reference symbol's trailing closes

use serde::{Deserialize, Serialize};

/// Coarse trend/volatility bucket for recent market behavior.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    StrongBull,
    VolatileBull,
    StrongBear,
    VolatileBear,
    HighVolatility,
    Ranging,
    MildBull,
    MildBear,
    #[default]
    Unknown,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::StrongBull => "strong_bull",
            Regime::VolatileBull => "volatile_bull",
            Regime::StrongBear => "strong_bear",
            Regime::VolatileBear => "volatile_bear",
            Regime::HighVolatility => "high_volatility",
            Regime::Ranging => "ranging",
            Regime::MildBull => "mild_bull",
            Regime::MildBear => "mild_bear",
            Regime::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier cutoffs. Hand-tuned heuristics, so they live in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeThresholds {
    /// Trailing bars used for momentum and realized volatility
    pub lookback: usize,
    /// |momentum| above this is a trend
    pub trend: f64,
    /// Annualized volatility below this makes a trend "strong"
    pub calm_volatility: f64,
    /// Annualized volatility above this makes a trendless market "high_volatility"
    pub high_volatility: f64,
    /// |momentum| below this is "ranging"
    pub ranging_band: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            lookback: 50,
            trend: 0.10,
            calm_volatility: 0.25,
            high_volatility: 0.30,
            ranging_band: 0.02,
        }
    }
}

impl RegimeThresholds {
    /// Classify the market at `idx` using only `closes[..=idx]`.
    pub fn classify(&self, closes: &[f64], idx: usize) -> Regime {
        if self.lookback < 2 || idx >= closes.len() || idx < self.lookback {
            return Regime::Unknown;
        }
        let start = closes[idx - self.lookback];
        if start <= 0.0 {
            return Regime::Unknown;
        }
        let momentum = closes[idx] / start - 1.0;
        let volatility = annualized_volatility(&closes[idx - self.lookback..=idx]);

        if momentum > self.trend {
            if volatility < self.calm_volatility {
                Regime::StrongBull
            } else {
                Regime::VolatileBull
            }
        } else if momentum < -self.trend {
            if volatility < self.calm_volatility {
                Regime::StrongBear
            } else {
                Regime::VolatileBear
            }
        } else if volatility > self.high_volatility {
            Regime::HighVolatility
        } else if momentum.abs() < self.ranging_band {
            Regime::Ranging
        } else if momentum > 0.0 {
            Regime::MildBull
        } else {
            Regime::MildBear
        }
    }
}

/// Population std-dev of simple daily returns, scaled by √252.
fn annualized_volatility(window: &[f64]) -> f64 {
    let returns: Vec<f64> = window
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    var.sqrt() * 252f64.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometric(n: usize, daily: f64) -> Vec<f64> {
        (0..n).map(|i| 100.0 * (1.0 + daily).powi(i as i32)).collect()
    }

    #[test]
    fn test_insufficient_history_is_unknown() {
        let t = RegimeThresholds::default();
        let closes = geometric(30, 0.01);
        assert_eq!(t.classify(&closes, 29), Regime::Unknown);
    }

    #[test]
    fn test_smooth_rise_is_strong_bull() {
        let t = RegimeThresholds::default();
        let closes = geometric(80, 0.005);
        assert_eq!(t.classify(&closes, 79), Regime::StrongBull);
    }

    #[test]
    fn test_smooth_fall_is_strong_bear() {
        let t = RegimeThresholds::default();
        let closes = geometric(80, -0.005);
        assert_eq!(t.classify(&closes, 79), Regime::StrongBear);
    }

    #[test]
    fn test_flat_is_ranging() {
        let t = RegimeThresholds::default();
        let closes = vec![100.0; 80];
        assert_eq!(t.classify(&closes, 79), Regime::Ranging);
    }

    #[test]
    fn test_choppy_flat_is_high_volatility() {
        let t = RegimeThresholds::default();
        // ±5% alternating moves: no net trend, very high realized volatility
        let closes: Vec<f64> = (0..80)
            .map(|i| if i % 2 == 0 { 100.0 } else { 105.0 })
            .collect();
        assert_eq!(t.classify(&closes, 78), Regime::HighVolatility);
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let closes = geometric(80, 0.001);
        let default = RegimeThresholds::default();
        assert_eq!(default.classify(&closes, 79), Regime::MildBull);

        let loose = RegimeThresholds {
            trend: 0.02,
            ..RegimeThresholds::default()
        };
        assert_eq!(loose.classify(&closes, 79), Regime::StrongBull);
    }

    #[test]
    fn test_regime_serializes_snake_case() {
        let json = serde_json::to_string(&Regime::HighVolatility).unwrap();
        assert_eq!(json, "\"high_volatility\"");
    }
}
