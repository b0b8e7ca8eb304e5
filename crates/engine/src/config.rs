//! Run configuration
//!
//! Every struct deserializes with per-field defaults, so a config file only
//! needs the values it changes. Validation happens once, before the first
//! generation; any error here is fatal.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::params::{ParameterSpace, ParameterSpec};
use crate::regime::RegimeThresholds;

// ============================================================================
// Optimizer
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Genomes per island
    pub population_size: usize,
    pub islands: usize,
    pub elite_count: usize,
    pub tournament_size: usize,
    pub crossover_rate: f64,
    pub initial_mutation_rate: f64,
    pub max_mutation_rate: f64,
    /// Chance a mutated gene takes the learning engine's suggestion
    pub guided_mutation_prob: f64,
    /// Gaussian mutation std-dev as a fraction of the parameter range
    pub mutation_sigma: f64,
    pub migration_interval: u32,
    pub migration_count: usize,
    /// Unique-genome fraction below which fresh genomes are injected
    pub diversity_threshold: f64,
    pub diversity_min_generation: u32,
    /// Fraction of each island replaced on injection
    pub diversity_injection_fraction: f64,
    pub max_generations: u32,
    pub max_evaluations: Option<u64>,
    pub max_duration_secs: Option<u64>,
    pub convergence_threshold: f64,
    pub convergence_min_generation: u32,
    /// Generations of average fitness inspected by the convergence test
    pub convergence_window: usize,
    /// Genomes evaluated concurrently
    pub batch_size: usize,
    pub checkpoint_interval: u32,
    pub report_interval: u32,
    pub seed: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            population_size: 50,
            islands: 4,
            elite_count: 2,
            tournament_size: 3,
            crossover_rate: 0.7,
            initial_mutation_rate: 0.15,
            max_mutation_rate: 0.5,
            guided_mutation_prob: 0.3,
            mutation_sigma: 0.2,
            migration_interval: 10,
            migration_count: 2,
            diversity_threshold: 0.3,
            diversity_min_generation: 20,
            diversity_injection_fraction: 0.2,
            max_generations: 500,
            max_evaluations: None,
            max_duration_secs: None,
            convergence_threshold: 0.001,
            convergence_min_generation: 100,
            convergence_window: 30,
            batch_size: 16,
            checkpoint_interval: 10,
            report_interval: 1,
            seed: None,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> EngineResult<()> {
        let fail = |msg: String| Err(EngineError::Configuration(msg));

        if self.population_size < 2 {
            return fail(format!("population_size must be >= 2, got {}", self.population_size));
        }
        if self.islands == 0 {
            return fail("islands must be >= 1".to_string());
        }
        if self.elite_count >= self.population_size {
            return fail(format!(
                "elite_count {} must be below population_size {}",
                self.elite_count, self.population_size
            ));
        }
        if self.tournament_size == 0 {
            return fail("tournament_size must be >= 1".to_string());
        }
        if self.migration_count >= self.population_size {
            return fail(format!(
                "migration_count {} must be below population_size {}",
                self.migration_count, self.population_size
            ));
        }
        if self.batch_size == 0 {
            return fail("batch_size must be >= 1".to_string());
        }
        if self.convergence_window < 2 {
            return fail("convergence_window must be >= 2".to_string());
        }

        for (name, value) in [
            ("crossover_rate", self.crossover_rate),
            ("initial_mutation_rate", self.initial_mutation_rate),
            ("max_mutation_rate", self.max_mutation_rate),
            ("guided_mutation_prob", self.guided_mutation_prob),
            ("diversity_threshold", self.diversity_threshold),
            ("diversity_injection_fraction", self.diversity_injection_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if self.initial_mutation_rate > self.max_mutation_rate {
            return fail("initial_mutation_rate exceeds max_mutation_rate".to_string());
        }
        if !(self.mutation_sigma > 0.0) {
            return fail("mutation_sigma must be positive".to_string());
        }
        Ok(())
    }

    pub fn total_population(&self) -> usize {
        self.population_size * self.islands
    }
}

// ============================================================================
// Backtest
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestSettings {
    pub initial_capital: f64,
    /// First simulated reference index when `start_index` is unset
    pub warmup_bars: usize,
    /// Reference series shorter than this yields the empty result
    pub min_reference_bars: usize,
    pub start_index: Option<usize>,
    pub end_index: Option<usize>,
    pub regime: RegimeThresholds,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            warmup_bars: 60,
            min_reference_bars: 100,
            start_index: None,
            end_index: None,
            regime: RegimeThresholds::default(),
        }
    }
}

impl BacktestSettings {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.initial_capital > 0.0) {
            return Err(EngineError::Configuration(
                "initial_capital must be positive".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_index, self.end_index) {
            if start > end {
                return Err(EngineError::Configuration(format!(
                    "start_index {start} is after end_index {end}"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// File config
// ============================================================================

/// Everything a run needs, as loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolverConfig {
    pub symbols: Vec<String>,
    /// Timeline symbol; defaults to the first entry of `symbols`
    pub reference_symbol: Option<String>,
    /// Days of daily history to fetch
    pub days: u32,
    pub optimizer: OptimizerConfig,
    pub backtest: BacktestSettings,
    /// Overrides for individual ParameterSpec entries, matched by name
    pub parameters: Vec<ParameterSpec>,
}

impl Default for EvolverConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            reference_symbol: None,
            days: 730,
            optimizer: OptimizerConfig::default(),
            backtest: BacktestSettings::default(),
            parameters: Vec::new(),
        }
    }
}

impl EvolverConfig {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference_symbol
            .as_deref()
            .or_else(|| self.symbols.first().map(String::as_str))
    }

    /// Validate every section and build the parameter table.
    pub fn validate(&self) -> EngineResult<ParameterSpace> {
        if self.symbols.is_empty() {
            return Err(EngineError::Configuration("no symbols configured".to_string()));
        }
        if self.days == 0 {
            return Err(EngineError::Configuration("days must be positive".to_string()));
        }
        self.optimizer.validate()?;
        self.backtest.validate()?;
        ParameterSpace::with_overrides(&self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EvolverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reference(), Some("BTCUSDT"));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = EvolverConfig::from_json(
            r#"{
                "symbols": ["SOLUSDT"],
                "optimizer": { "islands": 2, "seed": 42 },
                "backtest": { "regime": { "trend": 0.08 } },
                "parameters": [
                    { "name": "rsi_period", "min": 10, "max": 20, "step": 1, "integer": true }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.optimizer.islands, 2);
        assert_eq!(config.optimizer.seed, Some(42));
        assert_eq!(config.optimizer.population_size, 50);
        assert_eq!(config.backtest.regime.trend, 0.08);
        assert_eq!(config.backtest.regime.lookback, 50);

        let space = config.validate().unwrap();
        assert_eq!(space.spec(crate::params::ParamId::RsiPeriod).min, 10.0);
    }

    #[test]
    fn test_invalid_optimizer_is_configuration_error() {
        let config = OptimizerConfig {
            elite_count: 50,
            ..OptimizerConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));

        let config = OptimizerConfig {
            crossover_rate: 1.5,
            ..OptimizerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_parameter_override_is_rejected() {
        let config = EvolverConfig {
            parameters: vec![ParameterSpec::new("bb_period", 30.0, 10.0, 1.0, true)],
            ..EvolverConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(EvolverConfig::from_json("{ not json").is_err());
    }
}
