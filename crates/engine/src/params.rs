//! Parameter space: the table of tunable strategy dimensions
//!
//! Every tunable value is addressed by a `ParamId`; a genome's values live in a
//! fixed array indexed by it. The `ParameterSpace` owns one `ParameterSpec` per
//! id and is the only place values are snapped to their grid.

use std::collections::{BTreeMap, HashSet};
use std::ops::{Index, IndexMut};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Tolerance used when checking that floating values sit on a step grid.
const GRID_EPS: f64 = 1e-9;

// ============================================================================
// Parameter identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamId {
    WeightTechnical,
    WeightMomentum,
    WeightVolatility,
    WeightVolume,
    WeightSentiment,
    WeightPattern,
    WeightBreadth,
    WeightCorrelation,
    BuyThreshold,
    SellThreshold,
    ConfidenceMin,
    MaxPositions,
    MaxPositionPct,
    AtrMultStop,
    AtrMultTarget,
    RsiPeriod,
    RsiOversold,
    RsiOverbought,
    MacdFast,
    MacdSlow,
    MacdSignal,
    BbPeriod,
    BbStdDev,
    AtrPeriod,
    MomentumShort,
    MomentumMedium,
    SmaShort,
    SmaMedium,
}

impl ParamId {
    pub const COUNT: usize = 28;

    pub const ALL: [ParamId; ParamId::COUNT] = [
        ParamId::WeightTechnical,
        ParamId::WeightMomentum,
        ParamId::WeightVolatility,
        ParamId::WeightVolume,
        ParamId::WeightSentiment,
        ParamId::WeightPattern,
        ParamId::WeightBreadth,
        ParamId::WeightCorrelation,
        ParamId::BuyThreshold,
        ParamId::SellThreshold,
        ParamId::ConfidenceMin,
        ParamId::MaxPositions,
        ParamId::MaxPositionPct,
        ParamId::AtrMultStop,
        ParamId::AtrMultTarget,
        ParamId::RsiPeriod,
        ParamId::RsiOversold,
        ParamId::RsiOverbought,
        ParamId::MacdFast,
        ParamId::MacdSlow,
        ParamId::MacdSignal,
        ParamId::BbPeriod,
        ParamId::BbStdDev,
        ParamId::AtrPeriod,
        ParamId::MomentumShort,
        ParamId::MomentumMedium,
        ParamId::SmaShort,
        ParamId::SmaMedium,
    ];

    /// Signal factor weights, renormalized to sum to 1.0 after every genetic operation.
    pub const WEIGHTS: [ParamId; 8] = [
        ParamId::WeightTechnical,
        ParamId::WeightMomentum,
        ParamId::WeightVolatility,
        ParamId::WeightVolume,
        ParamId::WeightSentiment,
        ParamId::WeightPattern,
        ParamId::WeightBreadth,
        ParamId::WeightCorrelation,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ParamId::WeightTechnical => "weight_technical",
            ParamId::WeightMomentum => "weight_momentum",
            ParamId::WeightVolatility => "weight_volatility",
            ParamId::WeightVolume => "weight_volume",
            ParamId::WeightSentiment => "weight_sentiment",
            ParamId::WeightPattern => "weight_pattern",
            ParamId::WeightBreadth => "weight_breadth",
            ParamId::WeightCorrelation => "weight_correlation",
            ParamId::BuyThreshold => "buy_threshold",
            ParamId::SellThreshold => "sell_threshold",
            ParamId::ConfidenceMin => "confidence_min",
            ParamId::MaxPositions => "max_positions",
            ParamId::MaxPositionPct => "max_position_pct",
            ParamId::AtrMultStop => "atr_mult_stop",
            ParamId::AtrMultTarget => "atr_mult_target",
            ParamId::RsiPeriod => "rsi_period",
            ParamId::RsiOversold => "rsi_oversold",
            ParamId::RsiOverbought => "rsi_overbought",
            ParamId::MacdFast => "macd_fast",
            ParamId::MacdSlow => "macd_slow",
            ParamId::MacdSignal => "macd_signal",
            ParamId::BbPeriod => "bb_period",
            ParamId::BbStdDev => "bb_std_dev",
            ParamId::AtrPeriod => "atr_period",
            ParamId::MomentumShort => "momentum_short",
            ParamId::MomentumMedium => "momentum_medium",
            ParamId::SmaShort => "sma_short",
            ParamId::SmaMedium => "sma_medium",
        }
    }

    pub fn from_name(name: &str) -> Option<ParamId> {
        ParamId::ALL.iter().copied().find(|p| p.name() == name)
    }

    pub fn is_weight(self) -> bool {
        ParamId::WEIGHTS.contains(&self)
    }
}

impl std::fmt::Display for ParamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// ParameterSpec
// ============================================================================

/// One tunable dimension: inclusive range, quantization step, integer flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    #[serde(default)]
    pub integer: bool,
}

impl ParameterSpec {
    pub fn new(name: &str, min: f64, max: f64, step: f64, integer: bool) -> Self {
        Self {
            name: name.to_string(),
            min,
            max,
            step,
            integer,
        }
    }

    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    /// Highest reachable step index `k` such that `min + k·step <= max`.
    pub fn max_steps(&self) -> i64 {
        ((self.range() / self.step) + GRID_EPS).floor() as i64
    }

    /// Clamp to range, then snap to the nearest grid point `min + k·step`.
    pub fn quantize(&self, value: f64) -> f64 {
        self.value_at(self.step_index(value))
    }

    pub fn step_index(&self, value: f64) -> i64 {
        let value = if value.is_finite() { value } else { self.min };
        let clamped = value.clamp(self.min, self.max);
        (((clamped - self.min) / self.step).round() as i64).clamp(0, self.max_steps())
    }

    pub fn value_at(&self, k: i64) -> f64 {
        let v = (self.min + k as f64 * self.step).clamp(self.min, self.max);
        if self.integer {
            v.round()
        } else {
            v
        }
    }

    /// True when `value` lies in range and on the step grid.
    pub fn contains(&self, value: f64) -> bool {
        if !(value >= self.min - GRID_EPS && value <= self.max + GRID_EPS) {
            return false;
        }
        let k = (value - self.min) / self.step;
        (k - k.round()).abs() < 1e-6
    }

    pub fn random<R: Rng>(&self, rng: &mut R) -> f64 {
        self.value_at(rng.gen_range(0..=self.max_steps()))
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !(self.min.is_finite() && self.max.is_finite() && self.step.is_finite()) {
            return Err(EngineError::invalid_parameter(&self.name, "bounds must be finite"));
        }
        if self.min > self.max {
            return Err(EngineError::invalid_parameter(
                &self.name,
                format!("min {} > max {}", self.min, self.max),
            ));
        }
        if self.step <= 0.0 {
            return Err(EngineError::invalid_parameter(&self.name, "step must be positive"));
        }
        if self.integer {
            let integral = |v: f64| (v - v.round()).abs() < GRID_EPS;
            if !integral(self.min) || !integral(self.max) || !integral(self.step) {
                return Err(EngineError::invalid_parameter(
                    &self.name,
                    "integer parameter needs integral min, max and step",
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Genes
// ============================================================================

/// A full parameter assignment, indexed by `ParamId`.
///
/// Serialized as a `name -> value` map so checkpoints stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "BTreeMap<String, f64>", try_from = "BTreeMap<String, f64>")]
pub struct Genes([f64; ParamId::COUNT]);

impl Genes {
    pub fn get(&self, id: ParamId) -> f64 {
        self.0[id.index()]
    }

    pub fn set(&mut self, id: ParamId, value: f64) {
        self.0[id.index()] = value;
    }

    /// Value read as an indicator period (at least 1).
    pub fn period(&self, id: ParamId) -> usize {
        self.get(id).round().max(1.0) as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, f64)> + '_ {
        ParamId::ALL.iter().map(move |&id| (id, self.get(id)))
    }

    pub fn weight_sum(&self) -> f64 {
        ParamId::WEIGHTS.iter().map(|&w| self.get(w)).sum()
    }
}

impl Index<ParamId> for Genes {
    type Output = f64;

    fn index(&self, id: ParamId) -> &f64 {
        &self.0[id.index()]
    }
}

impl IndexMut<ParamId> for Genes {
    fn index_mut(&mut self, id: ParamId) -> &mut f64 {
        &mut self.0[id.index()]
    }
}

impl From<Genes> for BTreeMap<String, f64> {
    fn from(genes: Genes) -> Self {
        genes.iter().map(|(id, v)| (id.name().to_string(), v)).collect()
    }
}

impl TryFrom<BTreeMap<String, f64>> for Genes {
    type Error = String;

    fn try_from(map: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        let mut values = [0.0; ParamId::COUNT];
        for id in ParamId::ALL {
            values[id.index()] = *map
                .get(id.name())
                .ok_or_else(|| format!("missing parameter '{}'", id.name()))?;
        }
        Ok(Genes(values))
    }
}

// ============================================================================
// ParameterSpace
// ============================================================================

/// The ParameterSpec table, one entry per `ParamId`. Immutable for a run.
#[derive(Debug, Clone)]
pub struct ParameterSpace {
    specs: Vec<ParameterSpec>,
    /// Weight units that must add up to 1.0 (`1 / weight step`).
    weight_units: i64,
}

fn default_specs() -> Vec<ParameterSpec> {
    ParamId::ALL
        .iter()
        .map(|&id| {
            let n = id.name();
            match id {
                ParamId::WeightTechnical
                | ParamId::WeightMomentum
                | ParamId::WeightVolatility
                | ParamId::WeightVolume
                | ParamId::WeightSentiment
                | ParamId::WeightPattern
                | ParamId::WeightBreadth
                | ParamId::WeightCorrelation => ParameterSpec::new(n, 0.0, 0.6, 0.01, false),
                ParamId::BuyThreshold => ParameterSpec::new(n, 0.0, 0.6, 0.01, false),
                ParamId::SellThreshold => ParameterSpec::new(n, -0.8, 0.0, 0.01, false),
                ParamId::ConfidenceMin => ParameterSpec::new(n, 0.0, 0.6, 0.01, false),
                ParamId::MaxPositions => ParameterSpec::new(n, 1.0, 10.0, 1.0, true),
                ParamId::MaxPositionPct => ParameterSpec::new(n, 0.02, 0.5, 0.01, false),
                ParamId::AtrMultStop => ParameterSpec::new(n, 1.0, 4.0, 0.1, false),
                ParamId::AtrMultTarget => ParameterSpec::new(n, 1.5, 8.0, 0.1, false),
                ParamId::RsiPeriod => ParameterSpec::new(n, 7.0, 28.0, 1.0, true),
                ParamId::RsiOversold => ParameterSpec::new(n, 15.0, 40.0, 1.0, true),
                ParamId::RsiOverbought => ParameterSpec::new(n, 60.0, 85.0, 1.0, true),
                ParamId::MacdFast => ParameterSpec::new(n, 5.0, 15.0, 1.0, true),
                ParamId::MacdSlow => ParameterSpec::new(n, 20.0, 40.0, 1.0, true),
                ParamId::MacdSignal => ParameterSpec::new(n, 5.0, 12.0, 1.0, true),
                ParamId::BbPeriod => ParameterSpec::new(n, 10.0, 30.0, 1.0, true),
                ParamId::BbStdDev => ParameterSpec::new(n, 1.5, 3.0, 0.1, false),
                ParamId::AtrPeriod => ParameterSpec::new(n, 7.0, 28.0, 1.0, true),
                ParamId::MomentumShort => ParameterSpec::new(n, 3.0, 10.0, 1.0, true),
                ParamId::MomentumMedium => ParameterSpec::new(n, 15.0, 40.0, 1.0, true),
                ParamId::SmaShort => ParameterSpec::new(n, 5.0, 20.0, 1.0, true),
                ParamId::SmaMedium => ParameterSpec::new(n, 30.0, 100.0, 1.0, true),
            }
        })
        .collect()
}

impl Default for ParameterSpace {
    fn default() -> Self {
        // The built-in table always satisfies the weight-unit constraints.
        Self {
            specs: default_specs(),
            weight_units: 100,
        }
    }
}

impl ParameterSpace {
    /// Build the table from the defaults, replacing entries whose name matches an override.
    pub fn with_overrides(overrides: &[ParameterSpec]) -> EngineResult<Self> {
        let mut specs = default_specs();
        for spec in overrides {
            let id = ParamId::from_name(&spec.name)
                .ok_or_else(|| EngineError::invalid_parameter(&spec.name, "unknown parameter"))?;
            specs[id.index()] = spec.clone();
        }
        Self::from_specs(specs)
    }

    fn from_specs(specs: Vec<ParameterSpec>) -> EngineResult<Self> {
        for spec in &specs {
            spec.validate()?;
        }

        let weight_step = specs[ParamId::WeightTechnical.index()].step;
        for &w in &ParamId::WEIGHTS {
            let spec = &specs[w.index()];
            if (spec.step - weight_step).abs() > GRID_EPS {
                return Err(EngineError::invalid_parameter(
                    &spec.name,
                    "all weight parameters must share one step",
                ));
            }
            if spec.integer || spec.min < 0.0 {
                return Err(EngineError::invalid_parameter(
                    &spec.name,
                    "weights must be non-negative fractions",
                ));
            }
            let on_grid = |v: f64| ((v / weight_step) - (v / weight_step).round()).abs() < 1e-6;
            if !on_grid(spec.min) || !on_grid(spec.max) {
                return Err(EngineError::invalid_parameter(
                    &spec.name,
                    "weight bounds must be multiples of the weight step",
                ));
            }
        }

        let units = 1.0 / weight_step;
        if (units - units.round()).abs() > 1e-6 {
            return Err(EngineError::Configuration(format!(
                "weight step {} does not divide 1.0",
                weight_step
            )));
        }
        let weight_units = units.round() as i64;

        let space = Self {
            specs,
            weight_units,
        };
        let (lo, hi) = space.weight_unit_bounds();
        let (sum_lo, sum_hi): (i64, i64) = (lo.iter().sum(), hi.iter().sum());
        if sum_lo > weight_units || sum_hi < weight_units {
            return Err(EngineError::Configuration(
                "weight bounds cannot sum to 1.0".to_string(),
            ));
        }

        if space.spec(ParamId::MacdFast).max >= space.spec(ParamId::MacdSlow).min {
            return Err(EngineError::Configuration(
                "macd_fast range must lie below macd_slow range".to_string(),
            ));
        }

        Ok(space)
    }

    pub fn spec(&self, id: ParamId) -> &ParameterSpec {
        &self.specs[id.index()]
    }

    pub fn specs(&self) -> impl Iterator<Item = (ParamId, &ParameterSpec)> {
        ParamId::ALL.iter().map(move |&id| (id, &self.specs[id.index()]))
    }

    /// Center of every range, snapped and normalized.
    pub fn midpoint(&self) -> Genes {
        let mut genes = Genes([0.0; ParamId::COUNT]);
        for (id, spec) in self.specs() {
            genes[id] = spec.min + spec.range() / 2.0;
        }
        self.normalize(&mut genes);
        genes
    }

    pub fn random_genes<R: Rng>(&self, rng: &mut R) -> Genes {
        let mut genes = Genes([0.0; ParamId::COUNT]);
        for (id, spec) in self.specs() {
            genes[id] = spec.random(rng);
        }
        self.normalize(&mut genes);
        genes
    }

    /// Snap every value to its grid and renormalize the weight subset.
    pub fn normalize(&self, genes: &mut Genes) {
        for (id, spec) in self.specs() {
            genes[id] = spec.quantize(genes[id]);
        }
        self.renormalize_weights(genes);
    }

    /// Redistribute the weights as whole step units summing to exactly `1 / step`.
    ///
    /// Largest-remainder allocation, bounded per weight by its own min/max, so
    /// the result is both on-grid and sums to 1.0.
    pub fn renormalize_weights(&self, genes: &mut Genes) {
        let step = self.spec(ParamId::WeightTechnical).step;
        let total = self.weight_units;
        let (lo, hi) = self.weight_unit_bounds();

        let values: Vec<f64> = ParamId::WEIGHTS
            .iter()
            .map(|&w| {
                let v = genes[w];
                if v.is_finite() {
                    v.max(0.0)
                } else {
                    0.0
                }
            })
            .collect();
        let sum: f64 = values.iter().sum();
        let n = values.len();
        let raw: Vec<f64> = values
            .iter()
            .map(|&v| {
                if sum > 0.0 {
                    v / sum * total as f64
                } else {
                    total as f64 / n as f64
                }
            })
            .collect();

        let mut units: Vec<i64> = raw
            .iter()
            .enumerate()
            .map(|(i, r)| (r.floor() as i64).clamp(lo[i], hi[i]))
            .collect();
        let mut assigned: i64 = units.iter().sum();

        while assigned < total {
            let pick = (0..n)
                .filter(|&i| units[i] < hi[i])
                .max_by(|&a, &b| {
                    let ra = raw[a] - units[a] as f64;
                    let rb = raw[b] - units[b] as f64;
                    // prefer the lower index on ties
                    ra.partial_cmp(&rb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.cmp(&a))
                });
            match pick {
                Some(i) => {
                    units[i] += 1;
                    assigned += 1;
                }
                None => break,
            }
        }
        while assigned > total {
            let pick = (0..n).filter(|&i| units[i] > lo[i]).min_by(|&a, &b| {
                let ra = raw[a] - units[a] as f64;
                let rb = raw[b] - units[b] as f64;
                ra.partial_cmp(&rb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            });
            match pick {
                Some(i) => {
                    units[i] -= 1;
                    assigned -= 1;
                }
                None => break,
            }
        }

        for (i, &w) in ParamId::WEIGHTS.iter().enumerate() {
            genes[w] = units[i] as f64 * step;
        }
    }

    fn weight_unit_bounds(&self) -> (Vec<i64>, Vec<i64>) {
        let step = self.spec(ParamId::WeightTechnical).step;
        ParamId::WEIGHTS
            .iter()
            .map(|&w| {
                let spec = self.spec(w);
                ((spec.min / step).round() as i64, (spec.max / step).round() as i64)
            })
            .unzip()
    }

    /// Step indices of every value; two genomes are structurally equal iff their keys are.
    pub fn structural_key(&self, genes: &Genes) -> Vec<i64> {
        self.specs()
            .map(|(id, spec)| spec.step_index(genes[id]))
            .collect()
    }

    /// Fraction of structurally unique parameter sets in `population`.
    pub fn unique_fraction<'a>(&self, population: impl IntoIterator<Item = &'a Genes>) -> f64 {
        let mut seen = HashSet::new();
        let mut total = 0usize;
        for genes in population {
            total += 1;
            seen.insert(self.structural_key(genes));
        }
        if total == 0 {
            return 1.0;
        }
        seen.len() as f64 / total as f64
    }

    /// Range, grid and weight-sum invariants all hold.
    pub fn is_valid(&self, genes: &Genes) -> bool {
        let on_grid = self.specs().all(|(id, spec)| spec.contains(genes[id]));
        on_grid && (genes.weight_sum() - 1.0).abs() <= 1e-6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_param_names_round_trip() {
        for id in ParamId::ALL {
            assert_eq!(ParamId::from_name(id.name()), Some(id));
            assert_eq!(ParamId::ALL[id.index()], id);
        }
        assert_eq!(ParamId::from_name("no_such_param"), None);
    }

    #[test]
    fn test_quantize_clamps_and_snaps() {
        let spec = ParameterSpec::new("x", 1.0, 4.0, 0.1, false);
        assert!((spec.quantize(2.34) - 2.3).abs() < 1e-9);
        assert_eq!(spec.quantize(-5.0), 1.0);
        assert!((spec.quantize(99.0) - 4.0).abs() < 1e-9);
        assert_eq!(spec.quantize(f64::NAN), 1.0);

        let int_spec = ParameterSpec::new("n", 7.0, 28.0, 1.0, true);
        assert_eq!(int_spec.quantize(13.6), 14.0);
    }

    #[test]
    fn test_random_genes_satisfy_invariants() {
        let space = ParameterSpace::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let genes = space.random_genes(&mut rng);
            assert!(space.is_valid(&genes), "invalid genes: {:?}", genes);
        }
    }

    #[test]
    fn test_renormalize_keeps_grid_and_sum() {
        let space = ParameterSpace::default();
        let mut genes = space.midpoint();
        genes[ParamId::WeightTechnical] = 0.33;
        genes[ParamId::WeightMomentum] = 0.33;
        genes[ParamId::WeightVolatility] = 0.33;
        for &w in &ParamId::WEIGHTS[3..] {
            genes[w] = 0.0;
        }
        space.renormalize_weights(&mut genes);
        assert!((genes.weight_sum() - 1.0).abs() < 1e-9);
        assert!(space.is_valid(&genes));
        // 99 units spread 33/33/33, the leftover unit goes to the first weight
        assert!((genes[ParamId::WeightTechnical] - 0.34).abs() < 1e-9);
    }

    #[test]
    fn test_renormalize_all_zero_weights_spreads_evenly() {
        let space = ParameterSpace::default();
        let mut genes = space.midpoint();
        for &w in &ParamId::WEIGHTS {
            genes[w] = 0.0;
        }
        space.renormalize_weights(&mut genes);
        assert!((genes.weight_sum() - 1.0).abs() < 1e-9);
        for &w in &ParamId::WEIGHTS {
            assert!(genes[w] >= 0.12 && genes[w] <= 0.13);
        }
    }

    #[test]
    fn test_override_rejects_inverted_range() {
        let bad = ParameterSpec::new("rsi_period", 30.0, 10.0, 1.0, true);
        let err = ParameterSpace::with_overrides(&[bad]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter { .. }));
    }

    #[test]
    fn test_override_rejects_unknown_name() {
        let bad = ParameterSpec::new("lunar_phase", 0.0, 1.0, 0.1, false);
        assert!(ParameterSpace::with_overrides(&[bad]).is_err());
    }

    #[test]
    fn test_override_applies() {
        let spec = ParameterSpec::new("max_positions", 2.0, 4.0, 1.0, true);
        let space = ParameterSpace::with_overrides(&[spec.clone()]).unwrap();
        assert_eq!(space.spec(ParamId::MaxPositions), &spec);
    }

    #[test]
    fn test_unique_fraction_of_identical_population() {
        let space = ParameterSpace::default();
        let genes = space.midpoint();
        let population = vec![genes; 50];
        let fraction = space.unique_fraction(population.iter());
        assert!((fraction - 1.0 / 50.0).abs() < 1e-12);
    }

    #[test]
    fn test_genes_serialize_as_named_map() {
        let space = ParameterSpace::default();
        let genes = space.midpoint();
        let json = serde_json::to_value(genes).unwrap();
        assert!(json.get("rsi_period").is_some());
        assert!(json.get("weight_breadth").is_some());
        let back: Genes = serde_json::from_value(json).unwrap();
        assert_eq!(back, genes);
    }
}
