//! Learning engine: parameter/fitness correlations, adaptive mutation rate,
//! convergence detection and per-regime bests.
//!
//! Owned by the optimizer and reset only when a new optimizer is built.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OptimizerConfig;
use crate::genome::Genome;
use crate::params::{Genes, ParamId, ParameterSpace};
use crate::regime::Regime;

/// |correlation| above which an insight is reported.
const INSIGHT_THRESHOLD: f64 = 0.15;
/// |correlation| above which guided mutation nudges a parameter.
const GUIDANCE_THRESHOLD: f64 = 0.2;
/// Grid steps a guided nudge moves a parameter.
const GUIDED_STEPS: i64 = 2;
/// Generations compared by the adaptive mutation rate.
const RATE_WINDOW: usize = 10;
const MIN_POPULATION: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub generation: u32,
    pub param: ParamId,
    pub correlation: f64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct LearningEngine {
    correlations: [f64; ParamId::COUNT],
    fitness_history: Vec<f64>,
    best_by_regime: BTreeMap<Regime, Genome>,
    insights: Vec<Insight>,
    base_rate: f64,
    max_rate: f64,
    convergence_threshold: f64,
    convergence_window: usize,
}

impl LearningEngine {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            correlations: [0.0; ParamId::COUNT],
            fitness_history: Vec::new(),
            best_by_regime: BTreeMap::new(),
            insights: Vec::new(),
            base_rate: config.initial_mutation_rate,
            max_rate: config.max_mutation_rate,
            convergence_threshold: config.convergence_threshold,
            convergence_window: config.convergence_window,
        }
    }

    /// Update correlations and regime bests from the whole evaluated population.
    pub fn learn(&mut self, population: &[&Genome], generation: u32) -> &[Insight] {
        for genome in population.iter().filter(|g| g.evaluated) {
            let better = self
                .best_by_regime
                .get(&genome.regime)
                .map_or(true, |best| genome.fitness > best.fitness);
            if better {
                self.best_by_regime.insert(genome.regime, (*genome).clone());
            }
        }

        let mut ranked: Vec<&Genome> = population.iter().copied().filter(|g| g.evaluated).collect();
        if ranked.len() < MIN_POPULATION {
            self.insights.clear();
            return &self.insights;
        }
        ranked.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));

        let decile = (ranked.len() / 10).max(1);
        let top = &ranked[..decile];
        let bottom = &ranked[ranked.len() - decile..];
        let mean_of = |group: &[&Genome], id: ParamId| {
            group.iter().map(|g| g.genes[id]).sum::<f64>() / group.len() as f64
        };

        let mut insights = Vec::new();
        for id in ParamId::ALL {
            let mean = mean_of(&ranked[..], id);
            let correlation = if mean.abs() < 1e-12 {
                0.0
            } else {
                (mean_of(top, id) - mean_of(bottom, id)) / mean.abs()
            };
            self.correlations[id.index()] = correlation;

            if correlation.abs() > INSIGHT_THRESHOLD {
                let direction = if correlation > 0.0 { "higher" } else { "lower" };
                let message = format!(
                    "{} {} values favored (correlation {:+.2})",
                    id, direction, correlation
                );
                debug!(generation, param = %id, correlation, "Insight");
                insights.push(Insight {
                    generation,
                    param: id,
                    correlation,
                    message,
                });
            }
        }

        self.insights = insights;
        &self.insights
    }

    pub fn correlation(&self, id: ParamId) -> f64 {
        self.correlations[id.index()]
    }

    pub fn insights(&self) -> &[Insight] {
        &self.insights
    }

    pub fn best_by_regime(&self) -> &BTreeMap<Regime, Genome> {
        &self.best_by_regime
    }

    pub fn fitness_history(&self) -> &[f64] {
        &self.fitness_history
    }

    /// Record this generation's average fitness and return the mutation rate to use.
    pub fn adaptive_mutation_rate(&mut self, avg_fitness: f64) -> f64 {
        self.fitness_history.push(avg_fitness);
        let n = self.fitness_history.len();
        if n < RATE_WINDOW {
            return self.base_rate;
        }

        let oldest = self.fitness_history[n - RATE_WINDOW];
        let newest = self.fitness_history[n - 1];
        let improvement = if oldest.abs() > 1e-12 {
            (newest - oldest) / oldest.abs()
        } else {
            newest - oldest
        };

        if improvement.abs() < self.convergence_threshold {
            (self.base_rate * 2.5).min(self.max_rate)
        } else if improvement > 0.05 {
            self.base_rate * 0.6
        } else {
            self.base_rate
        }
    }

    /// Two-step nudges toward the favored end of every strongly correlated parameter.
    pub fn suggest_guided_mutation(
        &self,
        genes: &Genes,
        space: &ParameterSpace,
    ) -> Vec<(ParamId, f64)> {
        ParamId::ALL
            .iter()
            .filter_map(|&id| {
                let corr = self.correlation(id);
                if corr.abs() <= GUIDANCE_THRESHOLD {
                    return None;
                }
                let spec = space.spec(id);
                let k = spec.step_index(genes[id]) + GUIDED_STEPS * corr.signum() as i64;
                Some((id, spec.value_at(k.clamp(0, spec.max_steps()))))
            })
            .collect()
    }

    /// Average fitness has stopped moving over the convergence window.
    pub fn is_converged(&self) -> bool {
        let n = self.fitness_history.len();
        if n < self.convergence_window {
            return false;
        }
        let window = &self.fitness_history[n - self.convergence_window..];
        let mean = window.iter().sum::<f64>() / window.len() as f64;
        let variance =
            window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window.len() as f64;
        variance < self.convergence_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn population(space: &ParameterSpace) -> Vec<Genome> {
        let mut rng = StdRng::seed_from_u64(3);
        (0..40)
            .map(|i| {
                let mut g = Genome::new(i + 1, space.random_genes(&mut rng), 0, 0);
                // fitness driven entirely by rsi_period
                g.fitness = g.genes[ParamId::RsiPeriod];
                g.evaluated = true;
                g
            })
            .collect()
    }

    #[test]
    fn test_correlation_finds_driving_parameter() {
        let space = ParameterSpace::default();
        let pop = population(&space);
        let refs: Vec<&Genome> = pop.iter().collect();
        let mut learning = LearningEngine::new(&OptimizerConfig::default());

        let insights = learning.learn(&refs, 1).to_vec();
        assert!(learning.correlation(ParamId::RsiPeriod) > 0.15);
        assert!(insights.iter().any(|i| i.param == ParamId::RsiPeriod));
    }

    #[test]
    fn test_small_population_yields_no_insights() {
        let space = ParameterSpace::default();
        let pop = population(&space);
        let refs: Vec<&Genome> = pop.iter().take(5).collect();
        let mut learning = LearningEngine::new(&OptimizerConfig::default());
        assert!(learning.learn(&refs, 1).is_empty());
        assert_eq!(learning.correlation(ParamId::RsiPeriod), 0.0);
    }

    #[test]
    fn test_guided_mutation_moves_two_steps() {
        let space = ParameterSpace::default();
        let pop = population(&space);
        let refs: Vec<&Genome> = pop.iter().collect();
        let mut learning = LearningEngine::new(&OptimizerConfig::default());
        learning.learn(&refs, 1);

        let mut genes = space.midpoint();
        genes.set(ParamId::RsiPeriod, 15.0);
        let suggestions = learning.suggest_guided_mutation(&genes, &space);
        let rsi = suggestions
            .iter()
            .find(|(id, _)| *id == ParamId::RsiPeriod)
            .map(|(_, v)| *v);
        assert_eq!(rsi, Some(17.0));

        // clamped at the top of the range
        genes.set(ParamId::RsiPeriod, 28.0);
        let suggestions = learning.suggest_guided_mutation(&genes, &space);
        assert!(suggestions.contains(&(ParamId::RsiPeriod, 28.0)));
    }

    #[test]
    fn test_adaptive_rate() {
        let config = OptimizerConfig::default();
        let mut learning = LearningEngine::new(&config);

        // below ten samples: base rate
        for _ in 0..9 {
            assert_eq!(learning.adaptive_mutation_rate(10.0), config.initial_mutation_rate);
        }
        // stuck: mutate harder
        let stuck = learning.adaptive_mutation_rate(10.0);
        assert!((stuck - config.initial_mutation_rate * 2.5).abs() < 1e-12);

        // fast progress: mutate gently
        let mut learning = LearningEngine::new(&config);
        for i in 0..10 {
            learning.adaptive_mutation_rate(10.0 + i as f64 * 2.0);
        }
        let gentle = learning.adaptive_mutation_rate(40.0);
        assert!((gentle - config.initial_mutation_rate * 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_stuck_rate_respects_cap() {
        let config = OptimizerConfig {
            initial_mutation_rate: 0.3,
            max_mutation_rate: 0.5,
            ..OptimizerConfig::default()
        };
        let mut learning = LearningEngine::new(&config);
        let mut rate = 0.0;
        for _ in 0..10 {
            rate = learning.adaptive_mutation_rate(5.0);
        }
        assert_eq!(rate, 0.5);
    }

    #[test]
    fn test_convergence_needs_full_window() {
        let mut learning = LearningEngine::new(&OptimizerConfig::default());
        for _ in 0..29 {
            learning.adaptive_mutation_rate(50.0);
        }
        assert!(!learning.is_converged());
        learning.adaptive_mutation_rate(50.0);
        assert!(learning.is_converged());

        learning.adaptive_mutation_rate(80.0);
        assert!(!learning.is_converged());
    }

    #[test]
    fn test_best_by_regime() {
        let space = ParameterSpace::default();
        let mut pop = population(&space);
        pop[0].regime = Regime::StrongBull;
        pop[0].fitness = 1_000.0;
        let refs: Vec<&Genome> = pop.iter().collect();
        let mut learning = LearningEngine::new(&OptimizerConfig::default());
        learning.learn(&refs, 1);

        assert_eq!(learning.best_by_regime()[&Regime::StrongBull].id, pop[0].id);
        assert!(learning.best_by_regime().contains_key(&Regime::Unknown));
    }
}
