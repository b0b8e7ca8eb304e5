//! Genetic operators: tournament selection, crossover and mutation
//!
//! Every operator ends with `ParameterSpace::normalize`, so children are
//! always on-grid with weights summing to one.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::genome::Genome;
use crate::learning::LearningEngine;
use crate::params::{Genes, ParamId, ParameterSpace};

/// Chance a crossover gene is copied from the first parent.
const TAKE_FIRST: f64 = 0.35;
/// Chance a crossover gene is copied from the second parent.
const TAKE_SECOND: f64 = 0.35;

/// Per-gene crossover outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeneChoice {
    First,
    Second,
    /// `alpha · p1 + (1 - alpha) · p2`
    Blend(f64),
}

/// Fittest of `size` genomes sampled with replacement. `None` for an empty pool.
pub fn tournament_select<'a, R: Rng>(
    pool: &'a [Genome],
    size: usize,
    rng: &mut R,
) -> Option<&'a Genome> {
    if pool.is_empty() {
        return None;
    }
    let mut best: Option<&Genome> = None;
    for _ in 0..size.max(1) {
        let candidate = &pool[rng.gen_range(0..pool.len())];
        if best.map_or(true, |b| candidate.fitness > b.fitness) {
            best = Some(candidate);
        }
    }
    best
}

/// Uniform/blend crossover with the standard 35/35/30 split.
pub fn crossover_genes<R: Rng>(p1: &Genes, p2: &Genes, space: &ParameterSpace, rng: &mut R) -> Genes {
    crossover_genes_with(p1, p2, space, |_| {
        let roll: f64 = rng.gen();
        if roll < TAKE_FIRST {
            GeneChoice::First
        } else if roll < TAKE_FIRST + TAKE_SECOND {
            GeneChoice::Second
        } else {
            GeneChoice::Blend(rng.gen())
        }
    })
}

/// Crossover with the per-gene decision supplied by `choose`.
pub fn crossover_genes_with<F>(p1: &Genes, p2: &Genes, space: &ParameterSpace, mut choose: F) -> Genes
where
    F: FnMut(ParamId) -> GeneChoice,
{
    let mut child = *p1;
    for id in ParamId::ALL {
        child[id] = match choose(id) {
            GeneChoice::First => p1[id],
            GeneChoice::Second => p2[id],
            GeneChoice::Blend(alpha) => {
                let alpha = alpha.clamp(0.0, 1.0);
                space.spec(id).quantize(alpha * p1[id] + (1.0 - alpha) * p2[id])
            }
        };
    }
    space.normalize(&mut child);
    child
}

/// Mutation knobs resolved for one generation.
#[derive(Debug, Clone, Copy)]
pub struct MutationParams {
    pub rate: f64,
    pub guided_prob: f64,
    /// Gaussian std-dev as a fraction of each parameter's range
    pub sigma: f64,
}

/// Mutate each gene independently at `params.rate`; returns the mutated ids.
pub fn mutate<R: Rng>(
    genes: &mut Genes,
    params: MutationParams,
    space: &ParameterSpace,
    learning: &LearningEngine,
    rng: &mut R,
) -> Vec<ParamId> {
    let suggestions = learning.suggest_guided_mutation(genes, space);
    let mut mutated = Vec::new();

    for id in ParamId::ALL {
        if rng.gen::<f64>() >= params.rate {
            continue;
        }

        let guided = if rng.gen::<f64>() < params.guided_prob {
            suggestions.iter().find(|(s, _)| *s == id).map(|(_, v)| *v)
        } else {
            None
        };

        let spec = space.spec(id);
        let value = match guided {
            Some(v) => v,
            None => {
                let sigma = spec.range() * params.sigma;
                match Normal::new(0.0, sigma) {
                    Ok(noise) if sigma > 0.0 => spec.quantize(genes[id] + noise.sample(rng)),
                    _ => genes[id],
                }
            }
        };

        if value != genes[id] {
            genes[id] = value;
            mutated.push(id);
        }
    }

    space.normalize(genes);
    mutated
}
