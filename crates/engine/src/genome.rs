//! Genome: one candidate parameter assignment plus its evaluation record

use serde::{Deserialize, Serialize};

use crate::fitness::FAILED_FITNESS;
use crate::params::{Genes, ParamId};
use crate::regime::Regime;
use crate::types::BacktestResult;

/// Headline metrics copied from the genome's last backtest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenomeMetrics {
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub win_rate: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub total_trades: u32,
}

impl From<&BacktestResult> for GenomeMetrics {
    fn from(r: &BacktestResult) -> Self {
        Self {
            sharpe: r.sharpe_ratio,
            sortino: r.sortino_ratio,
            calmar: r.calmar_ratio,
            win_rate: r.win_rate,
            total_return: r.total_return,
            max_drawdown: r.max_drawdown,
            total_trades: r.total_trades,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Genome {
    pub id: u64,
    pub genes: Genes,
    /// 0 until evaluated
    pub fitness: f64,
    pub evaluated: bool,
    pub metrics: GenomeMetrics,
    pub generation: u32,
    pub island: usize,
    /// Empty for random genomes, one id for mutation or migration, two for crossover
    pub parents: Vec<u64>,
    pub mutations: Vec<ParamId>,
    /// Regime on the last bar of this genome's backtest
    pub regime: Regime,
    pub eval_ms: u64,
}

impl Genome {
    pub fn new(id: u64, genes: Genes, generation: u32, island: usize) -> Self {
        Self {
            id,
            genes,
            fitness: 0.0,
            evaluated: false,
            metrics: GenomeMetrics::default(),
            generation,
            island,
            parents: Vec::new(),
            mutations: Vec::new(),
            regime: Regime::Unknown,
            eval_ms: 0,
        }
    }

    pub fn with_parents(mut self, parents: Vec<u64>) -> Self {
        self.parents = parents;
        self
    }

    pub fn record(&mut self, result: &BacktestResult, fitness: f64, eval_ms: u64) {
        self.fitness = fitness;
        self.evaluated = true;
        self.metrics = GenomeMetrics::from(result);
        self.regime = result.final_regime;
        self.eval_ms = eval_ms;
    }

    /// Failed evaluations score the sentinel and are never retried.
    pub fn record_failure(&mut self, eval_ms: u64) {
        self.fitness = FAILED_FITNESS;
        self.evaluated = true;
        self.metrics = GenomeMetrics::default();
        self.eval_ms = eval_ms;
    }
}

/// Monotonic genome id source, owned by the optimizer.
#[derive(Debug, Default)]
pub struct GenomeIds {
    next: u64,
}

impl GenomeIds {
    pub fn next_id(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterSpace;

    #[test]
    fn test_record_and_failure() {
        let genes = ParameterSpace::default().midpoint();
        let mut g = Genome::new(1, genes, 0, 0);
        assert!(!g.evaluated);
        assert_eq!(g.fitness, 0.0);

        let mut result = BacktestResult::empty(1_000.0);
        result.total_trades = 42;
        result.final_regime = Regime::Ranging;
        g.record(&result, 12.5, 7);
        assert!(g.evaluated);
        assert_eq!(g.fitness, 12.5);
        assert_eq!(g.metrics.total_trades, 42);
        assert_eq!(g.regime, Regime::Ranging);

        g.record_failure(3);
        assert_eq!(g.fitness, FAILED_FITNESS);
        assert_eq!(g.eval_ms, 3);
    }

    #[test]
    fn test_ids_are_unique() {
        let mut ids = GenomeIds::default();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a > 0);
    }
}
