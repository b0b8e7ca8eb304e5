//! Island-model genetic optimizer
//!
//! Evolves several independent sub-populations of strategy genomes. Each
//! generation evaluates every unscored genome in concurrent batches, offers
//! improvements to the Judge, migrates elites around a ring, guards
//! diversity, then breeds the next generation with elitism. The run stops on
//! convergence, budget exhaustion or cancellation (checked between
//! generations only).

use std::sync::{atomic::Ordering, Arc};
use std::time::Instant;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{BacktestSettings, OptimizerConfig};
use crate::engine::BacktestEngine;
use crate::error::EngineResult;
use crate::fitness::fitness;
use crate::genome::{Genome, GenomeIds};
use crate::judge::{Judge, Judgement};
use crate::learning::LearningEngine;
use crate::market::MarketData;
use crate::operators::{self, MutationParams};
use crate::params::{Genes, ParameterSpace};
use crate::report::{
    CheckpointSink, CheckpointSnapshot, EvolutionProgress, EvolutionStatus, NullSink,
    ProgressRecord, ProgressSink,
};
use crate::types::BacktestResult;

// ============================================================================
// Evaluation
// ============================================================================

/// Scores one parameter set. Runs on blocking worker threads.
pub trait Evaluator: Send + Sync + 'static {
    fn evaluate(&self, genes: &Genes) -> EngineResult<BacktestResult>;
}

/// Evaluator backed by the backtest engine over shared, read-only market data.
pub struct BacktestEvaluator {
    market: Arc<MarketData>,
    settings: BacktestSettings,
}

impl BacktestEvaluator {
    pub fn new(market: Arc<MarketData>, settings: BacktestSettings) -> Self {
        Self { market, settings }
    }
}

impl Evaluator for BacktestEvaluator {
    fn evaluate(&self, genes: &Genes) -> EngineResult<BacktestResult> {
        BacktestEngine::run(&self.market, genes, &self.settings)
    }
}

// ============================================================================
// Types
// ============================================================================

/// Accepted global best with the evidence it was accepted on.
#[derive(Debug, Clone)]
pub struct BestRecord {
    pub genome: Genome,
    pub result: BacktestResult,
    pub judgement: Judgement,
}

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    pub status: EvolutionStatus,
    pub generations: u32,
    pub total_evaluations: u64,
    pub best: Option<BestRecord>,
    /// Highest-fitness candidate the judge rejected, reported only when
    /// `best` is `None`
    pub unaccepted: Option<BestRecord>,
    pub snapshot: CheckpointSnapshot,
}

type EvalOutcome = (usize, usize, EngineResult<BacktestResult>, u64);

pub struct GeneticOptimizer {
    config: OptimizerConfig,
    space: ParameterSpace,
    evaluator: Arc<dyn Evaluator>,
    judge: Judge,
    learning: LearningEngine,
    islands: Vec<Vec<Genome>>,
    ids: GenomeIds,
    rng: StdRng,
    best: Option<BestRecord>,
    top_rejected: Option<BestRecord>,
    generation: u32,
    total_evaluations: u64,
    mutation_rate: f64,
    run_id: String,
    progress: Arc<EvolutionProgress>,
    checkpoint_sink: Arc<dyn CheckpointSink>,
    progress_sink: Arc<dyn ProgressSink>,
}

impl GeneticOptimizer {
    pub fn new(
        config: OptimizerConfig,
        space: ParameterSpace,
        evaluator: Arc<dyn Evaluator>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            learning: LearningEngine::new(&config),
            mutation_rate: config.initial_mutation_rate,
            config,
            space,
            evaluator,
            judge: Judge::new(),
            islands: Vec::new(),
            ids: GenomeIds::default(),
            rng,
            best: None,
            top_rejected: None,
            generation: 0,
            total_evaluations: 0,
            run_id: format!("run-{}", Utc::now().format("%Y%m%d-%H%M%S")),
            progress: Arc::new(EvolutionProgress::new()),
            checkpoint_sink: Arc::new(NullSink),
            progress_sink: Arc::new(NullSink),
        })
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_progress(mut self, progress: Arc<EvolutionProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_checkpoint_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoint_sink = sink;
        self
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress_sink = sink;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn progress(&self) -> Arc<EvolutionProgress> {
        Arc::clone(&self.progress)
    }

    pub fn islands(&self) -> &[Vec<Genome>] {
        &self.islands
    }

    pub fn best(&self) -> Option<&BestRecord> {
        self.best.as_ref()
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Evolve until converged, out of budget, or cancelled.
    pub async fn run(mut self) -> EngineResult<OptimizationOutcome> {
        let started = Instant::now();
        self.progress.reset();
        self.initialize();

        info!(
            run_id = %self.run_id,
            islands = self.config.islands,
            population = self.config.population_size,
            max_generations = self.config.max_generations,
            "Starting evolution"
        );

        let status = loop {
            if self.progress.is_cancelled() {
                warn!(generation = self.generation, "Evolution cancelled");
                break EvolutionStatus::Cancelled;
            }
            if self.budget_exhausted(started) {
                break EvolutionStatus::BudgetExhausted;
            }

            self.step(started).await;

            if self.generation >= self.config.convergence_min_generation
                && self.learning.is_converged()
            {
                info!(generation = self.generation, "Average fitness converged");
                break EvolutionStatus::Converged;
            }
        };

        self.progress.set_status(status);
        let snapshot = self.snapshot();
        self.save_checkpoint(&snapshot).await;

        info!(
            run_id = %self.run_id,
            ?status,
            generations = self.generation,
            evaluations = self.total_evaluations,
            best = ?snapshot.best_fitness(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Evolution complete"
        );
        if self.best.is_none() {
            warn!(
                top_rejected = ?self.top_rejected.as_ref().map(|r| r.genome.fitness),
                "No result passed the judge; run has no global best"
            );
        }

        let unaccepted = match self.best {
            Some(_) => None,
            None => self.top_rejected,
        };
        Ok(OptimizationOutcome {
            status,
            generations: self.generation,
            total_evaluations: self.total_evaluations,
            best: self.best,
            unaccepted,
            snapshot,
        })
    }

    /// Random genomes for every island.
    pub fn initialize(&mut self) {
        let mut islands = Vec::with_capacity(self.config.islands);
        for island in 0..self.config.islands {
            let mut pop = Vec::with_capacity(self.config.population_size);
            for _ in 0..self.config.population_size {
                pop.push(self.random_genome(island));
            }
            islands.push(pop);
        }
        self.islands = islands;
    }

    fn random_genome(&mut self, island: usize) -> Genome {
        let genes = self.space.random_genes(&mut self.rng);
        Genome::new(self.ids.next_id(), genes, self.generation, island)
    }

    fn budget_exhausted(&self, started: Instant) -> bool {
        if self.generation >= self.config.max_generations {
            return true;
        }
        if let Some(max) = self.config.max_evaluations {
            if self.total_evaluations >= max {
                return true;
            }
        }
        if let Some(secs) = self.config.max_duration_secs {
            if started.elapsed().as_secs() >= secs {
                return true;
            }
        }
        false
    }

    /// One full generation. Always runs to completion.
    async fn step(&mut self, started: Instant) {
        self.evaluate_pending().await;

        let generation = self.generation;
        if self.config.migration_interval > 0
            && generation > 0
            && generation % self.config.migration_interval == 0
        {
            self.migrate();
        }

        if generation > self.config.diversity_min_generation {
            let diversity = self.diversity();
            if diversity < self.config.diversity_threshold {
                let injected = self.inject_diversity();
                info!(generation, diversity, injected, "Diversity low, injected random genomes");
                self.evaluate_pending().await;
            }
        }

        let population: Vec<&Genome> = self.islands.iter().flatten().collect();
        self.learning.learn(&population, generation);
        let avg_fitness = average_fitness(&population);
        self.mutation_rate = self.learning.adaptive_mutation_rate(avg_fitness);

        if self.config.report_interval > 0 && generation % self.config.report_interval == 0 {
            self.report(avg_fitness, started).await;
        }
        if self.config.checkpoint_interval > 0
            && generation > 0
            && generation % self.config.checkpoint_interval == 0
        {
            let snapshot = self.snapshot();
            self.save_checkpoint(&snapshot).await;
        }

        for island in 0..self.islands.len() {
            self.breed_island(island);
        }

        self.generation += 1;
        self.progress.generation.store(self.generation, Ordering::Relaxed);
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Score every genome not yet evaluated, `batch_size` at a time.
    pub async fn evaluate_pending(&mut self) {
        let pending: Vec<(usize, usize)> = self
            .islands
            .iter()
            .enumerate()
            .flat_map(|(i, pop)| {
                pop.iter()
                    .enumerate()
                    .filter(|(_, g)| !g.evaluated)
                    .map(move |(j, _)| (i, j))
            })
            .collect();

        for batch in pending.chunks(self.config.batch_size) {
            let mut set: JoinSet<EvalOutcome> = JoinSet::new();
            for &(island, idx) in batch {
                let genes = self.islands[island][idx].genes;
                let evaluator = Arc::clone(&self.evaluator);
                set.spawn_blocking(move || {
                    let t0 = Instant::now();
                    let result = evaluator.evaluate(&genes);
                    (island, idx, result, t0.elapsed().as_millis() as u64)
                });
            }

            let mut finished: Vec<EvalOutcome> = Vec::with_capacity(batch.len());
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(outcome) => finished.push(outcome),
                    Err(e) => warn!(error = %e, "Evaluation task failed"),
                }
            }
            // completion order is nondeterministic; acceptance order must not be
            finished.sort_by_key(|(island, idx, _, _)| (*island, *idx));

            for (island, idx, result, eval_ms) in finished {
                match result {
                    Ok(result) => self.record_evaluation(island, idx, result, eval_ms),
                    Err(e) => {
                        let genome = &mut self.islands[island][idx];
                        warn!(genome = genome.id, error = %e, "Evaluation failed");
                        genome.record_failure(eval_ms);
                    }
                }
            }

            // panicked tasks never reported back
            for &(island, idx) in batch {
                let genome = &mut self.islands[island][idx];
                if !genome.evaluated {
                    genome.record_failure(0);
                }
            }

            self.total_evaluations += batch.len() as u64;
            self.progress
                .evaluations
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            debug!(batch = batch.len(), total = self.total_evaluations, "Batch evaluated");
        }
    }

    fn record_evaluation(&mut self, island: usize, idx: usize, result: BacktestResult, eval_ms: u64) {
        let score = fitness(&result);
        let genome = &mut self.islands[island][idx];
        genome.record(&result, score, eval_ms);

        let improves = self
            .best
            .as_ref()
            .map_or(true, |b| score > b.genome.fitness);
        if !improves {
            return;
        }

        let judgement = self.judge.evaluate(&result);
        if !judgement.accepts() {
            debug!(
                genome = genome.id,
                fitness = score,
                warnings = ?judgement.warnings,
                "Judge rejected candidate best"
            );
            let top = self
                .top_rejected
                .as_ref()
                .map_or(true, |r| score > r.genome.fitness);
            if top {
                self.top_rejected = Some(BestRecord {
                    genome: genome.clone(),
                    result,
                    judgement,
                });
            }
            return;
        }

        info!(
            generation = self.generation,
            genome = genome.id,
            fitness = score,
            verdict = %judgement.verdict,
            sharpe = result.sharpe_ratio,
            trades = result.total_trades,
            "New global best"
        );
        self.progress.set_best_fitness(score);
        self.best = Some(BestRecord {
            genome: genome.clone(),
            result,
            judgement,
        });
    }

    // ========================================================================
    // Migration and diversity
    // ========================================================================

    /// Ring migration: every island sends clones of its top genomes to the next
    /// one. Emigrants are chosen before any island changes, and each receiver
    /// drops its worst residents before the migrants land, so arrivals are
    /// never evicted.
    pub fn migrate(&mut self) {
        let n = self.islands.len();
        let count = self.config.migration_count;
        if n < 2 || count == 0 {
            return;
        }

        let emigrants: Vec<Vec<Genome>> = self
            .islands
            .iter()
            .map(|pop| {
                let mut ranked: Vec<&Genome> = pop.iter().collect();
                ranked.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
                ranked.into_iter().take(count).cloned().collect()
            })
            .collect();

        for (source, migrants) in emigrants.into_iter().enumerate() {
            let dest = (source + 1) % n;
            let arriving = migrants.len();
            let pop = &mut self.islands[dest];
            pop.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
            pop.truncate(pop.len().saturating_sub(arriving));

            for migrant in migrants {
                let mut clone = migrant.clone();
                clone.id = self.ids.next_id();
                clone.island = dest;
                clone.parents = vec![migrant.id];
                clone.mutations.clear();
                self.islands[dest].push(clone);
            }
        }

        debug!(generation = self.generation, count, "Migrated elites around the ring");
    }

    /// Fraction of structurally unique genomes across all islands.
    pub fn diversity(&self) -> f64 {
        self.space
            .unique_fraction(self.islands.iter().flatten().map(|g| &g.genes))
    }

    /// Replace each island's worst performers with fresh random genomes.
    /// Elites are never replaced. Returns the number injected.
    pub fn inject_diversity(&mut self) -> usize {
        let mut injected = 0;
        for island in 0..self.islands.len() {
            let len = self.islands[island].len();
            let wanted = (len as f64 * self.config.diversity_injection_fraction).ceil() as usize;
            let replace = wanted.min(len.saturating_sub(self.config.elite_count));

            let mut pop = std::mem::take(&mut self.islands[island]);
            pop.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
            pop.truncate(len - replace);
            for _ in 0..replace {
                pop.push(self.random_genome(island));
            }
            self.islands[island] = pop;
            injected += replace;
        }
        injected
    }

    // ========================================================================
    // Breeding
    // ========================================================================

    /// Replace an evaluated island with its next generation: elites carried
    /// unchanged, the rest bred by crossover and mutation.
    pub fn breed_island(&mut self, island: usize) {
        let mut pop = std::mem::take(&mut self.islands[island]);
        pop.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));

        let size = self.config.population_size;
        let mut next: Vec<Genome> = pop.iter().take(self.config.elite_count).cloned().collect();
        let child_generation = self.generation + 1;
        let rate = self.mutation_rate;

        while next.len() < size {
            let (genes, parents, mutations) = if self.rng.gen::<f64>() < self.config.crossover_rate {
                let (Some(p1), Some(p2)) = (
                    operators::tournament_select(&pop, self.config.tournament_size, &mut self.rng),
                    operators::tournament_select(&pop, self.config.tournament_size, &mut self.rng),
                ) else {
                    break;
                };
                let mut genes =
                    operators::crossover_genes(&p1.genes, &p2.genes, &self.space, &mut self.rng);
                let mutations = operators::mutate(
                    &mut genes,
                    self.mutation_params(rate),
                    &self.space,
                    &self.learning,
                    &mut self.rng,
                );
                (genes, vec![p1.id, p2.id], mutations)
            } else {
                let Some(parent) =
                    operators::tournament_select(&pop, self.config.tournament_size, &mut self.rng)
                else {
                    break;
                };
                let mut genes = parent.genes;
                let mutations = operators::mutate(
                    &mut genes,
                    self.mutation_params((rate * 1.5).min(1.0)),
                    &self.space,
                    &self.learning,
                    &mut self.rng,
                );
                (genes, vec![parent.id], mutations)
            };

            let mut child = Genome::new(self.ids.next_id(), genes, child_generation, island)
                .with_parents(parents);
            child.mutations = mutations;
            next.push(child);
        }

        self.islands[island] = next;
    }

    fn mutation_params(&self, rate: f64) -> MutationParams {
        MutationParams {
            rate,
            guided_prob: self.config.guided_mutation_prob,
            sigma: self.config.mutation_sigma,
        }
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    async fn report(&self, avg_fitness: f64, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();
        let best_fitness = match &self.best {
            Some(b) => b.genome.fitness,
            None => self
                .islands
                .iter()
                .flatten()
                .map(|g| g.fitness)
                .fold(f64::NEG_INFINITY, f64::max),
        };
        let record = ProgressRecord {
            generation: self.generation,
            best_fitness,
            avg_fitness,
            evaluation_rate: if elapsed > 0.0 {
                self.total_evaluations as f64 / elapsed
            } else {
                0.0
            },
            diversity_pct: self.diversity() * 100.0,
            mutation_rate: self.mutation_rate,
            elapsed_secs: elapsed,
        };

        info!(
            generation = record.generation,
            best = record.best_fitness,
            avg = record.avg_fitness,
            diversity_pct = record.diversity_pct,
            mutation_rate = record.mutation_rate,
            evals_per_sec = record.evaluation_rate,
            "Generation complete"
        );
        for insight in self.learning.insights() {
            info!(param = %insight.param, correlation = insight.correlation, "{}", insight.message);
        }

        if let Err(e) = self
            .progress_sink
            .report(&record, self.learning.insights())
            .await
        {
            warn!(error = %e, "Progress sink failed");
        }
    }

    pub fn snapshot(&self) -> CheckpointSnapshot {
        CheckpointSnapshot {
            run_id: self.run_id.clone(),
            generation: self.generation,
            total_evaluations: self.total_evaluations,
            global_best: self.best.as_ref().map(|b| b.genome.clone()),
            global_best_result: self.best.as_ref().map(|b| b.result.clone()),
            verdict: self.best.as_ref().map(|b| b.judgement.verdict),
            unaccepted_best: self.unaccepted().map(|r| r.genome.clone()),
            unaccepted_verdict: self.unaccepted().map(|r| r.judgement.verdict),
            insights: self.learning.insights().to_vec(),
            best_by_regime: self.learning.best_by_regime().clone(),
            timestamp: Utc::now(),
        }
    }

    fn unaccepted(&self) -> Option<&BestRecord> {
        match self.best {
            Some(_) => None,
            None => self.top_rejected.as_ref(),
        }
    }

    async fn save_checkpoint(&self, snapshot: &CheckpointSnapshot) {
        match self.checkpoint_sink.save(snapshot).await {
            Ok(()) => debug!(generation = snapshot.generation, "Checkpoint saved"),
            Err(e) => warn!(generation = snapshot.generation, error = %e, "Checkpoint sink failed"),
        }
    }
}

fn average_fitness(population: &[&Genome]) -> f64 {
    let scored: Vec<f64> = population
        .iter()
        .filter(|g| g.evaluated)
        .map(|g| g.fitness)
        .collect();
    if scored.is_empty() {
        return 0.0;
    }
    scored.iter().sum::<f64>() / scored.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::fitness::FAILED_FITNESS;
    use crate::judge::Verdict;
    use crate::market::SymbolSeries;
    use crate::params::ParamId;
    use std::sync::Mutex;

    /// Synthetic results driven by a few genes, so runs are fast.
    struct SyntheticEvaluator;

    impl Evaluator for SyntheticEvaluator {
        fn evaluate(&self, genes: &Genes) -> EngineResult<BacktestResult> {
            let rsi = genes[ParamId::RsiPeriod];
            let bb = genes[ParamId::BbPeriod];
            if bb == 10.0 {
                panic!("synthetic panic");
            }
            if bb == 11.0 {
                return Err(EngineError::Evaluation("synthetic failure".to_string()));
            }

            let mut r = BacktestResult::empty(10_000.0);
            r.total_trades = 100;
            r.max_drawdown = 0.1;
            r.win_rate = 0.5;
            r.profit_factor = 1.5;
            r.total_return = rsi / 100.0;
            r.sortino_ratio = 1.0;
            r.calmar_ratio = 1.0;
            // long RSI periods look great but are overfit
            r.sharpe_ratio = if rsi > 24.0 { 6.0 } else { 1.0 + rsi / 20.0 };
            Ok(r)
        }
    }

    #[derive(Default)]
    struct MemorySink {
        snapshots: Mutex<Vec<CheckpointSnapshot>>,
        records: Mutex<Vec<ProgressRecord>>,
    }

    #[async_trait::async_trait]
    impl CheckpointSink for MemorySink {
        async fn save(&self, snapshot: &CheckpointSnapshot) -> anyhow::Result<()> {
            self.snapshots.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ProgressSink for MemorySink {
        async fn report(
            &self,
            progress: &ProgressRecord,
            _insights: &[crate::learning::Insight],
        ) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(progress.clone());
            Ok(())
        }
    }

    fn small_config() -> OptimizerConfig {
        OptimizerConfig {
            population_size: 12,
            islands: 3,
            elite_count: 2,
            migration_count: 2,
            migration_interval: 2,
            max_generations: 6,
            batch_size: 5,
            checkpoint_interval: 2,
            seed: Some(7),
            ..OptimizerConfig::default()
        }
    }

    fn optimizer(config: OptimizerConfig) -> GeneticOptimizer {
        GeneticOptimizer::new(config, ParameterSpace::default(), Arc::new(SyntheticEvaluator))
            .unwrap()
    }

    fn best_fitness(pop: &[Genome]) -> f64 {
        pop.iter()
            .filter(|g| g.evaluated)
            .map(|g| g.fitness)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    #[tokio::test]
    async fn test_elitism_is_monotonic() {
        let mut opt = optimizer(small_config());
        opt.initialize();
        opt.evaluate_pending().await;

        for _ in 0..4 {
            let before: Vec<f64> = opt.islands().iter().map(|p| best_fitness(p)).collect();
            for island in 0..opt.islands().len() {
                opt.breed_island(island);
            }
            let after: Vec<f64> = opt.islands().iter().map(|p| best_fitness(p)).collect();
            for (b, a) in before.iter().zip(&after) {
                assert!(a >= b);
            }
            for pop in opt.islands() {
                assert_eq!(pop.len(), 12);
            }
            opt.evaluate_pending().await;
        }
    }

    #[tokio::test]
    async fn test_failures_and_panics_get_sentinel() {
        let mut opt = optimizer(small_config());
        opt.initialize();
        opt.islands[0][0].genes.set(ParamId::BbPeriod, 10.0);
        opt.islands[0][1].genes.set(ParamId::BbPeriod, 11.0);
        opt.islands[0][2].genes.set(ParamId::BbPeriod, 20.0);
        opt.evaluate_pending().await;

        assert_eq!(opt.islands[0][0].fitness, FAILED_FITNESS);
        assert_eq!(opt.islands[0][1].fitness, FAILED_FITNESS);
        assert!(opt.islands[0][2].fitness > FAILED_FITNESS);
        assert!(opt.islands.iter().flatten().all(|g| g.evaluated));
        assert_eq!(opt.total_evaluations, 36);
    }

    #[tokio::test]
    async fn test_judge_gates_global_best() {
        let mut opt = optimizer(small_config());
        opt.initialize();
        // the single fittest genome is overfit
        opt.islands[1][3].genes.set(ParamId::RsiPeriod, 28.0);
        opt.islands[1][3].genes.set(ParamId::BbPeriod, 20.0);
        opt.evaluate_pending().await;

        let overfit = &opt.islands[1][3];
        assert!(overfit.metrics.sharpe > 4.0);
        let best = opt.best().unwrap();
        assert!(best.result.sharpe_ratio <= 4.0);
        assert!(best.judgement.accepts());
    }

    /// Every result carries an implausible Sharpe, so the judge rejects all of them
    struct OverfitEvaluator;

    impl Evaluator for OverfitEvaluator {
        fn evaluate(&self, genes: &Genes) -> EngineResult<BacktestResult> {
            let mut r = SyntheticEvaluator.evaluate(genes)?;
            r.sharpe_ratio = 5.0;
            Ok(r)
        }
    }

    #[tokio::test]
    async fn test_all_rejected_run_reports_unaccepted_top() {
        let config = OptimizerConfig {
            max_generations: 3,
            ..small_config()
        };
        let opt =
            GeneticOptimizer::new(config, ParameterSpace::default(), Arc::new(OverfitEvaluator))
                .unwrap();
        let outcome = opt.run().await.unwrap();

        assert!(outcome.best.is_none());
        assert!(outcome.snapshot.global_best.is_none());
        assert!(outcome.snapshot.verdict.is_none());

        let top = outcome.unaccepted.unwrap();
        assert_eq!(top.judgement.verdict, Verdict::Suspicious);
        assert!(!top.judgement.accepts());
        assert_eq!(
            outcome.snapshot.unaccepted_best.map(|g| g.id),
            Some(top.genome.id)
        );
        assert_eq!(outcome.snapshot.unaccepted_verdict, Some(Verdict::Suspicious));
    }

    #[tokio::test]
    async fn test_accepted_best_hides_unaccepted_top() {
        let outcome = optimizer(small_config()).run().await.unwrap();
        assert!(outcome.best.is_some());
        assert!(outcome.unaccepted.is_none());
        assert!(outcome.snapshot.unaccepted_best.is_none());
    }

    #[tokio::test]
    async fn test_migration_moves_top_genomes_around_ring() {
        let mut opt = optimizer(small_config());
        opt.initialize();
        for (i, pop) in opt.islands.iter_mut().enumerate() {
            for (j, g) in pop.iter_mut().enumerate() {
                g.fitness = (i * 100 + j) as f64;
                g.evaluated = true;
            }
        }
        let top_of_last = opt.islands[2][11].id;

        opt.migrate();

        for pop in opt.islands() {
            assert_eq!(pop.len(), 12);
        }
        // island 0 received island 2's best, which keeps its fitness
        let arrived = opt.islands[0]
            .iter()
            .find(|g| g.parents == vec![top_of_last])
            .unwrap();
        assert_eq!(arrived.fitness, 211.0);
        assert_eq!(arrived.island, 0);
        // island 0's own worst two were dropped
        assert!(opt.islands[0].iter().all(|g| g.fitness != 0.0 && g.fitness != 1.0));
    }

    #[tokio::test]
    async fn test_identical_population_triggers_injection() {
        let config = OptimizerConfig {
            population_size: 50,
            islands: 1,
            ..small_config()
        };
        let mut opt = optimizer(config);
        opt.initialize();
        let genes = opt.islands[0][0].genes;
        for (j, g) in opt.islands[0].iter_mut().enumerate() {
            g.genes = genes;
            g.fitness = j as f64;
            g.evaluated = true;
        }

        assert!((opt.diversity() - 1.0 / 50.0).abs() < 1e-12);
        assert!(opt.diversity() < opt.config.diversity_threshold);

        let injected = opt.inject_diversity();
        assert_eq!(injected, 10);
        assert_eq!(opt.islands[0].len(), 50);
        assert!(opt.diversity() > 1.0 / 50.0);
        assert_eq!(opt.islands[0].iter().filter(|g| !g.evaluated).count(), 10);
        // the fittest resident survives
        assert!(opt.islands[0].iter().any(|g| g.fitness == 49.0));
    }

    #[tokio::test]
    async fn test_small_run_reports_and_checkpoints() {
        let sink = Arc::new(MemorySink::default());
        let opt = optimizer(small_config())
            .with_run_id("test-run")
            .with_checkpoint_sink(sink.clone())
            .with_progress_sink(sink.clone());
        let progress = opt.progress();

        let outcome = opt.run().await.unwrap();

        assert_eq!(outcome.status, EvolutionStatus::BudgetExhausted);
        assert_eq!(outcome.generations, 6);
        assert!(outcome.total_evaluations >= 36);
        let best = outcome.best.unwrap();
        assert!(best.result.sharpe_ratio <= 4.0);
        assert!(progress.best_fitness() >= best.genome.fitness);

        let snapshots = sink.snapshots.lock().unwrap();
        // generations 2 and 4, plus the final snapshot
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots.last().unwrap().run_id, "test-run");
        assert_eq!(sink.records.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_seeded_runs_are_reproducible() {
        let a = optimizer(small_config()).run().await.unwrap();
        let b = optimizer(small_config()).run().await.unwrap();
        let fa = a.best.map(|x| x.genome.genes);
        let fb = b.best.map(|x| x.genome.genes);
        assert_eq!(fa, fb);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_first_generation() {
        let opt = optimizer(small_config());
        let progress = opt.progress();
        // reset() clears the flag at start, so cancel from a sink instead
        struct CancelOnReport(Arc<EvolutionProgress>);
        #[async_trait::async_trait]
        impl ProgressSink for CancelOnReport {
            async fn report(
                &self,
                _p: &ProgressRecord,
                _i: &[crate::learning::Insight],
            ) -> anyhow::Result<()> {
                self.0.cancel();
                Ok(())
            }
        }
        let outcome = opt
            .with_progress_sink(Arc::new(CancelOnReport(progress)))
            .run()
            .await
            .unwrap();
        assert_eq!(outcome.status, EvolutionStatus::Cancelled);
        assert_eq!(outcome.generations, 1);
    }

    #[tokio::test]
    async fn test_backtest_evaluator_runs_engine() {
        let closes: Vec<f64> = (0..200).map(|i| 100.0 * 1.0005f64.powi(i)).collect();
        let series = SymbolSeries {
            symbol: "UP".to_string(),
            times: (0..200).map(|i| i * 86_400_000).collect(),
            open: closes.clone(),
            high: closes.iter().map(|c| c * 1.01).collect(),
            low: closes.iter().map(|c| c * 0.99).collect(),
            close: closes.clone(),
            volume: vec![1_000.0; 200],
        };
        let market = Arc::new(MarketData::new("UP", vec![series]));
        let evaluator = BacktestEvaluator::new(market, BacktestSettings::default());
        let genes = ParameterSpace::default().midpoint();
        let result = evaluator.evaluate(&genes).unwrap();
        assert_eq!(result.equity_curve.len(), 140);
    }
}
