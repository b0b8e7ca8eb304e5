//! Strategy Evolver Engine: island-model genetic optimization of trading strategies
//!
//! Provides:
//! - Indicator library and composite signal generator
//! - Regime detector and daily backtest engine
//! - Fitness function, judge and learning engine
//! - Island-model genetic optimizer with checkpoints
//! - Binance and JSON-directory historical data providers

pub mod api;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod fitness;
pub mod genome;
pub mod indicators;
pub mod judge;
pub mod learning;
pub mod market;
pub mod operators;
pub mod optimizer;
pub mod params;
pub mod regime;
pub mod report;
pub mod signals;
pub mod types;

// Re-exports for convenience
pub use api::{BinanceClient, JsonDirProvider};
pub use checkpoint::{compute_params_hash, decode_snapshot, SqliteCheckpointSink};
pub use config::{BacktestSettings, EvolverConfig, OptimizerConfig};
pub use engine::BacktestEngine;
pub use error::{EngineError, EngineResult};
pub use fitness::fitness;
pub use genome::{Genome, GenomeMetrics};
pub use judge::{Judge, Judgement, Verdict};
pub use learning::{Insight, LearningEngine};
pub use market::{load_market_data, HistoricalDataProvider, MarketData, SymbolSeries};
pub use optimizer::{
    BacktestEvaluator, BestRecord, Evaluator, GeneticOptimizer, OptimizationOutcome,
};
pub use params::{Genes, ParamId, ParameterSpace, ParameterSpec};
pub use regime::{Regime, RegimeThresholds};
pub use report::{
    CheckpointSink, CheckpointSnapshot, EvolutionProgress, EvolutionStatus, NullSink,
    ProgressRecord, ProgressSink,
};
pub use signals::Signal;
pub use types::*;
