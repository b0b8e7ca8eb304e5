//! Run reporting: snapshot/progress records, sink traits, and the shared
//! progress tracker.

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    RwLock,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::genome::Genome;
use crate::judge::Verdict;
use crate::learning::Insight;
use crate::regime::Regime;
use crate::types::BacktestResult;

// ============================================================================
// Records
// ============================================================================

/// Serializable state emitted at every checkpoint interval and at run end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSnapshot {
    pub run_id: String,
    pub generation: u32,
    pub total_evaluations: u64,
    pub global_best: Option<Genome>,
    pub global_best_result: Option<BacktestResult>,
    pub verdict: Option<Verdict>,
    /// Top-fitness genome the judge turned down. Only set while no global
    /// best has been accepted, and never a substitute for one.
    #[serde(default)]
    pub unaccepted_best: Option<Genome>,
    #[serde(default)]
    pub unaccepted_verdict: Option<Verdict>,
    pub insights: Vec<Insight>,
    pub best_by_regime: BTreeMap<Regime, Genome>,
    pub timestamp: DateTime<Utc>,
}

impl CheckpointSnapshot {
    pub fn best_fitness(&self) -> Option<f64> {
        self.global_best.as_ref().map(|g| g.fitness)
    }
}

/// Per-generation progress, emitted at every report interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub generation: u32,
    pub best_fitness: f64,
    pub avg_fitness: f64,
    /// Evaluations per second over the whole run
    pub evaluation_rate: f64,
    /// Structurally unique genomes, percent of the population
    pub diversity_pct: f64,
    pub mutation_rate: f64,
    pub elapsed_secs: f64,
}

// ============================================================================
// Sinks
// ============================================================================

/// Receives checkpoint snapshots. Failures are logged, never fatal.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn save(&self, snapshot: &CheckpointSnapshot) -> Result<()>;
}

/// Receives progress records and the latest insights.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: &ProgressRecord, insights: &[Insight]) -> Result<()>;
}

/// Sink that drops everything.
pub struct NullSink;

#[async_trait]
impl CheckpointSink for NullSink {
    async fn save(&self, _snapshot: &CheckpointSnapshot) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ProgressSink for NullSink {
    async fn report(&self, _progress: &ProgressRecord, _insights: &[Insight]) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Progress tracker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStatus {
    Idle,
    Running,
    Converged,
    BudgetExhausted,
    Cancelled,
}

/// Shared progress tracker between the optimizer task and its observers
pub struct EvolutionProgress {
    pub status: RwLock<EvolutionStatus>,
    pub generation: AtomicU32,
    pub evaluations: AtomicU64,
    /// `f64` bits of the accepted global best fitness
    best_fitness_bits: AtomicU64,
    /// Checked only between generations
    pub cancelled: AtomicBool,
}

impl EvolutionProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(EvolutionStatus::Idle),
            generation: AtomicU32::new(0),
            evaluations: AtomicU64::new(0),
            best_fitness_bits: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Reset for a new run
    pub fn reset(&self) {
        self.set_status(EvolutionStatus::Running);
        self.generation.store(0, Ordering::Relaxed);
        self.evaluations.store(0, Ordering::Relaxed);
        self.best_fitness_bits
            .store(f64::NEG_INFINITY.to_bits(), Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn set_best_fitness(&self, fitness: f64) {
        self.best_fitness_bits
            .store(fitness.to_bits(), Ordering::Relaxed);
    }

    pub fn best_fitness(&self) -> f64 {
        f64::from_bits(self.best_fitness_bits.load(Ordering::Relaxed))
    }

    pub fn set_status(&self, status: EvolutionStatus) {
        if let Ok(mut guard) = self.status.write() {
            *guard = status;
        }
    }

    pub fn status(&self) -> EvolutionStatus {
        self.status
            .read()
            .map(|s| *s)
            .unwrap_or(EvolutionStatus::Idle)
    }

    pub fn is_running(&self) -> bool {
        self.status() == EvolutionStatus::Running
    }
}

impl Default for EvolutionProgress {
    fn default() -> Self {
        Self::new()
    }
}
