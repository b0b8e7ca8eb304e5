//! SQLite checkpoint sink backed by `persistence::CheckpointRepository`

use anyhow::Result;
use async_trait::async_trait;
use persistence::{CheckpointRecord, CheckpointRepository, SqlitePool};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::EngineResult;
use crate::params::Genes;
use crate::report::{CheckpointSink, CheckpointSnapshot};

/// SHA-256 of the genome's `name -> value` map, hex encoded.
///
/// Keys serialize in sorted order, so equal gene sets always hash equal.
pub fn compute_params_hash(genes: &Genes) -> String {
    let canonical = serde_json::to_string(genes).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Rebuild a snapshot from its stored row.
pub fn decode_snapshot(record: &CheckpointRecord) -> EngineResult<CheckpointSnapshot> {
    Ok(serde_json::from_str(&record.snapshot_json)?)
}

/// Writes every snapshot as a new row; the run's config JSON rides along.
pub struct SqliteCheckpointSink {
    pool: SqlitePool,
    config_json: Option<String>,
}

impl SqliteCheckpointSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            config_json: None,
        }
    }

    pub fn with_config_json(mut self, config_json: String) -> Self {
        self.config_json = Some(config_json);
        self
    }

    fn to_record(&self, snapshot: &CheckpointSnapshot) -> Result<CheckpointRecord> {
        Ok(CheckpointRecord {
            id: None,
            run_id: snapshot.run_id.clone(),
            generation: snapshot.generation as i64,
            total_evaluations: snapshot.total_evaluations as i64,
            best_fitness: snapshot.best_fitness(),
            best_params_hash: snapshot
                .global_best
                .as_ref()
                .map(|g| compute_params_hash(&g.genes)),
            verdict: snapshot.verdict.map(|v| v.to_string()),
            snapshot_json: serde_json::to_string(snapshot)?,
            config_json: self.config_json.clone(),
            created_at: None,
        })
    }
}

#[async_trait]
impl CheckpointSink for SqliteCheckpointSink {
    async fn save(&self, snapshot: &CheckpointSnapshot) -> Result<()> {
        let record = self.to_record(snapshot)?;
        let id = CheckpointRepository::new(&self.pool).save(&record).await?;
        debug!(id, run_id = %record.run_id, generation = record.generation, "Stored checkpoint");
        Ok(())
    }
}
