//! Checkpoint repository: evolution snapshots, one row per emission

use crate::DbResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted checkpoint. The full snapshot lives in `snapshot_json`; the
/// other columns are denormalized for listing and lookup.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckpointRecord {
    pub id: Option<i64>,
    pub run_id: String,
    pub generation: i64,
    pub total_evaluations: i64,
    pub best_fitness: Option<f64>,
    /// SHA-256 of the best genome's parameter map
    pub best_params_hash: Option<String>,
    pub verdict: Option<String>,
    pub snapshot_json: String,
    pub config_json: Option<String>,
    pub created_at: Option<i64>,
}

impl CheckpointRecord {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    }
}

/// Repository for evolution checkpoints
pub struct CheckpointRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CheckpointRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a checkpoint, returning its row id
    pub async fn save(&self, record: &CheckpointRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO checkpoints
                (run_id, generation, total_evaluations, best_fitness, best_params_hash,
                 verdict, snapshot_json, config_json, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CAST(strftime('%s', 'now') AS INTEGER))
            "#,
        )
        .bind(&record.run_id)
        .bind(record.generation)
        .bind(record.total_evaluations)
        .bind(record.best_fitness)
        .bind(&record.best_params_hash)
        .bind(&record.verdict)
        .bind(&record.snapshot_json)
        .bind(&record.config_json)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent checkpoint of one run
    pub async fn latest_for_run(&self, run_id: &str) -> DbResult<Option<CheckpointRecord>> {
        let record = sqlx::query_as::<_, CheckpointRecord>(
            r#"SELECT * FROM checkpoints
               WHERE run_id = ?1
               ORDER BY generation DESC, id DESC
               LIMIT 1"#,
        )
        .bind(run_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Most recent checkpoint of every run, newest run first
    pub async fn latest_per_run(&self) -> DbResult<Vec<CheckpointRecord>> {
        let records = sqlx::query_as::<_, CheckpointRecord>(
            r#"SELECT c.* FROM checkpoints c
               WHERE c.id = (
                   SELECT c2.id FROM checkpoints c2
                   WHERE c2.run_id = c.run_id
                   ORDER BY c2.generation DESC, c2.id DESC
                   LIMIT 1
               )
               ORDER BY c.id DESC"#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Checkpoints whose best genome had exactly this parameter set
    pub async fn find_by_params_hash(&self, hash: &str) -> DbResult<Vec<CheckpointRecord>> {
        let records = sqlx::query_as::<_, CheckpointRecord>(
            "SELECT * FROM checkpoints WHERE best_params_hash = ?1 ORDER BY id DESC",
        )
        .bind(hash)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Delete all but the newest `keep` checkpoints of each run. Returns rows deleted.
    pub async fn cleanup_keep_last(&self, keep: u32) -> DbResult<u64> {
        let result = sqlx::query(
            r#"DELETE FROM checkpoints WHERE id IN (
                   SELECT id FROM (
                       SELECT id, ROW_NUMBER() OVER (
                           PARTITION BY run_id ORDER BY generation DESC, id DESC
                       ) AS rn
                       FROM checkpoints
                   ) WHERE rn > ?1
               )"#,
        )
        .bind(keep as i64)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Reclaim space after a cleanup
    pub async fn vacuum(&self) -> DbResult<()> {
        sqlx::query("VACUUM").execute(self.pool).await?;
        Ok(())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM checkpoints")
            .fetch_one(self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(run_id: &str, generation: i64, fitness: f64) -> CheckpointRecord {
        CheckpointRecord {
            id: None,
            run_id: run_id.to_string(),
            generation,
            total_evaluations: generation * 100,
            best_fitness: Some(fitness),
            best_params_hash: Some(format!("hash-{run_id}-{generation}")),
            verdict: Some("GOOD".to_string()),
            snapshot_json: "{}".to_string(),
            config_json: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_latest_for_run() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.checkpoints();
        repo.save(&record("a", 10, 1.0)).await.unwrap();
        repo.save(&record("a", 20, 2.0)).await.unwrap();
        repo.save(&record("b", 5, 3.0)).await.unwrap();

        let latest = repo.latest_for_run("a").await.unwrap().unwrap();
        assert_eq!(latest.generation, 20);
        assert_eq!(latest.best_fitness, Some(2.0));
        assert!(latest.created_at_utc().is_some());
        assert!(repo.latest_for_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_per_run() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.checkpoints();
        repo.save(&record("a", 10, 1.0)).await.unwrap();
        repo.save(&record("b", 5, 3.0)).await.unwrap();
        repo.save(&record("a", 20, 2.0)).await.unwrap();

        let latest = repo.latest_per_run().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].run_id, "a");
        assert_eq!(latest[0].generation, 20);
        assert_eq!(latest[1].run_id, "b");
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest_per_run() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.checkpoints();
        for generation in 1..=5 {
            repo.save(&record("a", generation, 1.0)).await.unwrap();
        }
        repo.save(&record("b", 1, 1.0)).await.unwrap();

        let deleted = repo.cleanup_keep_last(2).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(repo.count().await.unwrap(), 3);
        repo.vacuum().await.unwrap();
        assert_eq!(
            repo.latest_for_run("a").await.unwrap().unwrap().generation,
            5
        );
    }

    #[tokio::test]
    async fn test_find_by_params_hash() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.checkpoints();
        repo.save(&record("a", 1, 1.0)).await.unwrap();
        let found = repo.find_by_params_hash("hash-a-1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(repo.find_by_params_hash("nope").await.unwrap().is_empty());
    }
}
