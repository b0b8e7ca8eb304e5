//! Database schema definitions

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Evolution checkpoints: one row per emitted snapshot
CREATE TABLE IF NOT EXISTS checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    generation INTEGER NOT NULL,
    total_evaluations INTEGER NOT NULL DEFAULT 0,
    best_fitness REAL,
    best_params_hash TEXT,
    verdict TEXT,
    snapshot_json TEXT NOT NULL,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(run_id, generation DESC);
CREATE INDEX IF NOT EXISTS idx_checkpoints_hash ON checkpoints(best_params_hash)
"#;

/// Column additions applied after `CREATE_TABLES`; "duplicate column" errors are expected on reruns
pub const MIGRATIONS: &[&str] = &[
    // Run configuration, stored alongside the snapshot that used it
    "ALTER TABLE checkpoints ADD COLUMN config_json TEXT",
];
