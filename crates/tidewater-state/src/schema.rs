//! Idempotent DDL for the `SQLite` stores.

/// Checkpoints, dead letters, and run history.
pub const STATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS checkpoints (
    pipeline TEXT NOT NULL,
    source TEXT NOT NULL,
    record_offset INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, source)
);

CREATE TABLE IF NOT EXISTS pipeline_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    records_read INTEGER DEFAULT 0,
    records_written INTEGER DEFAULT 0,
    records_dead_lettered INTEGER DEFAULT 0,
    duplicates_skipped INTEGER DEFAULT 0,
    retries INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    source TEXT NOT NULL,
    record_offset INTEGER NOT NULL,
    payload BLOB NOT NULL,
    ingested_at TEXT NOT NULL,
    error_message TEXT NOT NULL,
    error_category TEXT NOT NULL,
    attempts_json TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (pipeline, source, record_offset)
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_source ON dead_letters (pipeline, source, id);
";

/// Ingestion buffer rows and per-source high-water marks.
pub const BUFFER_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS buffer_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    lane INTEGER NOT NULL,
    source TEXT NOT NULL,
    record_offset INTEGER NOT NULL,
    payload BLOB NOT NULL,
    ingested_at TEXT NOT NULL,
    UNIQUE (source, record_offset)
);

CREATE INDEX IF NOT EXISTS idx_buffer_lane_seq ON buffer_records (lane, seq);

CREATE TABLE IF NOT EXISTS buffer_high_water (
    source TEXT PRIMARY KEY,
    record_offset INTEGER NOT NULL
);
";
