/// Bumped whenever a table definition changes incompatibly.
pub const SCHEMA_VERSION: i64 = 2;

pub const SCHEMA: &str = r#"
-- Hash buckets: one row per distinct rotation hash
CREATE TABLE IF NOT EXISTS hash_table (
    key INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL UNIQUE,
    count INTEGER NOT NULL DEFAULT 0
);

-- Indexed images; keys are dense and zero-based per side
CREATE TABLE IF NOT EXISTS directory (
    key INTEGER NOT NULL,
    dir_b INTEGER NOT NULL DEFAULT 0,
    path TEXT NOT NULL,
    filename TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 0,  -- 0 pending, 1 in progress, 2 done, 3 error

    -- Fingerprint
    px INTEGER,
    py INTEGER,
    hash_0 INTEGER,
    hash_90 INTEGER,
    hash_180 INTEGER,
    hash_270 INTEGER,
    thumb_path TEXT,  -- written by this store's preprocessing; NULL when none

    error TEXT,
    PRIMARY KEY (dir_b, key),
    UNIQUE (dir_b, path),
    FOREIGN KEY (hash_0) REFERENCES hash_table(key),
    FOREIGN KEY (hash_90) REFERENCES hash_table(key),
    FOREIGN KEY (hash_180) REFERENCES hash_table(key),
    FOREIGN KEY (hash_270) REFERENCES hash_table(key)
);

CREATE INDEX IF NOT EXISTS idx_directory_status ON directory(status);

-- One row per scheduled comparison
CREATE TABLE IF NOT EXISTS dif_table (
    key INTEGER PRIMARY KEY AUTOINCREMENT,
    key_a INTEGER NOT NULL,
    key_b INTEGER NOT NULL,
    status INTEGER NOT NULL DEFAULT -1,  -- -1 unscheduled, 0 processing, 1 success, 2 error, 3 skipped hash, 4 skipped aspect
    dif REAL NOT NULL DEFAULT -1,
    error TEXT,
    block_id INTEGER,
    UNIQUE (key_a, key_b)
);

CREATE INDEX IF NOT EXISTS idx_dif_status ON dif_table(status);
CREATE INDEX IF NOT EXISTS idx_dif_block ON dif_table(block_id, status);

-- Reserved filenames for diff visualisations
CREATE TABLE IF NOT EXISTS plots (
    key INTEGER PRIMARY KEY AUTOINCREMENT,
    key_a INTEGER NOT NULL,
    key_b INTEGER NOT NULL,
    path TEXT NOT NULL UNIQUE
);

-- Run history
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    phase TEXT NOT NULL,               -- 'index', 'preprocess', 'compare'
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL DEFAULT 'running',  -- 'running', 'completed', 'interrupted', 'failed'
    processed INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    message TEXT
);
"#;

/// Upgrades for stores created by an older schema, as (version reached, statement).
pub const MIGRATIONS: &[(i64, &str)] = &[(2, "ALTER TABLE directory ADD COLUMN thumb_path TEXT")];
