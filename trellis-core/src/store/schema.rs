/// Current schema version.
pub const SCHEMA_VERSION: &str = "1";

/// Full SQL schema for the Trellis `SQLite` database.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS trellis_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Entities, unique per (kind, natural key)
CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    last_synced TEXT NOT NULL,
    metadata TEXT DEFAULT '{}',
    UNIQUE(kind, name)
);
CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(kind);
CREATE INDEX IF NOT EXISTS idx_nodes_name ON nodes(name);

-- Directed relationships; ensuring the same triple twice is a no-op
CREATE TABLE IF NOT EXISTS edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    source_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    target_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    UNIQUE(kind, source_id, target_id)
);
CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);

-- Watermarks and the last pass report
CREATE TABLE IF NOT EXISTS checkpoints (
    kind TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";
