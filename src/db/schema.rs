/// Schema for the feed cache.
pub const SCHEMA: &str = r#"
-- Cached feed items (serialized JSON), ordered by first-seen position
CREATE TABLE IF NOT EXISTS items (
    partition_id TEXT NOT NULL,
    id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    data BLOB NOT NULL,
    position INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition_id, id)
);

CREATE INDEX IF NOT EXISTS idx_items_position
    ON items(partition_id, position);

CREATE INDEX IF NOT EXISTS idx_items_id
    ON items(entity_type, id);

-- One cursor record per partition
CREATE TABLE IF NOT EXISTS remote_key (
    partition_id TEXT PRIMARY KEY,
    prev_key INTEGER,
    next_key INTEGER,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
