/// Schema for the cache namespaces and their entries.
pub const SCHEMA: &str = r#"
-- One row per named cache; creation order decides match precedence
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by request identity
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    kind TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (cache_name, request_hash),
    FOREIGN KEY (cache_name) REFERENCES cache_namespaces(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_hash ON cache_entries(request_hash);
"#;
