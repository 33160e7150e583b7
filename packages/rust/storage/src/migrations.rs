//! SQL migration definitions for the destination database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: tags, records",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Tags resolved from generated keywords
CREATE TABLE IF NOT EXISTS tags (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

-- Migrated records, one per source item
CREATE TABLE IF NOT EXISTS records (
    source_id       TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    title           TEXT NOT NULL,
    summary         TEXT,
    keywords_json   TEXT NOT NULL,
    tag_ids_json    TEXT NOT NULL,
    asset_url       TEXT,
    body            TEXT NOT NULL,
    properties_json TEXT NOT NULL,
    content_hash    TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_name ON records(name);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
