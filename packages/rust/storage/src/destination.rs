//! libSQL-backed destination database.
//!
//! Records are upserted keyed by the stable source id, so a retried or
//! resumed write replaces the earlier row instead of duplicating it.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use uuid::Uuid;

use contentmigrator_shared::{Destination, DestinationRecord, MigratorError, Result};

use crate::migrations;

fn storage_err(e: impl std::fmt::Display) -> MigratorError {
    MigratorError::Storage(e.to_string())
}

/// Destination handle wrapping a libSQL database.
pub struct SqlDestination {
    /// Keeps the database open for as long as `conn` is used.
    _db: Database,
    conn: Connection,
    readonly: bool,
}

impl SqlDestination {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| MigratorError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let destination = Self {
            _db: db,
            conn,
            readonly: false,
        };
        destination.run_migrations().await?;
        Ok(destination)
    }

    /// A migrated, empty database that lives only as long as the handle.
    pub async fn open_in_memory() -> Result<Self> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let destination = Self {
            _db: db,
            conn,
            readonly: false,
        };
        destination.run_migrations().await?;
        Ok(destination)
    }

    /// Open a database at `path` for verification passes; writes are rejected.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            _db: db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        MigratorError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(MigratorError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Fetch a migrated record by source id.
    pub async fn get_record(&self, source_id: &str) -> Result<Option<DestinationRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_id, name, title, summary, keywords_json, tag_ids_json,
                        asset_url, body, properties_json, content_hash
                 FROM records WHERE source_id = ?1",
                params![source_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Number of migrated records.
    pub async fn record_count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM records", params![])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => row.get::<i64>(0).map(|n| n as u64).map_err(storage_err),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }
}

#[async_trait]
impl Destination for SqlDestination {
    async fn find_by_name(&self, name: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT id FROM tags WHERE name = ?1", params![name])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn create(&self, name: &str) -> Result<String> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO tags (id, name, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO NOTHING",
                params![Uuid::now_v7().to_string(), name, now.as_str()],
            )
            .await
            .map_err(storage_err)?;

        // A concurrent pipeline may have created the same tag first.
        self.find_by_name(name)
            .await?
            .ok_or_else(|| MigratorError::Storage(format!("tag {name} vanished after insert")))
    }

    async fn upsert(&self, record: &DestinationRecord) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let keywords = serde_json::to_string(&record.keywords).map_err(storage_err)?;
        let tag_ids = serde_json::to_string(&record.tag_ids).map_err(storage_err)?;
        let properties = serde_json::to_string(&record.properties).map_err(storage_err)?;

        self.conn
            .execute(
                "INSERT INTO records (source_id, name, title, summary, keywords_json, tag_ids_json,
                                      asset_url, body, properties_json, content_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(source_id) DO UPDATE SET
                   name = excluded.name,
                   title = excluded.title,
                   summary = excluded.summary,
                   keywords_json = excluded.keywords_json,
                   tag_ids_json = excluded.tag_ids_json,
                   asset_url = excluded.asset_url,
                   body = excluded.body,
                   properties_json = excluded.properties_json,
                   content_hash = excluded.content_hash,
                   updated_at = excluded.updated_at",
                params![
                    record.source_id.as_str(),
                    record.name.as_str(),
                    record.title.as_str(),
                    record.summary.as_deref(),
                    keywords,
                    tag_ids,
                    record.asset_url.as_deref(),
                    record.body.as_str(),
                    properties,
                    record.content_hash.as_str(),
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn contains(&self, source_id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM records WHERE source_id = ?1",
                params![source_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(storage_err(e)),
        }
    }
}

fn row_to_record(row: &libsql::Row) -> Result<DestinationRecord> {
    let parse_json = |idx: i32| -> Result<String> { row.get::<String>(idx).map_err(storage_err) };

    Ok(DestinationRecord {
        source_id: row.get::<String>(0).map_err(storage_err)?,
        name: row.get::<String>(1).map_err(storage_err)?,
        title: row.get::<String>(2).map_err(storage_err)?,
        summary: row.get::<String>(3).ok(),
        keywords: serde_json::from_str(&parse_json(4)?).map_err(storage_err)?,
        tag_ids: serde_json::from_str(&parse_json(5)?).map_err(storage_err)?,
        asset_url: row.get::<String>(6).ok(),
        body: row.get::<String>(7).map_err(storage_err)?,
        properties: serde_json::from_str(&parse_json(8)?).map_err(storage_err)?,
        content_hash: row.get::<String>(9).map_err(storage_err)?,
    })
}
