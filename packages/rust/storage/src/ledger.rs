//! Durable, crash-safe ledger of per-entry migration progress.
//!
//! [`StateStore`] owns the single [`MigrationState`] aggregate. Every entry
//! write goes through [`StateStore::upsert_entry`], which checks the caller's
//! revision against the stored one and persists the whole ledger before
//! returning. Persistence is pluggable via [`LedgerBackend`]: [`FileLedger`]
//! for real runs, [`MemoryLedger`] for tests and dry runs.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use contentmigrator_shared::{
    Entry, LEDGER_FORMAT_VERSION, MigrationState, MigratorError, Result,
};

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Where the ledger is persisted.
pub trait LedgerBackend: Send + Sync {
    /// Read the persisted ledger, or `None` if nothing was persisted yet.
    fn read(&self) -> Result<Option<MigrationState>>;

    /// Replace the persisted ledger. Must be all-or-nothing.
    fn write(&self, state: &MigrationState) -> Result<()>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// JSON ledger file, replaced atomically via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileLedger {
    path: PathBuf,
}

impl FileLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl LedgerBackend for FileLedger {
    fn read(&self) -> Result<Option<MigrationState>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MigratorError::io(&self.path, e)),
        };

        // A ledger that fails to parse is never replaced with an empty one.
        let state: MigrationState = serde_json::from_str(&content).map_err(|e| {
            MigratorError::Storage(format!(
                "ledger {} is not valid JSON: {e}",
                self.path.display()
            ))
        })?;

        if state.format > LEDGER_FORMAT_VERSION {
            return Err(MigratorError::Storage(format!(
                "ledger format {} is newer than supported format {LEDGER_FORMAT_VERSION}",
                state.format
            )));
        }
        Ok(Some(state))
    }

    fn write(&self, state: &MigrationState) -> Result<()> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir).map_err(|e| MigratorError::io(&dir, e))?;

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| MigratorError::Storage(format!("failed to serialize ledger: {e}")))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| MigratorError::io(&dir, e))?;
        let written = tmp.write_all(&json).and_then(|()| tmp.as_file().sync_all());
        written.map_err(|e| MigratorError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| MigratorError::io(&self.path, e.error))?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process ledger with no durability.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: StdMutex<Option<MigrationState>>,
    writes: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing state, e.g. a copy of the real ledger for a dry run.
    pub fn seeded(state: MigrationState) -> Self {
        Self {
            state: StdMutex::new(Some(state)),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl LedgerBackend for MemoryLedger {
    fn read(&self) -> Result<Option<MigrationState>> {
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn write(&self, state: &MigrationState) -> Result<()> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Sole owner of the migration ledger.
pub struct StateStore {
    backend: Arc<dyn LedgerBackend>,
    state: Mutex<MigrationState>,
}

impl StateStore {
    /// Open a store, loading whatever the backend has persisted.
    pub fn open(backend: Arc<dyn LedgerBackend>) -> Result<Self> {
        let state = backend.read()?.unwrap_or_default();
        info!(
            ledger = %backend.describe(),
            entries = state.entries.len(),
            version = state.version,
            "ledger opened"
        );
        Ok(Self {
            backend,
            state: Mutex::new(state),
        })
    }

    /// Open a JSON ledger file.
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(Arc::new(FileLedger::new(path)))
    }

    /// An empty store backed by memory.
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(MemoryLedger::new()),
            state: Mutex::new(MigrationState::default()),
        }
    }

    /// Re-read the persisted ledger, or an empty state if none exists.
    pub async fn load(&self) -> Result<MigrationState> {
        let mut state = self.state.lock().await;
        let backend = self.backend.clone();
        let loaded = tokio::task::spawn_blocking(move || backend.read())
            .await
            .map_err(|e| MigratorError::Storage(format!("ledger reader task failed: {e}")))??
            .unwrap_or_default();
        *state = loaded.clone();
        Ok(loaded)
    }

    /// Atomically replace the persisted ledger with `state`.
    pub async fn persist(&self, state: &MigrationState) -> Result<()> {
        let mut current = self.state.lock().await;
        *current = self.write_through(state.clone()).await?;
        Ok(())
    }

    /// A read-only copy of the current ledger.
    pub async fn snapshot(&self) -> MigrationState {
        self.state.lock().await.clone()
    }

    pub async fn get_entry(&self, id: &str) -> Option<Entry> {
        self.state.lock().await.entries.get(id).cloned()
    }

    /// Write `entry` if the caller's view is current.
    ///
    /// Fails with [`MigratorError::Conflict`] when the stored revision differs
    /// from `entry.revision`; the caller must reload and retry. On success the
    /// ledger is durable and the stored entry (with its new revision) is returned.
    pub async fn upsert_entry(&self, mut entry: Entry) -> Result<Entry> {
        let mut state = self.state.lock().await;

        let stored_revision = state.entries.get(&entry.id).map(|e| e.revision);
        let expected = stored_revision.unwrap_or(0);
        if entry.revision != expected {
            debug!(
                entry_id = %entry.id,
                stored = expected,
                caller = entry.revision,
                "revision conflict"
            );
            return Err(MigratorError::Conflict {
                entry_id: entry.id.clone(),
            });
        }

        entry.revision += 1;
        entry.timestamps.updated_at = Utc::now();
        let mut next = state.clone();
        next.entries.insert(entry.id.clone(), entry.clone());
        next.version += 1;

        *state = self.write_through(next).await.inspect_err(|e| {
            warn!(entry_id = %entry.id, error = %e, "ledger write failed");
        })?;
        Ok(entry)
    }

    /// Add a `Pending` entry unless one with this id exists.
    /// Returns whether an entry was added.
    pub async fn register(&self, id: &str, source_ref: &str) -> Result<bool> {
        if self.get_entry(id).await.is_some() {
            return Ok(false);
        }
        match self.upsert_entry(Entry::new(id, source_ref)).await {
            Ok(_) => Ok(true),
            Err(MigratorError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Seed many entries with a single ledger write.
    pub async fn register_all(&self, ids: &[String]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let mut added = 0;
        for id in ids {
            if !next.entries.contains_key(id) {
                let mut entry = Entry::new(id.as_str(), id.as_str());
                entry.revision = 1;
                next.entries.insert(id.clone(), entry);
                added += 1;
            }
        }
        if added > 0 {
            next.version += 1;
            *state = self.write_through(next).await?;
        }
        Ok(added)
    }

    /// Return every non-terminal entry to a fresh `Pending` state.
    pub async fn reset_pending(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let mut reset = 0;
        for entry in next.entries.values_mut() {
            if entry.reset_if_in_progress() {
                entry.revision += 1;
                reset += 1;
            }
        }
        if reset > 0 {
            next.version += 1;
            *state = self.write_through(next).await?;
        }
        info!(reset, "reset in-progress entries to pending");
        Ok(reset)
    }

    /// Force-update directive for a single entry: discard its progress,
    /// including a terminal status.
    pub async fn force_reset(&self, id: &str) -> Result<Entry> {
        let mut entry = self
            .get_entry(id)
            .await
            .ok_or_else(|| MigratorError::NotFound(format!("ledger entry {id}")))?;
        entry.force_reset();
        self.upsert_entry(entry).await
    }

    /// Stamp the start of a run.
    pub async fn mark_run_started(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.last_run_at = Some(Utc::now());
        *state = self.write_through(next).await?;
        Ok(())
    }

    /// Persist `next` off the async workers and hand it back once durable.
    ///
    /// Callers hold the state lock, so writes stay ordered and memory is
    /// only replaced after the backend accepted the new ledger.
    async fn write_through(&self, next: MigrationState) -> Result<MigrationState> {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.write(&next).map(|()| next))
            .await
            .map_err(|e| MigratorError::Storage(format!("ledger writer task failed: {e}")))?
    }
}
