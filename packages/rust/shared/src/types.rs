//! Core domain types for the migration ledger and the stage payloads.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MigratorError, Result};

/// Current format version of the persisted state file.
pub const LEDGER_FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Stage & EntryStatus
// ---------------------------------------------------------------------------

/// One ordered step of an entry's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Fetch,
    Transform,
    Enrich,
    Upload,
    Write,
}

impl Stage {
    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Fetch => Some(Self::Transform),
            Self::Transform => Some(Self::Enrich),
            Self::Enrich => Some(Self::Upload),
            Self::Upload => Some(Self::Write),
            Self::Write => None,
        }
    }

    /// The entry status while this stage is running or awaiting retry.
    pub fn status(self) -> EntryStatus {
        match self {
            Self::Fetch => EntryStatus::Fetching,
            Self::Transform => EntryStatus::Transforming,
            Self::Enrich => EntryStatus::Enriching,
            Self::Upload => EntryStatus::Uploading,
            Self::Write => EntryStatus::Writing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Transform => "transform",
            Self::Enrich => "enrich",
            Self::Upload => "upload",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    Pending,
    Fetching,
    Transforming,
    Enriching,
    Uploading,
    Writing,
    Completed,
    Failed,
}

impl EntryStatus {
    /// `Completed` and `Failed` are never left without an explicit directive.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position along the stage order. `Failed` has no position.
    fn rank(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Fetching => Some(1),
            Self::Transforming => Some(2),
            Self::Enriching => Some(3),
            Self::Uploading => Some(4),
            Self::Writing => Some(5),
            Self::Completed => Some(6),
            Self::Failed => None,
        }
    }

    /// The stage this status belongs to, if it is a stage-level state.
    pub fn stage(self) -> Option<Stage> {
        match self {
            Self::Fetching => Some(Stage::Fetch),
            Self::Transforming => Some(Stage::Transform),
            Self::Enriching => Some(Stage::Enrich),
            Self::Uploading => Some(Stage::Upload),
            Self::Writing => Some(Stage::Write),
            _ => None,
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Stage payloads
// ---------------------------------------------------------------------------

/// Markup flavour of a source item's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    Html,
    Markdown,
    #[default]
    Text,
}

/// A content item as returned by the source platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceContent {
    /// Stable identifier on the source platform.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub format: BodyFormat,
    /// Free-form platform properties carried through to the destination.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edited: Option<DateTime<Utc>>,
}

/// A source item normalized into the destination's structural model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub source_id: String,
    /// Stable record name derived from the title.
    pub name: String,
    pub title: String,
    /// Normalized body in its original markup.
    pub body: String,
    /// Markup-free text used for enrichment prompts.
    pub plain_text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
    pub content_hash: String,
}

/// AI-generated metadata for a document. Missing fields were skipped or failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

/// Independent enrichment requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentKind {
    Summary,
    Title,
    Keywords,
}

impl fmt::Display for EnrichmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Summary => "summary",
            Self::Title => "title",
            Self::Keywords => "keywords",
        };
        f.write_str(name)
    }
}

/// A generated asset persisted to object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    pub path: String,
    pub url: String,
}

/// The record upserted into the destination database, keyed by `source_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRecord {
    pub source_id: String,
    pub name: String,
    pub title: String,
    pub summary: Option<String>,
    pub keywords: Vec<String>,
    /// Destination ids of the tags resolved from `keywords`.
    pub tag_ids: Vec<String>,
    pub asset_url: Option<String>,
    pub body: String,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub content_hash: String,
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// Last completed stage plus the outputs later stages depend on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCheckpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<SourceContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Enrichment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetRef>,
    /// Hash of the normalized document, kept after the payloads are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl StageCheckpoint {
    /// The first stage that has not completed yet.
    pub fn next_stage(&self) -> Option<Stage> {
        match self.completed {
            None => Some(Stage::Fetch),
            Some(stage) => stage.next(),
        }
    }

    /// Drop the stage payloads, keeping the completed stage, the content
    /// hash and the stored asset reference.
    pub fn compact(&mut self) {
        if let Some(document) = self.document.take() {
            self.content_hash = Some(document.content_hash);
        }
        self.content = None;
        self.enrichment = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryTimestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One unit of source content moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    /// Reference handed to the content source's `fetch`.
    pub source_ref: String,
    pub status: EntryStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub stage_checkpoint: StageCheckpoint,
    pub timestamps: EntryTimestamps,
    /// Optimistic concurrency token; bumped by the store on every write.
    #[serde(default)]
    pub revision: u64,
    /// Earliest time a pending retry may start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Entry {
    pub fn new(id: impl Into<String>, source_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source_ref: source_ref.into(),
            status: EntryStatus::Pending,
            attempts: 0,
            last_error: None,
            stage_checkpoint: StageCheckpoint::default(),
            timestamps: EntryTimestamps {
                created_at: now,
                updated_at: now,
                completed_at: None,
            },
            revision: 0,
            next_attempt_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the scheduler may pick this entry now.
    pub fn is_eligible(&self, now: DateTime<Utc>, force: bool) -> bool {
        if self.is_terminal() {
            return force;
        }
        self.next_attempt_at.is_none_or(|due| due <= now)
    }

    /// Move to `to`, enforcing the stage order.
    ///
    /// Staying on the same status is the retry case. Terminal statuses can
    /// only be left through [`Entry::force_reset`]; entering one compacts
    /// the checkpoint.
    pub fn transition(&mut self, to: EntryStatus) -> Result<()> {
        let from = self.status;
        let allowed = if from.is_terminal() {
            false
        } else if to == EntryStatus::Failed {
            true
        } else {
            match (from.rank(), to.rank()) {
                (Some(a), Some(b)) => b >= a,
                _ => false,
            }
        };

        if !allowed {
            return Err(MigratorError::InvalidTransition {
                entry_id: self.id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.status = to;
        let now = Utc::now();
        self.timestamps.updated_at = now;
        if to == EntryStatus::Completed {
            self.timestamps.completed_at = Some(now);
        }
        if to.is_terminal() {
            self.stage_checkpoint.compact();
        }
        Ok(())
    }

    /// Record a successful stage and advance to the next one.
    ///
    /// Completing [`Stage::Write`] marks the entry `Completed`.
    pub fn complete_stage(&mut self, stage: Stage) -> Result<()> {
        let next = match stage.next() {
            Some(next) => next.status(),
            None => EntryStatus::Completed,
        };
        self.transition(next)?;
        self.stage_checkpoint.completed = Some(stage);
        self.last_error = None;
        self.next_attempt_at = None;
        Ok(())
    }

    /// Return to `Pending` with all progress discarded.
    fn clear_progress(&mut self) {
        self.status = EntryStatus::Pending;
        self.attempts = 0;
        self.last_error = None;
        self.stage_checkpoint = StageCheckpoint::default();
        self.next_attempt_at = None;
        self.timestamps.updated_at = Utc::now();
        self.timestamps.completed_at = None;
    }

    /// Reset-pending directive: non-terminal entries restart from scratch.
    /// Returns whether the entry changed.
    pub fn reset_if_in_progress(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        let untouched = self.status == EntryStatus::Pending
            && self.attempts == 0
            && self.stage_checkpoint == StageCheckpoint::default();
        if untouched {
            return false;
        }
        self.clear_progress();
        true
    }

    /// Force-update directive: leave a terminal status and start over.
    pub fn force_reset(&mut self) {
        self.clear_progress();
    }
}

// ---------------------------------------------------------------------------
// MigrationState
// ---------------------------------------------------------------------------

/// The single persisted aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    #[serde(default = "default_format")]
    pub format: u32,
    /// Bumped on every successful entry write.
    pub version: u64,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: BTreeMap<String, Entry>,
}

fn default_format() -> u32 {
    LEDGER_FORMAT_VERSION
}

impl Default for MigrationState {
    fn default() -> Self {
        Self {
            format: LEDGER_FORMAT_VERSION,
            version: 0,
            last_run_at: None,
            entries: BTreeMap::new(),
        }
    }
}

impl MigrationState {
    /// Number of entries per status.
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.status.to_string()).or_insert(0) += 1;
        }
        counts
    }
}
