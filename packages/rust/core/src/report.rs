//! Run results.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use contentmigrator_shared::Stage;

/// Which kind of pass produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Run,
    DryRun,
    VerifyOnly,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Run => "run",
            Self::DryRun => "dry-run",
            Self::VerifyOnly => "verify-only",
        };
        f.write_str(name)
    }
}

/// A mutating call recorded instead of performed during a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PlannedAction {
    CreateImageTask { entry_id: String },
    Upload { entry_id: String, path: String },
    CreateTag { entry_id: String, name: String },
    Upsert { entry_id: String, name: String },
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateImageTask { entry_id } => write!(f, "[{entry_id}] create image task"),
            Self::Upload { entry_id, path } => write!(f, "[{entry_id}] upload {path}"),
            Self::CreateTag { entry_id, name } => write!(f, "[{entry_id}] create tag '{name}'"),
            Self::Upsert { entry_id, name } => write!(f, "[{entry_id}] upsert record '{name}'"),
        }
    }
}

/// How a single entry's pipeline execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Completed {
        entry_id: String,
        attempts: u32,
    },
    Failed {
        entry_id: String,
        stage: Option<Stage>,
        error: String,
    },
    /// Not run: missing from the ledger, terminal, or not yet due.
    Skipped {
        entry_id: String,
        reason: String,
    },
    /// Cut short by cancellation or a ledger failure; resumable.
    Interrupted {
        entry_id: String,
        reason: String,
    },
}

impl EntryOutcome {
    pub fn entry_id(&self) -> &str {
        match self {
            Self::Completed { entry_id, .. }
            | Self::Failed { entry_id, .. }
            | Self::Skipped { entry_id, .. }
            | Self::Interrupted { entry_id, .. } => entry_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub entry_id: String,
    pub stage: Option<Stage>,
    pub error: String,
}

/// Result of a verify-only pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySummary {
    /// Ledger entries per status.
    pub status_counts: BTreeMap<String, usize>,
    /// `Completed` entries with no destination record.
    pub missing_in_destination: Vec<String>,
    /// Source items the ledger does not track yet.
    pub unregistered: Vec<String>,
    /// Set when the source could not be listed.
    pub source_error: Option<String>,
}

impl VerifySummary {
    pub fn is_consistent(&self) -> bool {
        self.missing_in_destination.is_empty()
            && self.unregistered.is_empty()
            && self.source_error.is_none()
    }
}

/// Summary of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub run_id: String,
    pub mode: RunMode,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub interrupted: usize,
    pub failures: Vec<FailureRecord>,
    pub windows: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned_actions: Vec<PlannedAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerifySummary>,
    #[serde(rename = "elapsedMs", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl MigrationReport {
    pub fn new(mode: RunMode) -> Self {
        Self {
            run_id: Uuid::now_v7().to_string(),
            mode,
            completed: 0,
            failed: 0,
            skipped: 0,
            interrupted: 0,
            failures: Vec::new(),
            windows: 0,
            planned_actions: Vec::new(),
            verification: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn record(&mut self, outcome: &EntryOutcome) {
        match outcome {
            EntryOutcome::Completed { .. } => self.completed += 1,
            EntryOutcome::Failed {
                entry_id,
                stage,
                error,
            } => {
                self.failed += 1;
                self.failures.push(FailureRecord {
                    entry_id: entry_id.clone(),
                    stage: *stage,
                    error: error.clone(),
                });
            }
            EntryOutcome::Skipped { .. } => self.skipped += 1,
            EntryOutcome::Interrupted { .. } => self.interrupted += 1,
        }
    }

    /// Entries the run selected and drove to an outcome.
    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.interrupted
    }
}
