//! Top-level migration driver.
//!
//! Composes the ledger, scheduler and entry pipeline into the four run
//! modes: a normal run, a dry run against an in-memory copy of the ledger,
//! a single-entry run, and a read-only verify pass.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use contentmigrator_shared::{EntryStatus, MigrationSettings, MigrationState, MigratorError, Result};
use contentmigrator_storage::{MemoryLedger, StateStore};

use crate::pipeline::{Collaborators, EntryPipeline, PipelineOptions};
use crate::rate_limit::{RateLimiter, ServiceClass};
use crate::report::{EntryOutcome, MigrationReport, RunMode, VerifySummary};
use crate::scheduler::{BatchScheduler, Selection};

/// Callback trait for progress reporting (CLI progress bars, logging, etc.).
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a batch window starts.
    fn window_started(&self, index: usize, total: usize, entries: usize);
    /// Called whenever an entry reaches an outcome.
    fn entry_finished(&self, outcome: &EntryOutcome, current: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, report: &MigrationReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn window_started(&self, _index: usize, _total: usize, _entries: usize) {}
    fn entry_finished(&self, _outcome: &EntryOutcome, _current: usize, _total: usize) {}
    fn done(&self, _report: &MigrationReport) {}
}

/// Per-run directives.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub verify_only: bool,
    pub dry_run: bool,
    /// Process only this entry id.
    pub single_entry: Option<String>,
    /// Re-run `Completed`/`Failed` entries from scratch.
    pub force_update: bool,
    /// Restart every in-progress entry from its first stage.
    pub reset_pending: bool,
    /// Cap on entries selected for this run.
    pub limit: Option<usize>,
}

impl RunOptions {
    /// Reject contradictory directives before anything runs.
    pub fn validate(&self) -> Result<()> {
        if self.verify_only {
            let conflicting = [
                (self.dry_run, "--dry-run"),
                (self.force_update, "--force-update"),
                (self.reset_pending, "--reset-pending"),
                (self.single_entry.is_some(), "--single-entry"),
                (self.limit.is_some(), "--limit"),
            ];
            if let Some((_, flag)) = conflicting.iter().find(|(set, _)| *set) {
                return Err(MigratorError::validation(format!(
                    "--verify-only cannot be combined with {flag}"
                )));
            }
        }
        if self.limit == Some(0) {
            return Err(MigratorError::validation("limit must be at least 1"));
        }
        if let Some(id) = &self.single_entry {
            if id.trim().is_empty() {
                return Err(MigratorError::validation("single entry id must not be empty"));
            }
            if self.limit.is_some() {
                return Err(MigratorError::validation(
                    "--single-entry cannot be combined with --limit",
                ));
            }
        }
        Ok(())
    }

    pub fn mode(&self) -> RunMode {
        if self.verify_only {
            RunMode::VerifyOnly
        } else if self.dry_run {
            RunMode::DryRun
        } else {
            RunMode::Run
        }
    }
}

pub struct MigrationOrchestrator {
    store: Arc<StateStore>,
    collaborators: Collaborators,
    settings: MigrationSettings,
    limiter: Arc<RateLimiter>,
}

impl MigrationOrchestrator {
    pub fn new(
        store: Arc<StateStore>,
        collaborators: Collaborators,
        settings: MigrationSettings,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(&settings.rate_limits));
        Self {
            store,
            collaborators,
            settings,
            limiter,
        }
    }

    /// Run one migration pass.
    ///
    /// Errors are reserved for validation and startup failures; per-entry
    /// failures are reported in the returned [`MigrationReport`].
    #[instrument(skip_all, fields(mode = %options.mode()))]
    pub async fn run(
        &self,
        options: &RunOptions,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<MigrationReport> {
        let started = Instant::now();
        options.validate()?;
        self.settings.validate()?;

        let mut report = MigrationReport::new(options.mode());
        info!(run_id = %report.run_id, "run starting");

        progress.phase("Loading ledger");
        let state = self.store.load().await?;

        if options.verify_only {
            progress.phase("Verifying");
            report.verification = Some(self.verify(&state).await?);
            report.elapsed = started.elapsed();
            progress.done(&report);
            return Ok(report);
        }

        // ---- Ledger preparation ----
        let store = if options.dry_run {
            info!("dry run: using an in-memory copy of the ledger");
            Arc::new(StateStore::open(Arc::new(MemoryLedger::seeded(state)))?)
        } else {
            self.store.clone()
        };

        if options.reset_pending {
            let reset = store.reset_pending().await?;
            info!(reset, "in-progress entries reset");
        }

        progress.phase("Registering entries");
        let registered = match &options.single_entry {
            Some(id) => usize::from(store.register(id, id).await?),
            None => {
                self.limiter.acquire(ServiceClass::ContentSource).await;
                let ids = self.collaborators.source.list().await?;
                store.register_all(&ids).await?
            }
        };
        info!(registered, "ledger seeded");
        store.mark_run_started().await?;

        // ---- Selection ----
        let snapshot = store.snapshot().await;
        let selection = match &options.single_entry {
            Some(id) => select_single(&snapshot, id, options.force_update),
            None => BatchScheduler::select_eligible(
                &snapshot,
                Utc::now(),
                options.force_update,
                options.limit,
            ),
        };

        for entry_id in &selection.deferred {
            report.record(&EntryOutcome::Skipped {
                entry_id: entry_id.clone(),
                reason: "retry not yet due".into(),
            });
        }
        for entry_id in &selection.finished {
            let status = snapshot
                .entries
                .get(entry_id)
                .map(|e| e.status.to_string())
                .unwrap_or_default();
            report.record(&EntryOutcome::Skipped {
                entry_id: entry_id.clone(),
                reason: format!("already {status}"),
            });
        }

        if options.force_update {
            for entry_id in &selection.selected {
                let terminal = snapshot
                    .entries
                    .get(entry_id)
                    .is_some_and(|e| e.is_terminal());
                if terminal {
                    store.force_reset(entry_id).await?;
                }
            }
        }

        // ---- Execution ----
        let scheduler = BatchScheduler::new(&self.settings);
        let windows = scheduler.plan_windows(&selection.selected);
        report.windows = windows.len();
        info!(
            selected = selection.selected.len(),
            deferred = selection.deferred.len(),
            windows = windows.len(),
            "entries selected"
        );

        let mut pipeline_options = PipelineOptions::from(&self.settings);
        pipeline_options.dry_run = options.dry_run;
        let pipeline = Arc::new(EntryPipeline::new(
            store,
            self.collaborators.clone(),
            &self.settings,
            self.limiter.clone(),
            pipeline_options,
        ));

        progress.phase("Migrating");
        let outcomes = scheduler
            .execute(&windows, pipeline.clone(), cancel, progress)
            .await;
        for outcome in &outcomes {
            report.record(outcome);
        }

        report.planned_actions = pipeline.take_planned().await;
        report.elapsed = started.elapsed();

        if report.interrupted > 0 {
            warn!(interrupted = report.interrupted, "run interrupted; rerun to resume");
        }
        info!(
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run finished"
        );
        progress.done(&report);
        Ok(report)
    }

    /// Read-only consistency check of ledger, destination and source.
    async fn verify(&self, state: &MigrationState) -> Result<VerifySummary> {
        let mut summary = VerifySummary {
            status_counts: state.status_counts(),
            ..VerifySummary::default()
        };

        for (entry_id, entry) in &state.entries {
            if entry.status == EntryStatus::Completed
                && !self.collaborators.destination.contains(entry_id).await?
            {
                summary.missing_in_destination.push(entry_id.clone());
            }
        }

        self.limiter.acquire(ServiceClass::ContentSource).await;
        match self.collaborators.source.list().await {
            Ok(ids) => {
                summary.unregistered = ids
                    .into_iter()
                    .filter(|id| !state.entries.contains_key(id))
                    .collect();
            }
            Err(e) => {
                warn!(error = %e, "could not list source items");
                summary.source_error = Some(e.to_string());
            }
        }

        info!(
            missing = summary.missing_in_destination.len(),
            unregistered = summary.unregistered.len(),
            consistent = summary.is_consistent(),
            "verification finished"
        );
        Ok(summary)
    }
}

/// An explicitly requested entry runs unless it is terminal and force is off.
fn select_single(state: &MigrationState, entry_id: &str, force: bool) -> Selection {
    let mut selection = Selection::default();
    match state.entries.get(entry_id) {
        Some(entry) if entry.is_terminal() && !force => {
            selection.finished.push(entry_id.to_string());
        }
        Some(_) => selection.selected.push(entry_id.to_string()),
        None => {}
    }
    selection
}
