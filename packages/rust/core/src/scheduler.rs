//! Eligibility selection and windowed, concurrency-bounded execution.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use contentmigrator_shared::{MigrationSettings, MigrationState};

use crate::orchestrator::ProgressReporter;
use crate::pipeline::EntryPipeline;
use crate::report::EntryOutcome;

/// A bounded group of entries processed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWindow {
    pub entry_ids: Vec<String>,
    /// Maximum pipelines running at once inside this window.
    pub concurrency_budget: usize,
}

/// Entries picked for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Eligible ids in ascending order, capped by the limit.
    pub selected: Vec<String>,
    /// In-progress entries whose retry time has not come yet.
    pub deferred: Vec<String>,
    /// Terminal entries left alone because force is off.
    pub finished: Vec<String>,
}

pub struct BatchScheduler {
    batch_size: usize,
    concurrency: usize,
    delay: Duration,
}

impl BatchScheduler {
    pub fn new(settings: &MigrationSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            concurrency: settings.concurrency.max(1),
            delay: settings.delay,
        }
    }

    /// Pick the entries that may run at `now`.
    ///
    /// `Completed` and `Failed` entries only qualify with `force`.
    pub fn select_eligible(
        state: &MigrationState,
        now: DateTime<Utc>,
        force: bool,
        limit: Option<usize>,
    ) -> Selection {
        let mut selection = Selection::default();
        // BTreeMap iteration is already ascending by id.
        for (id, entry) in &state.entries {
            if entry.is_eligible(now, force) {
                selection.selected.push(id.clone());
            } else if entry.is_terminal() {
                selection.finished.push(id.clone());
            } else {
                selection.deferred.push(id.clone());
            }
        }
        if let Some(limit) = limit {
            selection.selected.truncate(limit);
        }
        selection
    }

    /// Split `entry_ids` into windows of at most `batch_size`.
    pub fn plan_windows(&self, entry_ids: &[String]) -> Vec<BatchWindow> {
        entry_ids
            .chunks(self.batch_size)
            .map(|chunk| BatchWindow {
                entry_ids: chunk.to_vec(),
                concurrency_budget: self.concurrency.min(chunk.len()),
            })
            .collect()
    }

    /// Run every window in order, pausing `delay` between windows.
    ///
    /// Returns one outcome per planned entry. Once `cancel` fires no new
    /// entry starts; entries of windows that never began are reported
    /// `Interrupted` and stay untouched in the ledger.
    #[instrument(skip_all, fields(windows = windows.len()))]
    pub async fn execute(
        &self,
        windows: &[BatchWindow],
        pipeline: Arc<EntryPipeline>,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Vec<EntryOutcome> {
        let total: usize = windows.iter().map(|w| w.entry_ids.len()).sum();
        let mut outcomes = Vec::with_capacity(total);

        for (index, window) in windows.iter().enumerate() {
            if index > 0 && !self.delay.is_zero() && !cancel.is_cancelled() {
                debug!(delay_ms = self.delay.as_millis() as u64, "pausing between windows");
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }

            if cancel.is_cancelled() {
                for id in &window.entry_ids {
                    let outcome = not_started(id);
                    progress.entry_finished(&outcome, outcomes.len() + 1, total);
                    outcomes.push(outcome);
                }
                continue;
            }

            info!(
                window = index + 1,
                entries = window.entry_ids.len(),
                concurrency = window.concurrency_budget,
                "starting window"
            );
            progress.window_started(index + 1, windows.len(), window.entry_ids.len());

            let semaphore = Arc::new(Semaphore::new(window.concurrency_budget.max(1)));
            let mut handles = Vec::with_capacity(window.entry_ids.len());

            for id in &window.entry_ids {
                let sem = semaphore.clone();
                let pipeline = pipeline.clone();
                let cancel = cancel.clone();
                let entry_id = id.clone();

                handles.push((
                    id.clone(),
                    tokio::spawn(async move {
                        let Ok(_permit) = sem.acquire_owned().await else {
                            return not_started(&entry_id);
                        };
                        if cancel.is_cancelled() {
                            return not_started(&entry_id);
                        }
                        pipeline.run(&entry_id, &cancel).await
                    }),
                ));
            }

            for (entry_id, handle) in handles {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(%entry_id, error = %e, "pipeline task aborted");
                        EntryOutcome::Interrupted {
                            entry_id,
                            reason: format!("task aborted: {e}"),
                        }
                    }
                };
                progress.entry_finished(&outcome, outcomes.len() + 1, total);
                outcomes.push(outcome);
            }
        }

        outcomes
    }
}

fn not_started(entry_id: &str) -> EntryOutcome {
    EntryOutcome::Interrupted {
        entry_id: entry_id.to_string(),
        reason: "cancelled before start".into(),
    }
}
