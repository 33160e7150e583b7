//! Per-entry stage sequence: fetch → transform → enrich → upload → write.
//!
//! Every stage success is checkpointed to the ledger before the next stage
//! starts, together with the payload later stages need, so a resumed entry
//! continues at the first incomplete stage. Stage errors never escape
//! [`EntryPipeline::run`]: they end up as entry status, `last_error`, and an
//! [`EntryOutcome`].

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use contentmigrator_shared::{
    AiProvider, AssetRef, ContentSource, Destination, DestinationRecord, Document, Enrichment,
    EnrichmentKind, Entry, EntryStatus, MigrationSettings, MigratorError, ObjectStore, Result,
    SourceContent, Stage,
};
use contentmigrator_storage::StateStore;

use crate::poller::{GenerationTask, TaskKind, TaskPoller, TaskStatus};
use crate::rate_limit::{RateLimiter, ServiceClass};
use crate::report::{EntryOutcome, PlannedAction};
use crate::retry::RetryPolicy;
use crate::transform;

/// The external systems a pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ContentSource>,
    pub ai: Arc<dyn AiProvider>,
    pub objects: Arc<dyn ObjectStore>,
    pub destination: Arc<dyn Destination>,
}

/// Feature switches for a run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub images: bool,
    pub summaries: bool,
    pub keywords_max: usize,
    /// Enrichment sub-steps whose failure fails the enrich stage.
    pub required_enrichments: Vec<EnrichmentKind>,
    /// Record mutating calls instead of performing them.
    pub dry_run: bool,
}

impl From<&MigrationSettings> for PipelineOptions {
    fn from(settings: &MigrationSettings) -> Self {
        Self {
            images: settings.images_enabled,
            summaries: settings.summaries_enabled,
            keywords_max: settings.keywords_max,
            required_enrichments: settings.required_enrichments.clone(),
            dry_run: false,
        }
    }
}

/// Why a single execution stopped before completing.
enum StageFailure {
    Stage { stage: Stage, error: MigratorError },
    Ledger(MigratorError),
    Cancelled,
}

pub struct EntryPipeline {
    store: Arc<StateStore>,
    collaborators: Collaborators,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    poller: TaskPoller,
    options: PipelineOptions,
    planned: Mutex<Vec<PlannedAction>>,
}

impl EntryPipeline {
    pub fn new(
        store: Arc<StateStore>,
        collaborators: Collaborators,
        settings: &MigrationSettings,
        limiter: Arc<RateLimiter>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            collaborators,
            retry: RetryPolicy::new(&settings.retry, settings.max_attempts),
            poller: TaskPoller::new(&settings.poller, limiter.clone()),
            limiter,
            options,
            planned: Mutex::new(Vec::new()),
        }
    }

    /// Drain the actions recorded during a dry run.
    pub async fn take_planned(&self) -> Vec<PlannedAction> {
        std::mem::take(&mut *self.planned.lock().await)
    }

    /// Drive one entry until it completes, fails, or is interrupted.
    ///
    /// Each execution increments `attempts` before any stage runs and
    /// resumes at the first stage without a checkpoint. Retryable failures
    /// back off and execute again until the attempt ceiling is reached.
    #[instrument(skip_all, fields(entry_id = %entry_id))]
    pub async fn run(&self, entry_id: &str, cancel: &CancellationToken) -> EntryOutcome {
        let Some(mut entry) = self.store.get_entry(entry_id).await else {
            return EntryOutcome::Skipped {
                entry_id: entry_id.to_string(),
                reason: "not in ledger".into(),
            };
        };
        if entry.is_terminal() {
            return EntryOutcome::Skipped {
                entry_id: entry_id.to_string(),
                reason: format!("entry is {}", entry.status),
            };
        }

        loop {
            if cancel.is_cancelled() {
                return interrupted(entry_id, "cancelled");
            }

            let Some(next) = entry.stage_checkpoint.next_stage() else {
                let error = MigratorError::fatal("checkpoint past the last stage");
                return self.give_up(entry, None, error).await;
            };
            if let Err(error) = entry.transition(next.status()) {
                return self.give_up(entry, Some(next), error).await;
            }
            entry.attempts += 1;
            entry.next_attempt_at = None;
            info!(attempt = entry.attempts, stage = %next, "starting execution");

            entry = match self.checkpoint(entry).await {
                Ok(stored) => stored,
                Err(e) => return interrupted(entry_id, &format!("ledger write failed: {e}")),
            };

            let (stage, error) = match self.run_stages(&mut entry, cancel).await {
                Ok(()) => {
                    info!(attempts = entry.attempts, "entry completed");
                    return EntryOutcome::Completed {
                        entry_id: entry_id.to_string(),
                        attempts: entry.attempts,
                    };
                }
                Err(StageFailure::Cancelled) => {
                    let stage = entry.stage_checkpoint.next_stage();
                    info!(stage = ?stage, "interrupted; checkpoint kept");
                    return interrupted(entry_id, "cancelled");
                }
                Err(StageFailure::Ledger(e)) => {
                    warn!(error = %e, "ledger write failed; leaving entry for resume");
                    return interrupted(entry_id, &format!("ledger write failed: {e}"));
                }
                Err(StageFailure::Stage { stage, error }) => (stage, error),
            };

            let class = self.retry.classify(&error);
            entry.last_error = Some(format!("{stage}: {error}"));

            if !self.retry.should_retry(class, entry.attempts) {
                return self.give_up(entry, Some(stage), error).await;
            }

            let delay = self.retry.backoff_for(&error, entry.attempts);
            let due =
                chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            entry.next_attempt_at = Some(Utc::now() + due);
            warn!(
                stage = %stage,
                attempt = entry.attempts,
                class = ?class,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "stage failed, retrying"
            );

            entry = match self.checkpoint(entry).await {
                Ok(stored) => stored,
                Err(e) => return interrupted(entry_id, &format!("ledger write failed: {e}")),
            };

            tokio::select! {
                _ = cancel.cancelled() => return interrupted(entry_id, "cancelled during backoff"),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run the remaining stages, checkpointing after each.
    async fn run_stages(
        &self,
        entry: &mut Entry,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), StageFailure> {
        while let Some(stage) = entry.stage_checkpoint.next_stage() {
            if cancel.is_cancelled() {
                return Err(StageFailure::Cancelled);
            }
            entry
                .transition(stage.status())
                .map_err(|error| StageFailure::Stage { stage, error })?;

            debug!(stage = %stage, "running stage");
            match self.run_stage(stage, entry, cancel).await {
                Ok(()) => {}
                Err(MigratorError::Cancelled) => return Err(StageFailure::Cancelled),
                Err(error) => return Err(StageFailure::Stage { stage, error }),
            }

            entry
                .complete_stage(stage)
                .map_err(|error| StageFailure::Stage { stage, error })?;
            *entry = self
                .checkpoint(entry.clone())
                .await
                .map_err(StageFailure::Ledger)?;
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: Stage,
        entry: &mut Entry,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let checkpoint = &mut entry.stage_checkpoint;
        match stage {
            Stage::Fetch => {
                let content = self.fetch(&entry.source_ref).await?;
                checkpoint.content = Some(content);
            }
            Stage::Transform => {
                let content = required(&checkpoint.content, "source content")?;
                let document = transform::normalize(&entry.id, content)?;
                checkpoint.document = Some(document);
                checkpoint.content = None;
            }
            Stage::Enrich => {
                let document = required(&checkpoint.document, "document")?;
                let enrichment = self.enrich(document).await?;
                checkpoint.enrichment = Some(enrichment);
            }
            Stage::Upload => {
                let document = required(&checkpoint.document, "document")?;
                let asset = self
                    .upload(&entry.id, document, checkpoint.enrichment.as_ref(), cancel)
                    .await?;
                checkpoint.asset = asset;
            }
            Stage::Write => {
                let document = required(&checkpoint.document, "document")?;
                let record = self
                    .write(
                        &entry.id,
                        document,
                        checkpoint.enrichment.as_ref(),
                        checkpoint.asset.as_ref(),
                    )
                    .await?;
                debug!(name = %record.name, tags = record.tag_ids.len(), "record written");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    async fn fetch(&self, source_ref: &str) -> Result<SourceContent> {
        self.limiter.acquire(ServiceClass::ContentSource).await;
        self.collaborators.source.fetch(source_ref).await
    }

    /// Summary, title and keywords as independent requests.
    async fn enrich(&self, document: &Document) -> Result<Enrichment> {
        if !self.options.summaries {
            return Ok(Enrichment::default());
        }

        let ai = self.collaborators.ai.as_ref();
        let text = if document.plain_text.is_empty() {
            document.title.as_str()
        } else {
            document.plain_text.as_str()
        };
        let max = self.options.keywords_max;

        let (summary, title, keywords) = tokio::join!(
            async {
                self.limiter.acquire(ServiceClass::AiProvider).await;
                ai.summarize(text).await
            },
            async {
                self.limiter.acquire(ServiceClass::AiProvider).await;
                ai.title(text, Some(&document.title)).await
            },
            async {
                if max == 0 {
                    return Ok(Vec::new());
                }
                self.limiter.acquire(ServiceClass::AiProvider).await;
                ai.keywords(text, max).await
            },
        );

        let mut enrichment = Enrichment::default();
        let mut required_failure = None;

        match summary {
            Ok(summary) => enrichment.summary = Some(summary),
            Err(e) => self.sub_step_failed(EnrichmentKind::Summary, e, &mut required_failure),
        }
        match title {
            Ok(title) => enrichment.title = Some(title),
            Err(e) => self.sub_step_failed(EnrichmentKind::Title, e, &mut required_failure),
        }
        match keywords {
            Ok(keywords) => enrichment.keywords = keywords,
            Err(e) => self.sub_step_failed(EnrichmentKind::Keywords, e, &mut required_failure),
        }

        match required_failure {
            Some(error) => Err(error),
            None => Ok(enrichment),
        }
    }

    fn sub_step_failed(
        &self,
        kind: EnrichmentKind,
        error: MigratorError,
        required_failure: &mut Option<MigratorError>,
    ) {
        if self.options.required_enrichments.contains(&kind) {
            warn!(kind = %kind, error = %error, "required enrichment failed");
            required_failure.get_or_insert(error);
        } else {
            warn!(kind = %kind, error = %error, "optional enrichment failed, continuing");
        }
    }

    /// Generate an illustration and store it.
    async fn upload(
        &self,
        entry_id: &str,
        document: &Document,
        enrichment: Option<&Enrichment>,
        cancel: &CancellationToken,
    ) -> Result<Option<AssetRef>> {
        if !self.options.images {
            return Ok(None);
        }

        let path = format!("images/{}.png", object_key(entry_id));
        if self.options.dry_run {
            self.plan(PlannedAction::CreateImageTask {
                entry_id: entry_id.to_string(),
            })
            .await;
            self.plan(PlannedAction::Upload {
                entry_id: entry_id.to_string(),
                path,
            })
            .await;
            return Ok(None);
        }

        let ai = self.collaborators.ai.as_ref();
        let prompt = image_prompt(document, enrichment);

        self.limiter.acquire(ServiceClass::AiProvider).await;
        let task_id = ai.create_image_task(&prompt).await?;
        let mut task = GenerationTask::new(task_id, TaskKind::Image);
        self.poller.drive(ai, &mut task, cancel).await?;

        let result_url = match task.status {
            TaskStatus::Succeeded => task.result_ref.clone(),
            TaskStatus::TimedOut => {
                return Err(MigratorError::Transient(format!(
                    "image task {} timed out after {} polls",
                    task.task_id, task.polls
                )));
            }
            _ => None,
        }
        .ok_or_else(|| {
            MigratorError::Transient(format!(
                "image task {} failed: {}",
                task.task_id,
                task.error.as_deref().unwrap_or("no result")
            ))
        })?;

        self.limiter.acquire(ServiceClass::AiProvider).await;
        let bytes = ai.download(&result_url).await?;

        self.limiter.acquire(ServiceClass::ObjectStorage).await;
        let url = self.collaborators.objects.put(bytes, &path).await?;
        info!(%url, "asset stored");
        Ok(Some(AssetRef { path, url }))
    }

    /// Resolve tags and upsert the record keyed by the entry id.
    async fn write(
        &self,
        entry_id: &str,
        document: &Document,
        enrichment: Option<&Enrichment>,
        asset: Option<&AssetRef>,
    ) -> Result<DestinationRecord> {
        let destination = self.collaborators.destination.as_ref();
        let enrichment = enrichment.cloned().unwrap_or_default();

        let mut tag_ids = Vec::with_capacity(enrichment.keywords.len());
        for keyword in &enrichment.keywords {
            match destination.find_by_name(keyword).await? {
                Some(id) => tag_ids.push(id),
                None if self.options.dry_run => {
                    self.plan(PlannedAction::CreateTag {
                        entry_id: entry_id.to_string(),
                        name: keyword.clone(),
                    })
                    .await;
                }
                None => tag_ids.push(destination.create(keyword).await?),
            }
        }

        let record = DestinationRecord {
            source_id: document.source_id.clone(),
            name: document.name.clone(),
            title: enrichment.title.unwrap_or_else(|| document.title.clone()),
            summary: enrichment.summary,
            keywords: enrichment.keywords,
            tag_ids,
            asset_url: asset.map(|a| a.url.clone()),
            body: document.body.clone(),
            properties: document.properties.clone(),
            content_hash: document.content_hash.clone(),
        };

        if self.options.dry_run {
            self.plan(PlannedAction::Upsert {
                entry_id: entry_id.to_string(),
                name: record.name.clone(),
            })
            .await;
        } else {
            destination.upsert(&record).await?;
        }
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Ledger helpers
    // -----------------------------------------------------------------------

    /// Persist `entry`.
    ///
    /// On a revision conflict the stored entry is reloaded. If another writer
    /// finished it or checkpointed a later stage the conflict is returned;
    /// otherwise this execution's progress is re-applied on top of the
    /// stored revision once.
    async fn checkpoint(&self, entry: Entry) -> Result<Entry> {
        let conflict = match self.store.upsert_entry(entry.clone()).await {
            Err(conflict @ MigratorError::Conflict { .. }) => conflict,
            other => return other,
        };
        let stored = self
            .store
            .get_entry(&entry.id)
            .await
            .ok_or_else(|| MigratorError::NotFound(format!("ledger entry {}", entry.id)))?;

        let overtaken = stored.stage_checkpoint.completed > entry.stage_checkpoint.completed;
        if stored.is_terminal() || overtaken {
            warn!(
                stored_status = %stored.status,
                stored_stage = ?stored.stage_checkpoint.completed,
                "entry advanced by another writer"
            );
            return Err(conflict);
        }

        debug!(revision = stored.revision, "revision conflict, re-applying progress");
        let mut merged = entry;
        merged.revision = stored.revision;
        merged.attempts = merged.attempts.max(stored.attempts);
        self.store.upsert_entry(merged).await
    }

    /// Mark the entry failed and report it.
    async fn give_up(
        &self,
        mut entry: Entry,
        stage: Option<Stage>,
        error: MigratorError,
    ) -> EntryOutcome {
        let entry_id = entry.id.clone();
        warn!(stage = ?stage, attempts = entry.attempts, error = %error, "entry failed");

        entry.last_error = Some(match stage {
            Some(stage) => format!("{stage}: {error}"),
            None => error.to_string(),
        });
        entry.next_attempt_at = None;
        if let Err(e) = entry.transition(EntryStatus::Failed) {
            return interrupted(&entry_id, &e.to_string());
        }
        if let Err(e) = self.checkpoint(entry).await {
            return interrupted(&entry_id, &format!("ledger write failed: {e}"));
        }

        EntryOutcome::Failed {
            entry_id,
            stage,
            error: error.to_string(),
        }
    }

    async fn plan(&self, action: PlannedAction) {
        debug!(%action, "planned");
        self.planned.lock().await.push(action);
    }
}

fn interrupted(entry_id: &str, reason: &str) -> EntryOutcome {
    EntryOutcome::Interrupted {
        entry_id: entry_id.to_string(),
        reason: reason.to_string(),
    }
}

fn required<'a, T>(payload: &'a Option<T>, what: &str) -> Result<&'a T> {
    payload
        .as_ref()
        .ok_or_else(|| MigratorError::fatal(format!("checkpoint is missing the {what}")))
}

/// Path-safe form of an entry id.
///
/// Sanitizing is lossy, so the key ends with a short hash of the raw id.
fn object_key(entry_id: &str) -> String {
    let safe: String = entry_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let digest = format!("{:x}", Sha256::digest(entry_id.as_bytes()));
    format!("{safe}-{}", &digest[..12])
}

fn image_prompt(document: &Document, enrichment: Option<&Enrichment>) -> String {
    let title = enrichment
        .and_then(|e| e.title.as_deref())
        .unwrap_or(&document.title);
    match enrichment.and_then(|e| e.summary.as_deref()) {
        Some(summary) => {
            format!("An editorial illustration for an article titled \"{title}\". {summary}")
        }
        None => format!("An editorial illustration for an article titled \"{title}\"."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use contentmigrator_shared::{AppConfig, StageCheckpoint};

    use crate::testing::{FakeAi, FakeObjectStore, Harness, item};

    #[tokio::test(start_paused = true)]
    async fn upload_retries_then_completes_with_one_write() {
        let harness = Harness::new(1).with_objects(FakeObjectStore::failing_first(2));
        let pipeline = harness.pipeline(false);

        let outcome = pipeline.run("item-00", &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            EntryOutcome::Completed {
                entry_id: "item-00".into(),
                attempts: 3
            }
        );

        let entry = harness.store.get_entry("item-00").await.unwrap();
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(entry.attempts, 3);
        assert!(entry.last_error.is_none());
        assert_eq!(harness.destination.upserts(), 1);
        assert_eq!(harness.objects.puts(), 3);
        assert_eq!(harness.objects.object_count(), 1);
        // Earlier stages were checkpointed and never re-ran.
        assert_eq!(harness.source.fetches(), 1);
        assert_eq!(harness.ai.text_calls(), 3);

        let record = harness.destination.record("item-00").unwrap();
        assert_eq!(record.title, "Better Item item-00");
        let expected_url = format!("https://cdn.test/images/{}.png", object_key("item-00"));
        assert_eq!(record.asset_url, Some(expected_url));

        // Completed entries keep only the hash and the asset reference.
        let checkpoint = &entry.stage_checkpoint;
        assert!(checkpoint.document.is_none());
        assert!(checkpoint.content_hash.is_some());
        assert!(checkpoint.asset.is_some());
        assert_eq!(record.tag_ids.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_status_checks_reuse_the_image_task() {
        let harness = Harness::new(1).with_ai(FakeAi::default().failing_polls(2));
        let outcome = harness.pipeline(false).run("item-00", &CancellationToken::new()).await;

        assert!(matches!(outcome, EntryOutcome::Completed { attempts: 1, .. }));
        assert_eq!(harness.ai.tasks_created(), 1);
        assert_eq!(harness.objects.puts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_fails_immediately() {
        let harness = Harness::new(1);
        harness
            .source
            .fail_next("item-00", vec![MigratorError::NotFound("item-00".into())]);

        let outcome = harness.pipeline(false).run("item-00", &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            EntryOutcome::Failed {
                stage: Some(Stage::Fetch),
                ..
            }
        ));

        let entry = harness.store.get_entry("item-00").await.unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.attempts, 1);
        assert!(entry.last_error.as_deref().unwrap().starts_with("fetch: not found"));
        assert_eq!(harness.destination.upserts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_attempts() {
        let harness = Harness::new(1);
        harness.source.fail_next(
            "item-00",
            (0..5)
                .map(|_| MigratorError::Transient("connection reset".into()))
                .collect(),
        );

        let outcome = harness.pipeline(false).run("item-00", &CancellationToken::new()).await;
        assert!(matches!(outcome, EntryOutcome::Failed { .. }));

        let entry = harness.store.get_entry("item-00").await.unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.attempts, 3);
        assert_eq!(harness.source.fetches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn optional_enrichment_failure_does_not_block() {
        let harness = Harness::new(1).with_ai(FakeAi::default().failing_keywords());
        let outcome = harness.pipeline(false).run("item-00", &CancellationToken::new()).await;
        assert!(matches!(outcome, EntryOutcome::Completed { attempts: 1, .. }));

        let record = harness.destination.record("item-00").unwrap();
        assert!(record.summary.is_some());
        assert!(record.keywords.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn required_enrichment_failure_fails_stage() {
        let harness = Harness::new(1).with_ai(FakeAi::default().failing_summaries());
        let outcome = harness.pipeline(false).run("item-00", &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            EntryOutcome::Failed {
                stage: Some(Stage::Enrich),
                ..
            }
        ));

        // The failed entry remembers how far it got but drops the payloads.
        let entry = harness.store.get_entry("item-00").await.unwrap();
        assert_eq!(entry.stage_checkpoint.completed, Some(Stage::Transform));
        assert!(entry.stage_checkpoint.document.is_none());
        assert!(entry.stage_checkpoint.content_hash.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_at_first_incomplete_stage() {
        let harness = Harness::new(1);
        let document = transform::normalize("item-00", &item("item-00")).unwrap();

        let mut entry = harness.store.get_entry("item-00").await.unwrap();
        entry.status = EntryStatus::Uploading;
        entry.attempts = 1;
        entry.stage_checkpoint = StageCheckpoint {
            completed: Some(Stage::Enrich),
            content: None,
            document: Some(document),
            enrichment: Some(Enrichment {
                summary: Some("Saved summary".into()),
                title: None,
                keywords: vec![],
            }),
            asset: None,
            content_hash: None,
        };
        harness.store.upsert_entry(entry).await.unwrap();

        let outcome = harness.pipeline(false).run("item-00", &CancellationToken::new()).await;
        assert!(matches!(outcome, EntryOutcome::Completed { attempts: 2, .. }));
        assert_eq!(harness.source.fetches(), 0);
        assert_eq!(harness.ai.text_calls(), 0);
        assert_eq!(harness.ai.tasks_created(), 1);

        let record = harness.destination.record("item-00").unwrap();
        assert_eq!(record.summary.as_deref(), Some("Saved summary"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_keeps_entry_resumable() {
        let mut settings = Harness::settings();
        settings.retry.base_delay_ms = 60_000;
        settings.retry.max_delay_ms = 60_000;
        let harness = Harness::new(1).with_settings(settings);
        harness
            .source
            .fail_next("item-00", vec![MigratorError::Transient("timeout".into())]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = harness.pipeline(false).run("item-00", &cancel).await;
        assert!(matches!(outcome, EntryOutcome::Interrupted { .. }));

        let entry = harness.store.get_entry("item-00").await.unwrap();
        assert_eq!(entry.status, EntryStatus::Fetching);
        assert_eq!(entry.attempts, 1);
        assert!(entry.next_attempt_at.is_some());
        assert!(entry.last_error.is_some());
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let harness = Harness::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = harness.pipeline(false).run("item-00", &cancel).await;
        assert!(matches!(outcome, EntryOutcome::Interrupted { .. }));
        let entry = harness.store.get_entry("item-00").await.unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.attempts, 0);
    }

    #[tokio::test]
    async fn terminal_and_unknown_entries_are_skipped() {
        let harness = Harness::new(1);
        let pipeline = harness.pipeline(false);
        let cancel = CancellationToken::new();

        assert!(matches!(
            pipeline.run("missing", &cancel).await,
            EntryOutcome::Skipped { .. }
        ));

        pipeline.run("item-00", &cancel).await;
        assert!(matches!(
            pipeline.run("item-00", &cancel).await,
            EntryOutcome::Skipped { .. }
        ));
        assert_eq!(harness.destination.upserts(), 1);
    }

    #[tokio::test]
    async fn dry_run_records_mutations_instead() {
        let harness = Harness::new(1);
        let pipeline = harness.pipeline(true);

        let outcome = pipeline.run("item-00", &CancellationToken::new()).await;
        assert!(matches!(outcome, EntryOutcome::Completed { .. }));

        let planned = pipeline.take_planned().await;
        assert_eq!(
            planned.first(),
            Some(&PlannedAction::CreateImageTask {
                entry_id: "item-00".into()
            })
        );
        assert!(planned.contains(&PlannedAction::Upload {
            entry_id: "item-00".into(),
            path: format!("images/{}.png", object_key("item-00")),
        }));
        let tags = planned
            .iter()
            .filter(|a| matches!(a, PlannedAction::CreateTag { .. }))
            .count();
        assert_eq!(tags, 3);
        assert!(matches!(planned.last(), Some(PlannedAction::Upsert { .. })));

        assert_eq!(harness.destination.upserts(), 0);
        assert_eq!(harness.destination.tag_creates(), 0);
        assert_eq!(harness.ai.tasks_created(), 0);
        assert_eq!(harness.objects.puts(), 0);
    }

    #[tokio::test]
    async fn skipping_features_avoids_ai_calls() {
        let mut settings = MigrationSettings::from(&AppConfig::default());
        settings.images_enabled = false;
        settings.summaries_enabled = false;
        settings.rate_limits = Harness::settings().rate_limits;
        let harness = Harness::new(1).with_settings(settings);

        let outcome = harness.pipeline(false).run("item-00", &CancellationToken::new()).await;
        assert!(matches!(outcome, EntryOutcome::Completed { .. }));
        assert_eq!(harness.ai.text_calls(), 0);
        assert_eq!(harness.ai.tasks_created(), 0);

        let record = harness.destination.record("item-00").unwrap();
        assert_eq!(record.title, "Item item-00");
        assert!(record.asset_url.is_none());
    }

    #[test]
    fn object_keys_are_path_safe() {
        let key = object_key("a/b c.d");
        assert!(key.starts_with("a-b-c-d-"));
        assert!(object_key("item_01-x").starts_with("item_01-x-"));
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn distinct_ids_never_share_an_object_key() {
        assert_ne!(object_key("a/b"), object_key("a.b"));
        assert_ne!(object_key("!!"), object_key("??"));
        assert_ne!(object_key("a-b"), object_key("a/b"));
        assert_eq!(object_key("item-00"), object_key("item-00"));
    }

    #[tokio::test]
    async fn stale_checkpoint_never_reopens_a_terminal_entry() {
        let harness = Harness::new(1);
        let pipeline = harness.pipeline(false);
        let mut stale = harness.store.get_entry("item-00").await.unwrap();

        let mut other = stale.clone();
        other.transition(EntryStatus::Failed).unwrap();
        harness.store.upsert_entry(other).await.unwrap();

        stale.transition(EntryStatus::Fetching).unwrap();
        let err = pipeline.checkpoint(stale).await.unwrap_err();
        assert!(matches!(err, MigratorError::Conflict { .. }));
        let stored = harness.store.get_entry("item-00").await.unwrap();
        assert_eq!(stored.status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn stale_checkpoint_behind_another_writer_is_rejected() {
        let harness = Harness::new(1);
        let pipeline = harness.pipeline(false);
        let mut stale = harness.store.get_entry("item-00").await.unwrap();

        let mut other = stale.clone();
        other.transition(EntryStatus::Fetching).unwrap();
        other.complete_stage(Stage::Fetch).unwrap();
        harness.store.upsert_entry(other).await.unwrap();

        stale.transition(EntryStatus::Fetching).unwrap();
        stale.attempts = 1;
        assert!(pipeline.checkpoint(stale).await.is_err());
        let stored = harness.store.get_entry("item-00").await.unwrap();
        assert_eq!(stored.stage_checkpoint.completed, Some(Stage::Fetch));
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn checkpoint_reapplies_progress_after_unrelated_write() {
        let harness = Harness::new(1);
        let pipeline = harness.pipeline(false);
        let mut stale = harness.store.get_entry("item-00").await.unwrap();

        let other = stale.clone();
        let bumped = harness.store.upsert_entry(other).await.unwrap();

        stale.transition(EntryStatus::Fetching).unwrap();
        stale.attempts = 1;
        let stored = pipeline.checkpoint(stale).await.unwrap();
        assert_eq!(stored.status, EntryStatus::Fetching);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.revision, bumped.revision + 1);
    }
}
