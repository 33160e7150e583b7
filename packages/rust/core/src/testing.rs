//! In-memory collaborators for core tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use contentmigrator_shared::{
    AiProvider, AppConfig, BodyFormat, ContentSource, Destination, DestinationRecord, Entry,
    MigrationSettings, MigrationState, MigratorError, ObjectStore, RateLimitsConfig,
    RemoteTaskStatus, Result, SourceContent,
};
use contentmigrator_storage::{MemoryLedger, StateStore};

use crate::pipeline::{Collaborators, EntryPipeline, PipelineOptions};
use crate::rate_limit::RateLimiter;

pub fn item(id: &str) -> SourceContent {
    SourceContent {
        id: id.into(),
        title: Some(format!("Item {id}")),
        body: format!("<p>Body of {id}. It talks about tokio and rust.</p>"),
        format: BodyFormat::Html,
        properties: BTreeMap::new(),
        last_edited: None,
    }
}

// ---------------------------------------------------------------------------
// FakeSource
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeSource {
    items: BTreeMap<String, SourceContent>,
    /// Errors returned by the next fetches of an id, in order.
    failures: Mutex<HashMap<String, Vec<MigratorError>>>,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Duration,
}

impl FakeSource {
    pub fn with_items(count: usize) -> Self {
        let items = (0..count)
            .map(|i| {
                let id = format!("item-{i:02}");
                (id.clone(), item(&id))
            })
            .collect();
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_next(&self, id: &str, errors: Vec<MigratorError>) {
        self.failures
            .lock()
            .unwrap()
            .insert(id.to_string(), errors);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentSource for FakeSource {
    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.items.keys().cloned().collect())
    }

    async fn fetch(&self, source_ref: &str) -> Result<SourceContent> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = {
            let mut failures = self.failures.lock().unwrap();
            failures.get_mut(source_ref).and_then(|errors| {
                if errors.is_empty() {
                    None
                } else {
                    Some(errors.remove(0))
                }
            })
        };
        if let Some(error) = scripted {
            return Err(error);
        }

        self.items
            .get(source_ref)
            .cloned()
            .ok_or_else(|| MigratorError::NotFound(source_ref.to_string()))
    }
}

// ---------------------------------------------------------------------------
// FakeAi
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeAi {
    /// Pending answers before an image task succeeds.
    image_pending_polls: u32,
    fail_summaries: bool,
    fail_keywords: bool,
    /// Number of upcoming status checks that fail transiently.
    poll_failures: AtomicU32,
    polls: AtomicU32,
    tasks_created: AtomicU32,
    text_calls: AtomicU32,
}

impl FakeAi {
    pub fn with_image_pending_polls(mut self, polls: u32) -> Self {
        self.image_pending_polls = polls;
        self
    }

    pub fn failing_summaries(mut self) -> Self {
        self.fail_summaries = true;
        self
    }

    pub fn failing_keywords(mut self) -> Self {
        self.fail_keywords = true;
        self
    }

    pub fn failing_polls(self, count: u32) -> Self {
        self.poll_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn poll_calls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn tasks_created(&self) -> u32 {
        self.tasks_created.load(Ordering::SeqCst)
    }

    pub fn text_calls(&self) -> u32 {
        self.text_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiProvider for FakeAi {
    fn name(&self) -> &str {
        "fake"
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_summaries {
            return Err(MigratorError::fatal("summary model refused"));
        }
        Ok(format!("Summary: {}", text.chars().take(20).collect::<String>()))
    }

    async fn title(&self, _text: &str, current: Option<&str>) -> Result<String> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("Better {}", current.unwrap_or("title")))
    }

    async fn keywords(&self, _text: &str, max: usize) -> Result<Vec<String>> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_keywords {
            return Err(MigratorError::Transient("keyword model overloaded".into()));
        }
        Ok(["rust", "tokio", "async"]
            .iter()
            .take(max)
            .map(|s| s.to_string())
            .collect())
    }

    async fn create_image_task(&self, _prompt: &str) -> Result<String> {
        let n = self.tasks_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("task-{n}"))
    }

    async fn poll_image_task(&self, task_id: &str) -> Result<RemoteTaskStatus> {
        let failed = self
            .poll_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(MigratorError::Transient("status endpoint 502".into()));
        }
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.image_pending_polls {
            Ok(RemoteTaskStatus::pending())
        } else {
            Ok(RemoteTaskStatus::succeeded(format!("fake://images/{task_id}")))
        }
    }

    async fn download(&self, _result_url: &str) -> Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
}

// ---------------------------------------------------------------------------
// FakeObjectStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeObjectStore {
    /// Number of upcoming puts that fail transiently.
    fail_next: AtomicU32,
    puts: AtomicU32,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FakeObjectStore {
    pub fn failing_first(count: u32) -> Self {
        Self {
            fail_next: AtomicU32::new(count),
            ..Self::default()
        }
    }

    pub fn puts(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put(&self, bytes: Vec<u8>, path: &str) -> Result<String> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(MigratorError::Transient("object store 503".into()));
        }
        self.objects.lock().unwrap().insert(path.to_string(), bytes);
        Ok(format!("https://cdn.test/{path}"))
    }
}

// ---------------------------------------------------------------------------
// FakeDestination
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeDestination {
    records: Mutex<BTreeMap<String, DestinationRecord>>,
    tags: Mutex<BTreeMap<String, String>>,
    upserts: AtomicU32,
    tag_creates: AtomicU32,
}

impl FakeDestination {
    pub fn upserts(&self) -> u32 {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn tag_creates(&self) -> u32 {
        self.tag_creates.load(Ordering::SeqCst)
    }

    pub fn record(&self, source_id: &str) -> Option<DestinationRecord> {
        self.records.lock().unwrap().get(source_id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn remove(&self, source_id: &str) {
        self.records.lock().unwrap().remove(source_id);
    }
}

#[async_trait]
impl Destination for FakeDestination {
    async fn find_by_name(&self, name: &str) -> Result<Option<String>> {
        Ok(self.tags.lock().unwrap().get(name).cloned())
    }

    async fn create(&self, name: &str) -> Result<String> {
        self.tag_creates.fetch_add(1, Ordering::SeqCst);
        let mut tags = self.tags.lock().unwrap();
        let next = format!("tag-{}", tags.len() + 1);
        Ok(tags.entry(name.to_string()).or_insert(next).clone())
    }

    async fn upsert(&self, record: &DestinationRecord) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .unwrap()
            .insert(record.source_id.clone(), record.clone());
        Ok(())
    }

    async fn contains(&self, source_id: &str) -> Result<bool> {
        Ok(self.records.lock().unwrap().contains_key(source_id))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A ledger seeded with `item-NN` entries plus fake collaborators.
pub struct Harness {
    pub store: Arc<StateStore>,
    pub source: Arc<FakeSource>,
    pub ai: Arc<FakeAi>,
    pub objects: Arc<FakeObjectStore>,
    pub destination: Arc<FakeDestination>,
    pub settings: MigrationSettings,
}

impl Harness {
    /// A ledger with `count` registered entries.
    pub fn new(count: usize) -> Self {
        let source = FakeSource::with_items(count);
        let mut state = MigrationState::default();
        for id in source.items.keys() {
            state.entries.insert(id.clone(), Entry::new(id.clone(), id.clone()));
        }
        Self {
            store: Arc::new(StateStore::open(Arc::new(MemoryLedger::seeded(state))).unwrap()),
            source: Arc::new(source),
            ai: Arc::new(FakeAi::default()),
            objects: Arc::new(FakeObjectStore::default()),
            destination: Arc::new(FakeDestination::default()),
            settings: Self::settings(),
        }
    }

    /// Fast retries, fast polling, no rate limits.
    pub fn settings() -> MigrationSettings {
        let mut settings = MigrationSettings::from(&AppConfig::default());
        settings.retry.base_delay_ms = 10;
        settings.retry.max_delay_ms = 100;
        settings.retry.jitter = 0.0;
        settings.poller.interval_ms = 10;
        settings.poller.max_attempts = 5;
        settings.rate_limits = RateLimitsConfig {
            content_source: None,
            ai_provider: None,
            object_storage: None,
        };
        settings
    }

    pub fn with_source(mut self, source: FakeSource) -> Self {
        self.source = Arc::new(source);
        self
    }

    pub fn with_ai(mut self, ai: FakeAi) -> Self {
        self.ai = Arc::new(ai);
        self
    }

    pub fn with_objects(mut self, objects: FakeObjectStore) -> Self {
        self.objects = Arc::new(objects);
        self
    }

    pub fn with_settings(mut self, settings: MigrationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            source: self.source.clone(),
            ai: self.ai.clone(),
            objects: self.objects.clone(),
            destination: self.destination.clone(),
        }
    }

    pub fn pipeline(&self, dry_run: bool) -> EntryPipeline {
        let mut options = PipelineOptions::from(&self.settings);
        options.dry_run = dry_run;
        EntryPipeline::new(
            self.store.clone(),
            self.collaborators(),
            &self.settings,
            Arc::new(RateLimiter::new(&self.settings.rate_limits)),
            options,
        )
    }
}
