//! Contracts for the external systems the migration core talks to.
//!
//! Implementations live in `contentmigrator-providers` (HTTP and local
//! adapters) and `contentmigrator-storage` (destination database). The core
//! only ever sees these traits, so tests can substitute in-memory fakes.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{DestinationRecord, SourceContent};

/// The platform content is migrated from.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Identifiers of every item the source currently exposes.
    async fn list(&self) -> Result<Vec<String>>;

    /// Fetch one item. Fails with `NotFound` or `Transient`.
    async fn fetch(&self, source_ref: &str) -> Result<SourceContent>;
}

/// Remote state of a long-running generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTaskState {
    Pending,
    Succeeded,
    Failed,
}

/// One status check of a remote generation job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTaskStatus {
    pub state: RemoteTaskState,
    pub result_url: Option<String>,
    pub error: Option<String>,
}

impl RemoteTaskStatus {
    pub fn pending() -> Self {
        Self {
            state: RemoteTaskState::Pending,
            result_url: None,
            error: None,
        }
    }

    pub fn succeeded(result_url: impl Into<String>) -> Self {
        Self {
            state: RemoteTaskState::Succeeded,
            result_url: Some(result_url.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: RemoteTaskState::Failed,
            result_url: None,
            error: Some(error.into()),
        }
    }
}

/// Text and image generation capabilities.
///
/// Every request is stateless. Image generation is asynchronous: a task is
/// created, polled until it settles, and its result downloaded.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Short provider label for logs.
    fn name(&self) -> &str;

    async fn summarize(&self, text: &str) -> Result<String>;

    async fn title(&self, text: &str, current: Option<&str>) -> Result<String>;

    async fn keywords(&self, text: &str, max: usize) -> Result<Vec<String>>;

    /// Start a remote image generation job and return its id.
    async fn create_image_task(&self, prompt: &str) -> Result<String>;

    /// Check a job's status once.
    async fn poll_image_task(&self, task_id: &str) -> Result<RemoteTaskStatus>;

    /// Download a finished job's result.
    async fn download(&self, result_url: &str) -> Result<Vec<u8>>;
}

/// Object storage for generated assets.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path` and return the public URL.
    async fn put(&self, bytes: Vec<u8>, path: &str) -> Result<String>;
}

/// The structured database content is migrated into.
///
/// `upsert` must be keyed by the record's stable source id so repeated
/// writes for one entry never duplicate it.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Look up a tag by name.
    async fn find_by_name(&self, name: &str) -> Result<Option<String>>;

    /// Create a tag and return its id.
    async fn create(&self, name: &str) -> Result<String>;

    async fn upsert(&self, record: &DestinationRecord) -> Result<()>;

    /// Whether a record for `source_id` exists. Read-only.
    async fn contains(&self, source_id: &str) -> Result<bool>;
}
