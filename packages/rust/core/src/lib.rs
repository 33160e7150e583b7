//! Core migration engine for ContentMigrator.
//!
//! Leaves first: [`rate_limit`] and [`retry`] govern external calls,
//! [`poller`] drives long-running generation jobs, [`transform`] normalizes
//! fetched items, [`pipeline`] runs one entry through its stages,
//! [`scheduler`] windows entries under a concurrency cap, and
//! [`orchestrator`] ties them into run, dry-run and verify passes.

pub mod orchestrator;
pub mod pipeline;
pub mod poller;
pub mod rate_limit;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod transform;

#[cfg(test)]
mod testing;

pub use orchestrator::{MigrationOrchestrator, ProgressReporter, RunOptions, SilentProgress};
pub use pipeline::{Collaborators, EntryPipeline, PipelineOptions};
pub use report::{
    EntryOutcome, FailureRecord, MigrationReport, PlannedAction, RunMode, VerifySummary,
};
pub use scheduler::{BatchScheduler, BatchWindow, Selection};
