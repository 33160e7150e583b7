//! Polling state machine for long-running remote generation jobs.
//!
//! `Created → Polling → {Succeeded, Failed, TimedOut}`. [`TaskPoller::poll`]
//! advances a task by exactly one remote status check; [`TaskPoller::drive`]
//! ticks it at a fixed interval until it settles. Abandoning a task locally
//! never cancels the remote job.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use contentmigrator_shared::{AiProvider, MigratorError, PollerConfig, RemoteTaskState, Result};

use crate::rate_limit::{RateLimiter, ServiceClass};

/// Kind of remote job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Image,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => f.write_str("image"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

/// A remote job owned by the poller invocation that created it.
#[derive(Debug, Clone)]
pub struct GenerationTask {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Where the finished result can be downloaded.
    pub result_ref: Option<String>,
    pub error: Option<String>,
    /// Remote status checks performed so far.
    pub polls: u32,
}

impl GenerationTask {
    pub fn new(task_id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            status: TaskStatus::Created,
            result_ref: None,
            error: None,
            polls: 0,
        }
    }
}

pub struct TaskPoller {
    interval: Duration,
    max_attempts: u32,
    limiter: Arc<RateLimiter>,
}

impl TaskPoller {
    pub fn new(config: &PollerConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms),
            max_attempts: config.max_attempts.max(1),
            limiter,
        }
    }

    /// One remote status check. A settled task is left untouched.
    ///
    /// A check that still reports pending and uses up the last allowed poll
    /// moves the task to `TimedOut`.
    pub async fn poll(&self, provider: &dyn AiProvider, task: &mut GenerationTask) -> Result<()> {
        if task.status.is_settled() {
            return Ok(());
        }
        task.status = TaskStatus::Polling;

        self.limiter.acquire(ServiceClass::AiProvider).await;
        task.polls += 1;
        let remote = provider.poll_image_task(&task.task_id).await?;

        match remote.state {
            RemoteTaskState::Succeeded => match remote.result_url {
                Some(url) => {
                    task.result_ref = Some(url);
                    task.status = TaskStatus::Succeeded;
                }
                None => {
                    task.error = Some("task succeeded without a result".into());
                    task.status = TaskStatus::Failed;
                }
            },
            RemoteTaskState::Failed => {
                task.error = remote.error.or_else(|| Some("remote task failed".into()));
                task.status = TaskStatus::Failed;
            }
            RemoteTaskState::Pending => {
                if task.polls >= self.max_attempts {
                    task.status = TaskStatus::TimedOut;
                }
            }
        }
        debug!(task_id = %task.task_id, polls = task.polls, status = ?task.status, "polled task");
        Ok(())
    }

    /// Poll every interval until the task settles.
    ///
    /// Transient poll errors are retried against the same task id while the
    /// poll budget lasts. Returns [`MigratorError::Cancelled`] if `cancel`
    /// fires while waiting.
    #[instrument(skip_all, fields(task_id = %task.task_id, kind = %task.kind))]
    pub async fn drive(
        &self,
        provider: &dyn AiProvider,
        task: &mut GenerationTask,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while !task.status.is_settled() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(MigratorError::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
            match self.poll(provider, task).await {
                Ok(()) => {}
                Err(e) if is_transient(&e) && task.polls < self.max_attempts => {
                    warn!(polls = task.polls, error = %e, "status check failed, polling again");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn is_transient(error: &MigratorError) -> bool {
    matches!(
        error,
        MigratorError::Transient(_) | MigratorError::RateLimited { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAi;

    fn poller(max_attempts: u32) -> TaskPoller {
        TaskPoller::new(
            &PollerConfig {
                interval_ms: 100,
                max_attempts,
            },
            Arc::new(RateLimiter::unlimited()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_exactly_max_polls() {
        let ai = FakeAi::default().with_image_pending_polls(u32::MAX);
        let poller = poller(3);
        let mut task = GenerationTask::new("t1", TaskKind::Image);

        poller
            .drive(&ai, &mut task, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::TimedOut);
        assert_eq!(task.polls, 3);
        assert_eq!(ai.poll_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_remote_finishes() {
        let ai = FakeAi::default().with_image_pending_polls(2);
        let poller = poller(5);
        let mut task = GenerationTask::new("t1", TaskKind::Image);

        poller.poll(&ai, &mut task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Polling);

        poller
            .drive(&ai, &mut task, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.polls, 3);
        assert!(task.result_ref.is_some());

        // Settled tasks make no further remote calls.
        poller.poll(&ai, &mut task).await.unwrap();
        assert_eq!(ai.poll_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_driving() {
        let ai = FakeAi::default().with_image_pending_polls(u32::MAX);
        let poller = poller(100);
        let mut task = GenerationTask::new("t1", TaskKind::Image);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });

        let err = poller.drive(&ai, &mut task, &cancel).await.unwrap_err();
        assert!(matches!(err, MigratorError::Cancelled));
        assert_eq!(task.polls, 2);
        assert_eq!(task.status, TaskStatus::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_errors_keep_the_same_task() {
        let ai = FakeAi::default()
            .with_image_pending_polls(1)
            .failing_polls(2);
        let poller = poller(5);
        let mut task = GenerationTask::new("t1", TaskKind::Image);

        poller
            .drive(&ai, &mut task, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.polls, 4);
        assert_eq!(task.task_id, "t1");
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_stop_at_the_budget() {
        let ai = FakeAi::default().failing_polls(10);
        let poller = poller(3);
        let mut task = GenerationTask::new("t1", TaskKind::Image);

        let err = poller
            .drive(&ai, &mut task, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigratorError::Transient(_)));
        assert_eq!(task.polls, 3);
        assert_eq!(task.status, TaskStatus::Polling);
    }
}
