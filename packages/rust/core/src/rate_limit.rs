//! Token-bucket throttling per external service class.
//!
//! Each class has its own bucket behind its own async mutex. A waiter keeps
//! the lock while it sleeps for the next token, so grants are handed out in
//! arrival order and a busy class never delays another.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use contentmigrator_shared::{RateLimitConfig, RateLimitsConfig};

/// External services that are throttled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceClass {
    ContentSource,
    AiProvider,
    ObjectStorage,
}

impl fmt::Display for ServiceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ContentSource => "content_source",
            Self::AiProvider => "ai_provider",
            Self::ObjectStorage => "object_storage",
        };
        f.write_str(name)
    }
}

/// A bucket tracked as the theoretical arrival time of the next token.
#[derive(Debug)]
struct Bucket {
    /// Time between two tokens, rounded up to whole nanoseconds.
    interval: Duration,
    /// How far ahead of `now` the schedule may run (burst - 1 tokens).
    tolerance: Duration,
    next_free: Mutex<Instant>,
}

impl Bucket {
    fn new(limit: &RateLimitConfig) -> Self {
        let requests = u128::from(limit.requests.max(1));
        let nanos = limit.per.as_duration().as_nanos().div_ceil(requests);
        let interval = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        let tolerance = interval * limit.burst.max(1).saturating_sub(1);
        Self {
            interval,
            tolerance,
            next_free: Mutex::new(Instant::now()),
        }
    }

    async fn acquire(&self) {
        let mut next_free = self.next_free.lock().await;
        let now = Instant::now();
        let scheduled = (*next_free).max(now);

        let earliest = scheduled.checked_sub(self.tolerance).unwrap_or(now);
        if earliest > now {
            trace!(wait_ms = (earliest - now).as_millis() as u64, "waiting for token");
            tokio::time::sleep_until(earliest).await;
        }
        *next_free = scheduled + self.interval;
    }
}

/// Per-class token buckets. A class without a configured limit is unthrottled.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: HashMap<ServiceClass, Bucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitsConfig) -> Self {
        let mut buckets = HashMap::new();
        for (class, limit) in [
            (ServiceClass::ContentSource, &config.content_source),
            (ServiceClass::AiProvider, &config.ai_provider),
            (ServiceClass::ObjectStorage, &config.object_storage),
        ] {
            if let Some(limit) = limit {
                buckets.insert(class, Bucket::new(limit));
            }
        }
        Self { buckets }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Suspend until `class` has a token available, then consume it.
    pub async fn acquire(&self, class: ServiceClass) {
        if let Some(bucket) = self.buckets.get(&class) {
            bucket.acquire().await;
        }
    }
}
