//! Failure classification and backoff.

use std::time::Duration;

use rand::Rng;

use contentmigrator_shared::{MigratorError, RetryConfig};

/// How a stage failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network failures, timeouts, 5xx, ledger I/O: retry with backoff.
    Transient,
    /// Quota exhaustion: retry with a longer backoff.
    RateLimited,
    /// Surfaces immediately; the entry is marked failed.
    Fatal,
}

/// The single retry policy every stage consults.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
    jitter: f64,
    rate_limit_factor: u32,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig, max_attempts: u32) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
            rate_limit_factor: config.rate_limit_factor.max(1),
            max_attempts,
        }
    }

    pub fn classify(&self, error: &MigratorError) -> FailureClass {
        match error {
            MigratorError::Transient(_)
            | MigratorError::Conflict { .. }
            | MigratorError::Storage(_)
            | MigratorError::Io { .. } => FailureClass::Transient,
            MigratorError::RateLimited { .. } => FailureClass::RateLimited,
            MigratorError::Config { .. }
            | MigratorError::Validation { .. }
            | MigratorError::NotFound(_)
            | MigratorError::Fatal { .. }
            | MigratorError::InvalidTransition { .. }
            | MigratorError::Cancelled => FailureClass::Fatal,
        }
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn should_retry(&self, class: FailureClass, attempt: u32) -> bool {
        class != FailureClass::Fatal && attempt < self.max_attempts
    }

    /// Exponential part of the transient delay, capped at the maximum.
    fn transient_base(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(31);
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }

    /// Delay before the retry that follows attempt number `attempt`.
    ///
    /// A rate-limited delay starts above the largest possible transient
    /// delay for the same attempt, so it is always strictly longer.
    pub fn compute_backoff(&self, class: FailureClass, attempt: u32) -> Duration {
        let transient = self.transient_base(attempt);
        let base = match class {
            FailureClass::Fatal => return Duration::ZERO,
            FailureClass::Transient => transient,
            FailureClass::RateLimited => {
                let ceiling = transient.mul_f64(1.0 + self.jitter);
                (ceiling * self.rate_limit_factor).max(transient + Duration::from_millis(1))
            }
        };
        base + self.jitter_for(base)
    }

    /// Backoff for a concrete error, honoring a provider's retry-after hint.
    pub fn backoff_for(&self, error: &MigratorError, attempt: u32) -> Duration {
        let class = self.classify(error);
        let computed = self.compute_backoff(class, attempt);
        match error {
            MigratorError::RateLimited {
                retry_after_ms: Some(hint),
                ..
            } => computed.max(Duration::from_millis(*hint)),
            _ => computed,
        }
    }

    fn jitter_for(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return Duration::ZERO;
        }
        let fraction: f64 = rand::thread_rng().gen_range(0.0..self.jitter);
        delay.mul_f64(fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy::new(
            &RetryConfig {
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                jitter,
                rate_limit_factor: 2,
            },
            3,
        )
    }

    #[test]
    fn classification() {
        let p = policy(0.0);
        assert_eq!(
            p.classify(&MigratorError::Transient("timeout".into())),
            FailureClass::Transient
        );
        assert_eq!(
            p.classify(&MigratorError::rate_limited("429", None)),
            FailureClass::RateLimited
        );
        assert_eq!(
            p.classify(&MigratorError::NotFound("item".into())),
            FailureClass::Fatal
        );
        assert_eq!(p.classify(&MigratorError::fatal("bad")), FailureClass::Fatal);
    }

    #[test]
    fn exponential_and_capped() {
        let p = policy(0.0);
        assert_eq!(p.compute_backoff(FailureClass::Transient, 1), Duration::from_millis(100));
        assert_eq!(p.compute_backoff(FailureClass::Transient, 2), Duration::from_millis(200));
        assert_eq!(p.compute_backoff(FailureClass::Transient, 3), Duration::from_millis(400));
        assert_eq!(p.compute_backoff(FailureClass::Transient, 10), Duration::from_millis(1_000));
        assert_eq!(p.compute_backoff(FailureClass::Transient, 200), Duration::from_millis(1_000));
    }

    #[test]
    fn rate_limited_always_longer() {
        for jitter in [0.0, 0.25, 1.0] {
            let p = policy(jitter);
            for attempt in 1..=12 {
                for _ in 0..50 {
                    let transient = p.compute_backoff(FailureClass::Transient, attempt);
                    let limited = p.compute_backoff(FailureClass::RateLimited, attempt);
                    assert!(
                        limited > transient,
                        "attempt {attempt} jitter {jitter}: {limited:?} <= {transient:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn jitter_stays_in_range() {
        let p = policy(0.25);
        for _ in 0..100 {
            let d = p.compute_backoff(FailureClass::Transient, 2);
            assert!(d >= Duration::from_millis(200));
            assert!(d < Duration::from_millis(250));
        }
    }

    #[test]
    fn retry_after_hint_only_raises() {
        let p = policy(0.0);
        let long_hint = MigratorError::rate_limited("429", Some(60_000));
        assert_eq!(p.backoff_for(&long_hint, 1), Duration::from_secs(60));

        let short_hint = MigratorError::rate_limited("429", Some(1));
        assert_eq!(p.backoff_for(&short_hint, 1), Duration::from_millis(200));
    }

    #[test]
    fn attempts_ceiling() {
        let p = policy(0.0);
        assert!(p.should_retry(FailureClass::Transient, 1));
        assert!(p.should_retry(FailureClass::RateLimited, 2));
        assert!(!p.should_retry(FailureClass::Transient, 3));
        assert!(!p.should_retry(FailureClass::Fatal, 1));
    }
}
