//! Retry scheduling for upstream connects.
//!
//! The policy owns the attempt counter and the pending retry deadline. The
//! bridge asks it before every attempt and after every failure; cancelling
//! clears the deadline so no stray retry fires after a manual disconnect.

use crate::TransportKind;
use std::time::Duration;
use tokio::time::{self, Instant};

/// Attempt budget of the loopback transport.
pub const LOOPBACK_MAX_ATTEMPTS: u32 = 10;

/// Delay between loopback attempts.
pub const LOOPBACK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Default delay between local-socket attempts.
pub const LOCAL_SOCKET_RETRY_DELAY: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    /// Give up once this many attempts have failed in a row.
    Bounded(u32),
    Unbounded,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    limit: RetryLimit,
    delay: Duration,
    attempts: u32,
    retry_at: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self::new(RetryLimit::Bounded(max_attempts), delay)
    }

    pub fn unbounded(delay: Duration) -> Self {
        Self::new(RetryLimit::Unbounded, delay)
    }

    /// Default policy for a transport kind.
    pub fn for_kind(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Loopback => Self::bounded(LOOPBACK_MAX_ATTEMPTS, LOOPBACK_RETRY_DELAY),
            TransportKind::LocalSocket => Self::unbounded(LOCAL_SOCKET_RETRY_DELAY),
        }
    }

    fn new(limit: RetryLimit, delay: Duration) -> Self {
        Self {
            limit,
            delay,
            attempts: 0,
            retry_at: None,
        }
    }

    pub fn limit(&self) -> RetryLimit {
        self.limit
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Attempts made since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Record a new attempt and return its zero-based index.
    pub fn begin_attempt(&mut self) -> u32 {
        self.retry_at = None;
        let attempt = self.attempts;
        self.attempts = self.attempts.saturating_add(1);
        attempt
    }

    pub fn on_connected(&mut self) {
        self.reset();
    }

    pub fn is_exhausted(&self) -> bool {
        match self.limit {
            RetryLimit::Bounded(max) => self.attempts >= max,
            RetryLimit::Unbounded => false,
        }
    }

    /// Schedule the next attempt after a failure. Returns `None` once the
    /// budget is spent.
    pub fn schedule_retry(&mut self, now: Instant) -> Option<Instant> {
        if self.is_exhausted() {
            self.retry_at = None;
            return None;
        }
        let at = now + self.delay;
        self.retry_at = Some(at);
        Some(at)
    }

    /// Drop the pending retry, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.retry_at.take().is_some()
    }

    /// Forget all attempts and any pending retry.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.retry_at = None;
    }

    /// Resolve when the pending retry is due. Never resolves if none is pending.
    pub async fn wait(&self) {
        match self.retry_at {
            Some(at) => time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}
