//! Bounded exponential-backoff reconnection

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Retry policy for dropped sessions
///
/// Controls how many consecutive failures are retried and how long to wait
/// before each reconnect using exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of consecutive reconnect attempts
    pub max_attempts: u32,
    /// Base delay (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(15),
        }
    }
}

/// Compute the delay before reconnect number `attempt` (1-based)
///
/// `min(base_delay * 2^attempt, max_delay)`, without jitter.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay)
}

/// Outcome of reporting a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect after `delay`; `attempt` is the new counter value
    Retry { attempt: u32, delay: Duration },
    /// Attempts used up; the user must restart
    Exhausted,
}

/// Attempt counter plus at most one pending reconnect timer
#[derive(Debug, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
    attempt: u32,
    pending: Option<JoinHandle<()>>,
}

impl RetryManager {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            pending: None,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current attempt counter
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether a reconnect timer is armed
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Record a qualifying failure and decide what happens next
    pub fn on_failure(&mut self) -> RetryDecision {
        if self.attempt < self.policy.max_attempts {
            self.attempt += 1;
            RetryDecision::Retry {
                attempt: self.attempt,
                delay: delay_for_attempt(&self.policy, self.attempt),
            }
        } else {
            RetryDecision::Exhausted
        }
    }

    /// Arm the reconnect timer, replacing any earlier one
    ///
    /// `due` is delivered on `tx` once `delay` has elapsed.
    pub fn schedule<T: Send + 'static>(
        &mut self,
        delay: Duration,
        tx: mpsc::UnboundedSender<T>,
        due: T,
    ) {
        self.cancel();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(due);
        }));
    }

    /// Disarm the reconnect timer; returns whether one was armed
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) => {
                let armed = !handle.is_finished();
                handle.abort();
                armed
            }
            None => false,
        }
    }

    /// Back to zero attempts (successful open or explicit start)
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Cancel and reset (explicit end)
    pub fn clear(&mut self) {
        self.cancel();
        self.reset();
    }
}

impl Drop for RetryManager {
    fn drop(&mut self) {
        self.cancel();
    }
}
