//! Reconnect supervisor
//!
//! Wraps connection establishment for the publisher and the consumer in a retry
//! loop. The default policy waits a fixed 5 seconds between attempts and never
//! gives up; exponential growth, jitter and an attempt cap are opt-in.
//!
//! Only connection errors ([`EventBusError::is_connection_error`]) are retried.
//! Anything else, such as a consumer with no queues registered, cannot be fixed
//! by waiting and is returned after the first attempt.

use crate::error::EventBusError;
use crate::metrics;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Interval of the default fixed policy
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Delay growth between attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (1-based), before jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(interval) => *interval,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// Retry policy for connection establishment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,

    /// Scale each delay to 50-100% of its value
    pub jitter: bool,

    /// Total attempts before giving up (`None` = retry forever)
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            jitter: false,
            max_attempts: None,
        }
    }

    /// Fixed interval, unlimited attempts
    pub fn fixed(interval: Duration) -> Self {
        Self::new(Backoff::Fixed(interval))
    }

    /// Exponential backoff with jitter, unlimited attempts
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::new(Backoff::Exponential { base, max }).with_jitter(true)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Cap total attempts (at least one)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Delay after failed attempt number `attempt`, jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay(attempt);
        if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RETRY_INTERVAL)
    }
}

/// Apply jitter to a delay to avoid reconnect stampedes
///
/// Uses a pseudo-random factor between 50% and 100% of the original delay
fn apply_jitter(delay: Duration) -> Duration {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let random_factor =
        (RandomState::new().hash_one(std::time::SystemTime::now()) % 50) as f64 / 100.0 + 0.5;

    delay.mul_f64(random_factor)
}

/// Runs a connect operation until it succeeds, the policy gives up, or shutdown is requested.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    policy: RetryPolicy,
}

impl Supervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry `operation` per the policy while it fails with a connection error.
    ///
    /// `role` labels logs and metrics (`publisher`, `consumer`).
    pub async fn run<F, Fut, T>(&self, role: &str, operation: F) -> Result<T, EventBusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EventBusError>>,
    {
        self.retry_loop(role, operation, None).await
    }

    /// Like [`Supervisor::run`], but a `true` on `shutdown` aborts the wait with
    /// [`EventBusError::Shutdown`].
    pub async fn run_until_shutdown<F, Fut, T>(
        &self,
        role: &str,
        operation: F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, EventBusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EventBusError>>,
    {
        self.retry_loop(role, operation, Some(shutdown)).await
    }

    async fn retry_loop<F, Fut, T>(
        &self,
        role: &str,
        mut operation: F,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<T, EventBusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EventBusError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                return Err(EventBusError::Shutdown);
            }

            attempt += 1;
            match operation().await {
                Ok(value) => {
                    metrics::record_connection_attempt(role, true);
                    if attempt > 1 {
                        info!(role, attempts = attempt, "Connected after retries");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    metrics::record_connection_attempt(role, false);

                    if !e.is_connection_error() {
                        error!(
                            role,
                            attempts = attempt,
                            error = %e,
                            "Connection setup failed, not retrying"
                        );
                        return Err(e);
                    }

                    if self.policy.exhausted(attempt) {
                        error!(
                            role,
                            attempts = attempt,
                            error = %e,
                            "Giving up on broker connection"
                        );
                        return Err(EventBusError::RetryExhausted {
                            attempts: attempt,
                            last_error: Box::new(e),
                        });
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        role,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connection failed, retrying"
                    );

                    match shutdown.as_mut() {
                        Some(rx) => {
                            if wait_or_shutdown(delay, rx).await {
                                return Err(EventBusError::Shutdown);
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                }
            }
        }
    }
}

/// Sleep for `delay`. Returns true if shutdown was requested first.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return true,
                Ok(()) => continue,
                // Sender gone: no shutdown can arrive any more
                Err(_) => {
                    (&mut sleep).await;
                    return false;
                }
            },
        }
    }
}
