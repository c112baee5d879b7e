// src/retry.rs
//
// Exponential backoff keyed by failure class. Three independent policies wrap
// every network call: server/response errors, connection errors and timeouts.

use rand::Rng;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Broad category of a failure, used to pick a retry policy and to tag logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Structural or content problem (bad format, bad manifest, bad JSON).
    Content,
    /// The server answered with an error status.
    Response,
    /// DNS, refused, reset and similar transport failures.
    Connection,
    Timeout,
    Storage,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureClass::Content => "content",
            FailureClass::Response => "response",
            FailureClass::Connection => "connection",
            FailureClass::Timeout => "timeout",
            FailureClass::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// Implemented by errors that can pass through [`RetryPolicies::execute`].
pub trait Retryable {
    fn failure_class(&self) -> FailureClass;

    /// Client errors are never worth another attempt.
    fn is_client_error(&self) -> bool {
        false
    }
}

/// One exponential backoff schedule with a cumulative time budget.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Give up once this much time has passed since the call started.
    pub budget: Duration,
    /// Delay before the first retry. Doubles on every further retry.
    pub base_delay: Duration,
    /// Hard cap on a single delay.
    pub max_delay: Duration,
    /// Full jitter: the actual delay is uniform in `[0, delay]`.
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }

    /// Un-jittered delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The sleep before the next attempt, or `None` once the budget is spent.
    /// The sleep never runs past the end of the budget.
    pub fn next_delay(&self, attempt: u32, elapsed: Duration) -> Option<Duration> {
        if elapsed >= self.budget {
            return None;
        }
        let mut delay = self.delay_for_attempt(attempt);
        if self.jitter {
            let max_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            delay = Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms));
        }
        Some(delay.min(self.budget - elapsed))
    }
}

/// Retry knobs as they appear in the config file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub response_budget_secs: u64,
    pub connection_budget_secs: u64,
    pub timeout_budget_secs: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Budget of the catalog query, which retries every failure.
    pub catalog_budget_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            response_budget_secs: 60,
            connection_budget_secs: 60,
            timeout_budget_secs: 300,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: true,
            catalog_budget_secs: 300,
        }
    }
}

/// The three policies, selected per failure by its [`FailureClass`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    pub response: BackoffPolicy,
    pub connection: BackoffPolicy,
    pub timeout: BackoffPolicy,
    /// Retry 4xx responses like any other error status.
    pub retry_client_errors: bool,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicies {
    fn from(config: &RetryConfig) -> Self {
        let policy = |budget_secs: u64| BackoffPolicy {
            budget: Duration::from_secs(budget_secs),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        };
        Self {
            response: policy(config.response_budget_secs),
            connection: policy(config.connection_budget_secs),
            timeout: policy(config.timeout_budget_secs),
            retry_client_errors: false,
        }
    }
}

impl RetryPolicies {
    /// A configuration that never retries anything.
    pub fn none() -> Self {
        let policy = BackoffPolicy {
            budget: Duration::ZERO,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        };
        Self {
            response: policy.clone(),
            connection: policy.clone(),
            timeout: policy,
            retry_client_errors: false,
        }
    }

    /// One schedule for every network failure, client errors included.
    pub fn uniform(policy: BackoffPolicy) -> Self {
        Self {
            response: policy.clone(),
            connection: policy.clone(),
            timeout: policy,
            retry_client_errors: true,
        }
    }

    /// The catalog query's policies: every network failure is retried within
    /// `catalog_budget_secs`.
    pub fn catalog(config: &RetryConfig) -> Self {
        Self::uniform(BackoffPolicy {
            budget: Duration::from_secs(config.catalog_budget_secs),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        })
    }

    /// The policy that governs `error`, or `None` if it must not be retried.
    pub fn policy_for<E: Retryable>(&self, error: &E) -> Option<&BackoffPolicy> {
        match error.failure_class() {
            FailureClass::Response if error.is_client_error() && !self.retry_client_errors => None,
            FailureClass::Response => Some(&self.response),
            FailureClass::Connection => Some(&self.connection),
            FailureClass::Timeout => Some(&self.timeout),
            FailureClass::Content | FailureClass::Storage => None,
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the policy matching its failure runs out of budget. The last error
    /// is returned in the latter two cases.
    ///
    /// Each class keeps its own clock, started with the attempt that first
    /// failed in that class, so failures of one class never use up the
    /// budget of another.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut attempts = [0u32; 3];
        let mut class_started: [Option<Instant>; 3] = [None; 3];

        loop {
            let attempt_started = Instant::now();
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let Some(policy) = self.policy_for(&error) else {
                return Err(error);
            };
            let slot = match error.failure_class() {
                FailureClass::Response => 0,
                FailureClass::Connection => 1,
                _ => 2,
            };
            let started = *class_started[slot].get_or_insert(attempt_started);
            let attempt = attempts[slot];
            let Some(delay) = policy.next_delay(attempt, started.elapsed()) else {
                return Err(error);
            };
            attempts[slot] += 1;

            debug!(
                class = %error.failure_class(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after transient error"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
