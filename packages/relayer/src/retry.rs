//! Retry and reconnect utilities
//!
//! Connection loops (queue broker, Horizon stream, EVM websocket) take a
//! [`RetryPolicy`] by value and keep their own attempt counters, so no
//! failure budget is shared between subsystems.

use eyre::{Result, WrapErr};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Fixed-delay retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first failure
    pub max_attempts: u32,
    /// Delay between attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Check if we should retry after `failures` consecutive failures
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Consecutive-failure counter for a long-lived stream.
///
/// Reset whenever the stream makes progress, so the budget only bounds
/// back-to-back failures.
#[derive(Debug, Clone)]
pub struct Reconnect {
    policy: RetryPolicy,
    failures: u32,
}

impl Reconnect {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failure. Returns the delay before the next attempt, or `None`
    /// once the budget is exhausted.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.policy.should_retry(self.failures) {
            Some(self.policy.backoff)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Run `operation` until it succeeds or the policy gives up.
///
/// `operation` receives the 0-indexed attempt number. The last error is
/// returned with context once retries are exhausted.
pub async fn with_retry<F, T, Fut>(policy: RetryPolicy, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if !policy.should_retry(attempt) {
                    return Err(e).wrap_err_with(|| {
                        format!("{} failed after {} attempts", what, attempt)
                    });
                }
                warn!(
                    attempt,
                    max = policy.max_attempts,
                    backoff = ?policy.backoff,
                    error = %e,
                    "{} failed, retrying", what
                );
                tokio::time::sleep(policy.backoff).await;
            }
        }
    }
}

/// Failure of a watcher's event stream
#[derive(Debug, Error)]
pub enum StreamError {
    /// The watched resource does not exist yet (Horizon 404 on the vault)
    #[error("resource not found: {0}")]
    NotFound(String),
    /// Server ended the stream
    #[error("stream closed by server")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    /// An intent could not be handed to the relay queue
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("unexpected response status {status}: {body}")]
    Status { status: u16, body: String },
}

impl StreamError {
    /// Not-found is retried indefinitely on its own delay; everything else
    /// draws from the reconnect budget.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StreamError::NotFound(_))
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            StreamError::NotFound(e.to_string())
        } else {
            StreamError::Transport(e.to_string())
        }
    }
}

/// Coarse error classes used for metric labels and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure (RPC timeout, network issues)
    Transient,
    /// Rejected by the chain; resubmitting would fail again
    Permanent,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// Classify an error message
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("504")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("insufficient")
        || error_lower.contains("underfunded")
        || error_lower.contains("no_trust")
        || error_lower.contains("no_destination")
        || error_lower.contains("tx_bad_seq")
        || error_lower.contains("tx_failed")
        || error_lower.contains("invalid signature")
        || error_lower.contains("out of gas")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}
