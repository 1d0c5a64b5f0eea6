//! Transient-failure classification and reconnect backoff
//!
//! Recovery happens at three levels in this crate: segment-level errors
//! fall back across providers in the fetcher, job-level transients pause
//! the queue item in place, and *connection establishment* — the one spot
//! where hammering a struggling provider actively hurts — retries here
//! with a capped, jittered delay sequence. [`IsRetryable`] is the shared
//! classification all three levels consult.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::Error;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (unreachable provider, protocol hiccup, timeout)
/// should return `true`. Permanent failures (auth denied, missing article,
/// unsupported archive, cancellation) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Provider unreachable or misbehaving: try again
            Error::CouldNotConnect { .. } | Error::Protocol(_) | Error::Timeout { .. } => true,
            // Transient I/O conditions
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Auth failures are permanent
            Error::CouldNotLogin { .. } => false,
            // Exhausted-providers outcomes are final for the segment
            Error::ArticleNotFound { .. } | Error::CrcMismatch { .. } => false,
            // Cancellation is never retried
            Error::Cancelled => false,
            // Archive and pipeline fatals
            Error::PasswordProtectedRar { .. }
            | Error::PasswordProtectedSevenZip { .. }
            | Error::UnsupportedRarCompression { .. }
            | Error::UnsupportedSevenZipCompression { .. }
            | Error::NoVideoFiles => false,
            // Structural/permanent errors
            Error::InvalidNzb(_)
            | Error::InvalidYenc(_)
            | Error::Config { .. }
            | Error::Store(_)
            | Error::DuplicateJob(_) => false,
        }
    }
}

/// Capped exponential delay sequence
///
/// Hands out one delay per remaining attempt; `None` means the budget is
/// spent. Jitter spreads each delay uniformly over `[d, 2d)` so a batch of
/// connections that broke together does not stampede a recovering
/// provider in lockstep.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
    multiplier: f64,
    jitter: bool,
    attempts_left: u32,
}

impl Backoff {
    /// Start a delay sequence from the configured tuning
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_delay(),
            cap: config.max_delay(),
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
            attempts_left: config.max_attempts,
        }
    }

    /// Delay to sleep before the next attempt, or `None` once spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_left == 0 {
            return None;
        }
        self.attempts_left -= 1;

        let current = self.next;
        let scaled = Duration::from_secs_f64(current.as_secs_f64() * self.multiplier);
        self.next = scaled.min(self.cap);

        Some(if self.jitter {
            current.mul_f64(1.0 + rand::thread_rng().gen::<f64>())
        } else {
            current
        })
    }

    /// Attempts still available
    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }
}

/// Drive an operation through transient failures
///
/// Runs `operation`, and while it fails retryably, sleeps out the backoff
/// sequence and runs it again. Non-retryable errors and budget exhaustion
/// return the last error as-is.
pub async fn retry_transient<T, E, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 1u32;
    let mut result = operation().await;

    while let Err(error) = &result {
        if !error.is_retryable() {
            tracing::debug!(operation = what, error = %error, "failed with non-retryable error");
            break;
        }
        let Some(delay) = backoff.next_delay() else {
            tracing::error!(
                operation = what,
                attempts = attempt,
                error = %error,
                "giving up after repeated transient failures"
            );
            break;
        };
        tracing::warn!(
            operation = what,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient failure, backing off"
        );

        tokio::time::sleep(delay).await;
        attempt += 1;
        result = operation().await;
    }

    if attempt > 1 && result.is_ok() {
        tracing::info!(operation = what, attempts = attempt, "succeeded after retry");
    }
    result
}
