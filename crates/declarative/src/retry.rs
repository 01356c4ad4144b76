//! Retry logic with bounded exponential backoff for transient remote errors.

use crate::context::{Clock, Deadline};
use crate::error::{CancelReason, RemoteError, ValidationError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff settings shared by call retries and operation polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between attempts
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Self::default()
        }
    }

    /// Calculate the delay after a given attempt number (0-indexed).
    ///
    /// A factor below 1.0 or not finite is treated as 1.0.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = if self.backoff_factor.is_finite() {
            self.backoff_factor.max(1.0)
        } else {
            1.0
        };
        let delay = self.base_delay.as_secs_f64() * factor.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Reject settings that cannot describe a backoff. `field` names the
    /// config section in errors.
    pub fn validate(&self, field: &str) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::invalid(
                format!("{field}.max_attempts"),
                "must be at least 1",
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ValidationError::invalid(
                format!("{field}.backoff_factor"),
                format!("{} is not a finite number of at least 1.0", self.backoff_factor),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ValidationError::invalid(
                format!("{field}.base_delay_ms"),
                "exceeds max_delay_ms",
            ));
        }
        Ok(())
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Settings suited to polling long-running operations
    pub fn polling() -> Self {
        Self {
            max_attempts: 60,
            base_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(15),
        }
    }
}

/// Why [`with_retry`] gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RetryError {
    /// Non-retryable error, or retries exhausted
    Remote { cause: RemoteError, attempts: u32 },
    /// Cancelled or past the deadline between attempts
    Stopped {
        reason: CancelReason,
        last: Option<RemoteError>,
    },
}

/// Execute a remote call, retrying transient errors with backoff.
///
/// The closure receives the 0-indexed attempt number. Cancellation and the
/// deadline are checked before every attempt and while waiting.
pub(crate) fn with_retry<T, F>(
    config: &RetryConfig,
    clock: &dyn Clock,
    deadline: &Deadline<'_>,
    what: &str,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Result<T, RemoteError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_error: Option<RemoteError> = None;

    for attempt in 0..max_attempts {
        if let Some(reason) = deadline.check(clock) {
            return Err(RetryError::Stopped {
                reason,
                last: last_error,
            });
        }

        match operation(attempt) {
            Ok(result) => return Ok(result),
            Err(e) => {
                // If error is not retryable, return immediately
                if !e.is_transient() || attempt + 1 >= max_attempts {
                    return Err(RetryError::Remote {
                        cause: e,
                        attempts: attempt + 1,
                    });
                }

                let delay = config.delay_for_attempt(attempt);
                log::warn!(
                    "{what}: attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt + 1,
                    max_attempts,
                    e,
                    delay
                );
                deadline.sleep(clock, delay);
                last_error = Some(e);
            }
        }
    }

    // Unreachable with max_attempts >= 1, kept for totality
    Err(RetryError::Remote {
        cause: last_error.unwrap_or_else(|| RemoteError::transient("retry exhausted")),
        attempts: max_attempts,
    })
}

/// Serialize a [`Duration`] as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
