//! Call context, cancellation and clock providers
//!
//! These let the executor suspend cooperatively while a long-running
//! operation converges, and let tests replace real time with a manual clock.

use crate::error::CancelReason;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared flag a caller flips to stop a reconciliation that is waiting
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Source of time and sleeping
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Sleep for `duration`, returning early if `cancel` fires.
    fn sleep(&self, duration: Duration, cancel: &CancellationToken);
}

/// Real wall-clock time
pub struct SystemClock;

/// Granularity at which a sleeping [`SystemClock`] notices cancellation
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancellationToken) {
        let deadline = Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(CANCEL_CHECK_INTERVAL));
        }
    }
}

/// Virtual clock that advances only when slept on
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock().unwrap_or_else(std::sync::PoisonError::into_inner) += duration;
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration, _cancel: &CancellationToken) {
        self.sleeps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(duration);
        self.advance(duration);
    }
}

/// Per-call options: cancellation signal and overall timeout
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            timeout: None,
        }
    }
}

/// A started call: the context plus the deadline derived from its timeout
pub(crate) struct Deadline<'a> {
    pub cancel: &'a CancellationToken,
    pub at: Option<Instant>,
}

impl<'a> Deadline<'a> {
    pub fn start(ctx: &'a CallContext, clock: &dyn Clock) -> Self {
        Self {
            cancel: &ctx.cancel,
            at: ctx.timeout.map(|t| clock.now() + t),
        }
    }

    /// Why the caller should stop now, if it should
    pub fn check(&self, clock: &dyn Clock) -> Option<CancelReason> {
        if self.cancel.is_cancelled() {
            return Some(CancelReason::Requested);
        }
        match self.at {
            Some(at) if clock.now() >= at => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Sleep for `duration`, clipped to the deadline.
    pub fn sleep(&self, clock: &dyn Clock, duration: Duration) {
        let duration = match self.at {
            Some(at) => duration.min(at.saturating_duration_since(clock.now())),
            None => duration,
        };
        clock.sleep(duration, self.cancel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_secs(5), &CancellationToken::new());
        assert_eq!(clock.now() - start, Duration::from_secs(5));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn test_deadline_exceeded() {
        let clock = ManualClock::new();
        let ctx = CallContext::with_timeout(Duration::from_secs(10));
        let deadline = Deadline::start(&ctx, &clock);
        assert_eq!(deadline.check(&clock), None);

        // sleeps are clipped to the deadline
        deadline.sleep(&clock, Duration::from_secs(60));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
        assert_eq!(deadline.check(&clock), Some(CancelReason::DeadlineExceeded));
    }

    #[test]
    fn test_cancellation_wins() {
        let clock = ManualClock::new();
        let token = CancellationToken::new();
        let ctx = CallContext::with_cancel(token.clone());
        let deadline = Deadline::start(&ctx, &clock);
        token.cancel();
        assert_eq!(deadline.check(&clock), Some(CancelReason::Requested));
    }

    #[test]
    fn test_system_clock_sleep_interrupted() {
        let token = CancellationToken::new();
        token.cancel();
        let started = Instant::now();
        SystemClock.sleep(Duration::from_secs(30), &token);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
