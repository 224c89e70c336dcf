//! Time source and cancellation for the blocking control loops.

use crate::error::{BoardError, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Granularity at which cancellable waits check their token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn wall_now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock for tests. `sleep` advances time instantly and every call to
/// `now` advances it by `tick`, so busy loops still make progress.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    elapsed: Mutex<Duration>,
    tick: Duration,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::with_tick(Duration::ZERO)
    }

    pub fn with_tick(tick: Duration) -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
            elapsed: Mutex::new(Duration::ZERO),
            tick,
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner) += duration;
    }

    /// Virtual time since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(PoisonError::into_inner);
        *elapsed += self.tick;
        self.origin + *elapsed
    }

    fn wall_now(&self) -> DateTime<Utc> {
        let elapsed = self.elapsed();
        self.wall_origin + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Shared flag that aborts retry backoffs and the pump fill loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BoardError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Sleep for `duration` on `clock`, waking early with `BoardError::Cancelled`
/// if the token fires.
pub fn sleep_cancellable(clock: &dyn Clock, duration: Duration, token: &CancelToken) -> Result<()> {
    let deadline = clock.now() + duration;
    loop {
        token.check()?;
        let now = clock.now();
        if now >= deadline {
            return Ok(());
        }
        clock.sleep((deadline - now).min(CANCEL_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_secs(3));
        assert_eq!(clock.now() - start, Duration::from_secs(3));
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn cancellable_sleep_covers_full_duration() {
        let clock = ManualClock::new();
        sleep_cancellable(&clock, Duration::from_millis(1_000), &CancelToken::new()).unwrap();
        assert_eq!(clock.elapsed(), Duration::from_millis(1_000));
    }

    #[test]
    fn cancelled_token_aborts_sleep() {
        let clock = ManualClock::new();
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            sleep_cancellable(&clock, Duration::from_secs(10), &token),
            Err(BoardError::Cancelled)
        ));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
