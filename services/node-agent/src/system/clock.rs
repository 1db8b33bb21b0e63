//! Time source abstraction.
//!
//! Polling loops (monit reload and stop convergence, device resolution) take
//! their notion of "now" and their sleeps from a [`Clock`], so tests can run
//! ten-minute deadlines without waiting.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Time source used by polling loops.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Suspend the caller for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time backed by tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Mock clock for testing.
///
/// Sleeping returns immediately and advances the clock by the requested
/// duration. Every sleep is recorded.
pub struct MockClock {
    state: Mutex<MockClockState>,
}

struct MockClockState {
    now: Instant,
    sleeps: Vec<Duration>,
}

impl MockClock {
    /// Create a mock clock starting at the current instant.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockClockState {
                now: Instant::now(),
                sleeps: Vec::new(),
            }),
        }
    }

    /// Move time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.now += duration;
    }

    /// Durations passed to [`Clock::sleep`], in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sleeps
            .clone()
    }

    /// Number of sleeps so far.
    pub fn sleep_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sleeps
            .len()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).now
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.now += duration;
        state.sleeps.push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_clock_sleep_advances() {
        let clock = MockClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_millis(500)).await;
        clock.sleep(Duration::from_secs(2)).await;

        assert_eq!(clock.now() - start, Duration::from_millis(2500));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(500), Duration::from_secs(2)]
        );
    }

    #[test]
    fn test_mock_clock_advance_is_not_a_sleep() {
        let clock = MockClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now() - start, Duration::from_secs(60));
        assert_eq!(clock.sleep_count(), 0);
    }

    #[tokio::test]
    async fn test_system_clock_sleep() {
        let clock = SystemClock;
        let start = clock.now();
        clock.sleep(Duration::from_millis(10)).await;
        assert!(clock.now() - start >= Duration::from_millis(10));
    }
}
