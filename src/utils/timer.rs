//! Deadline timer utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for signalling once an absolute deadline passes. Can be
/// re-armed with a later (or earlier) deadline without reallocating.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Deadline used by the last arming.
    deadline: Instant,
}

impl Timer {
    /// Creates a new timer utility that immediately times-out.
    pub fn new() -> Self {
        let now = Instant::now();
        Timer {
            sleep: Box::pin(time::sleep_until(now)),
            deadline: now,
        }
    }

    /// Time left before the armed deadline, zero if already passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Re-arms the timer to fire at the given absolute deadline. A deadline
    /// in the past makes the next `timeout()` complete immediately.
    pub fn arm_at(&mut self, deadline: Instant) {
        self.deadline = deadline;
        self.sleep.as_mut().reset(deadline);
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_initial() {
        let start = Instant::now();
        let mut timer = Timer::new();
        timer.timeout().await; // should complete immediately
        let finish = Instant::now();
        assert!(finish.duration_since(start) < Duration::from_millis(100));
        assert!(timer.remaining().is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_arm_at() {
        let mut timer = Timer::new();
        let start = Instant::now();
        timer.arm_at(start + Duration::from_secs(5));
        assert_eq!(timer.remaining(), Duration::from_secs(5));
        timer.timeout().await;
        assert!(Instant::now() >= start + Duration::from_secs(5));
        assert!(timer.remaining().is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rearm_earlier() {
        let mut timer = Timer::new();
        let start = Instant::now();
        timer.arm_at(start + Duration::from_secs(60));
        timer.arm_at(start + Duration::from_millis(200));
        timer.timeout().await;
        let elapsed = Instant::now().duration_since(start);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(60));
    }
}
