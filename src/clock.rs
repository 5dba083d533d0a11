//! Injectable clock for validation delays and readiness waits.
//!
//! The orchestrator suspends on the clock at three points: the validation
//! delay, the replacement readiness wait, and the deletion-confirmation
//! wait. All of them go through this trait so tests can fast-forward time
//! and detect that the orchestrator has actually suspended.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// Source of time for the controller.
#[async_trait]
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend until `duration` has elapsed on this clock.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the system time and the tokio timer.
#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct Waiter {
    deadline: DateTime<Utc>,
    notify: Arc<Notify>,
}

struct FakeInner {
    now: DateTime<Utc>,
    waiters: Vec<Waiter>,
}

/// Manually advanced clock for tests.
///
/// `sleep` suspends the caller until the test steps the clock past the
/// deadline. `has_waiters` lets a test detect that the orchestrator is
/// parked on the validation delay before fast-forwarding it.
pub struct FakeClock {
    inner: Mutex<FakeInner>,
}

impl FakeClock {
    /// Create a fake clock at the given instant.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(FakeInner {
                now,
                waiters: Vec::new(),
            }),
        }
    }

    /// Reset the clock to the given instant without waking waiters.
    pub fn set_time(&self, now: DateTime<Utc>) {
        self.inner.lock().unwrap().now = now;
    }

    /// Advance the clock, waking every sleeper whose deadline has passed.
    pub fn step(&self, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.now += chrono::Duration::from_std(duration).expect("step duration out of range");
        let now = inner.now;
        inner.waiters.retain(|w| {
            if w.deadline <= now {
                w.notify.notify_one();
                false
            } else {
                true
            }
        });
    }

    /// True when at least one task is suspended on this clock.
    pub fn has_waiters(&self) -> bool {
        !self.inner.lock().unwrap().waiters.is_empty()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().now
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let notify = Arc::new(Notify::new());
        {
            let mut inner = self.inner.lock().unwrap();
            let deadline = inner.now
                + chrono::Duration::from_std(duration).expect("sleep duration out of range");
            inner.waiters.push(Waiter {
                deadline,
                notify: notify.clone(),
            });
        }
        notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_clock_reports_set_time() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        assert_eq!(clock.now(), start);

        clock.step(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn sleep_parks_until_stepped_past_deadline() {
        let clock = Arc::new(FakeClock::default());
        let sleeper = clock.clone();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(30)).await });

        // Wait for the sleeper to register.
        while !clock.has_waiters() {
            tokio::task::yield_now().await;
        }

        // A partial step does not wake it.
        clock.step(Duration::from_secs(10));
        assert!(clock.has_waiters());

        clock.step(Duration::from_secs(25));
        handle.await.unwrap();
        assert!(!clock.has_waiters());
    }

    #[tokio::test]
    async fn zero_sleep_returns_immediately() {
        let clock = FakeClock::default();
        clock.sleep(Duration::ZERO).await;
        assert!(!clock.has_waiters());
    }

    #[tokio::test]
    async fn step_before_notified_still_wakes_sleeper() {
        // The waiter is registered before `notified()` is polled; a step in
        // that window must store a wake permit rather than lose it.
        let clock = Arc::new(FakeClock::default());
        let sleeper = clock.clone();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_millis(1)).await });
        while !clock.has_waiters() {
            tokio::task::yield_now().await;
        }
        clock.step(Duration::from_secs(1));
        handle.await.unwrap();
    }
}
