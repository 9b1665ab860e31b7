use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Source of time for every wait in the crawl (pagination, pacing, backoff).
#[async_trait]
pub trait Clock: Send + Sync {
    /// Time since the clock was created.
    fn elapsed(&self) -> Duration;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers.
pub struct TokioClock {
    start: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Idle-gap gate: `ready()` returns no sooner than `interval` after the
/// last `done()`. Work done between `ready()` and `done()` does not count
/// toward the gap. Nothing waits before the first `done()`.
pub struct Throttle {
    clock: Arc<dyn Clock>,
    interval: Duration,
    last_done: Mutex<Option<Duration>>,
}

impl Throttle {
    pub fn new(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            clock,
            interval,
            last_done: Mutex::new(None),
        }
    }

    pub async fn ready(&self) {
        let guard = self.last_done.lock().await;
        if let Some(prev) = *guard {
            let since = self.clock.elapsed().saturating_sub(prev);
            if since < self.interval {
                self.clock.sleep(self.interval - since).await;
            }
        }
    }

    /// Marks the end of the paced operation.
    pub async fn done(&self) {
        *self.last_done.lock().await = Some(self.clock.elapsed());
    }
}

/// Simulated clock for tests: `sleep` advances time instantly.
#[cfg(test)]
pub struct ManualClock {
    now: std::sync::Mutex<Duration>,
    sleeps: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: std::sync::Mutex::new(Duration::ZERO),
            sleeps: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        self.advance(duration);
    }
}
