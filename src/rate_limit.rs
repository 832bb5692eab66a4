use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Time source for the limiter. `now` is monotonic and relative to an arbitrary origin.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
    async fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fixed-interval gate: consecutive grants are at least `min_interval` apart.
///
/// Each client owns its limiter, so two clients never throttle each other.
pub struct RateLimiter {
    min_interval: Duration,
    last_grant: Mutex<Option<Duration>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_clock(min_interval, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_interval,
            last_grant: Mutex::new(None),
            clock,
        }
    }

    /// Waits for the next slot. Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let mut last = self.last_grant.lock().await;
        let mut waited = Duration::ZERO;
        if let Some(prev) = *last {
            let elapsed = self.clock.now().saturating_sub(prev);
            if elapsed < self.min_interval {
                waited = self.min_interval - elapsed;
                self.clock.sleep(waited).await;
            }
        }
        *last = Some(self.clock.now());
        waited
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    /// Manual clock: `sleep` advances time instantly and is recorded.
    #[derive(Default)]
    pub struct ManualClock {
        now: SyncMutex<Duration>,
        pub sleeps: SyncMutex<Vec<Duration>>,
    }

    impl ManualClock {
        pub fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> Duration {
            *self.now.lock()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().push(duration);
            self.advance(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test]
    async fn first_grant_is_immediate_then_spaced() {
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::with_clock(ms(300), clock.clone());

        assert_eq!(limiter.acquire().await, Duration::ZERO);
        assert_eq!(limiter.acquire().await, ms(300));

        clock.advance(ms(100));
        assert_eq!(limiter.acquire().await, ms(200));

        clock.advance(ms(500));
        assert_eq!(limiter.acquire().await, Duration::ZERO);
        assert_eq!(*clock.sleeps.lock(), vec![ms(300), ms(200)]);
    }

    #[tokio::test]
    async fn limiters_do_not_share_state() {
        let clock = Arc::new(ManualClock::default());
        let a = RateLimiter::with_clock(ms(300), clock.clone());
        let b = RateLimiter::with_clock(ms(300), clock.clone());

        a.acquire().await;
        assert_eq!(b.acquire().await, Duration::ZERO);
        assert!(clock.sleeps.lock().is_empty());
    }
}
