use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of wall-clock time and sleeping for the whole crate. Session status is derived from
/// "now", so every consumer takes a clock instead of calling [Utc::now] directly.
#[async_trait]
pub trait Clock: Sync + Send + 'static {
    fn time(&self) -> DateTime<Utc>;

    fn instant(&self) -> Instant;

    async fn sleep(&self, duration: Duration);

    async fn sleep_until(&self, instant: tokio::time::Instant);

    /// Current time as epoch milliseconds, the unit record ids are expressed in.
    fn millis(&self) -> i64 {
        self.time().timestamp_millis()
    }
}

#[derive(Clone, Copy, Default)]
pub struct DefaultClock;

#[async_trait]
impl Clock for DefaultClock {
    fn time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn sleep_until(&self, instant: tokio::time::Instant) {
        tokio::time::sleep_until(instant).await;
    }
}

#[cfg(test)]
pub mod test_clock {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::Clock;

    /// Wall clock that only moves when a test says so. Sleeping still goes through tokio so
    /// paused-time tests keep working.
    #[derive(Clone)]
    pub struct ManualClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        pub fn at_millis(millis: i64) -> Self {
            Self {
                now: Arc::new(Mutex::new(
                    Utc.timestamp_millis_opt(millis).single().unwrap(),
                )),
            }
        }

        pub fn set_millis(&self, millis: i64) {
            *self.now.lock() = Utc.timestamp_millis_opt(millis).single().unwrap();
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn time(&self) -> DateTime<Utc> {
            *self.now.lock()
        }

        fn instant(&self) -> Instant {
            Instant::now()
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }

        async fn sleep_until(&self, instant: tokio::time::Instant) {
            tokio::time::sleep_until(instant).await;
        }
    }
}
