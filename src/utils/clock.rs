// panelbackup/src/utils/clock.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Time source and sleep primitive for every wait loop in a run.
///
/// Polling and retry loops never call `tokio::time::sleep` directly so tests can
/// drive them with virtual time.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
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

/// Time remaining until `deadline`, zero once it has passed.
pub fn remaining_until(clock: &dyn Clock, deadline: DateTime<Utc>) -> Duration {
    (deadline - clock.now()).to_std().unwrap_or(Duration::ZERO)
}

/// Converts a std duration for chrono arithmetic, saturating on overflow.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
pub(crate) use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::*;
    use std::sync::Mutex;

    /// Virtual clock: `sleep` returns immediately after advancing `now`.
    pub(crate) struct ManualClock {
        now: Mutex<DateTime<Utc>>,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl ManualClock {
        pub(crate) fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(start),
                sleeps: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn advance(&self, duration: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += to_chrono(duration);
        }

        pub(crate) fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
            self.advance(duration);
            tokio::task::yield_now().await;
        }
    }
}
