use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use foreman::Clock;
use tokio::sync::watch;

/// Deterministic clock for tests.
///
/// Time only moves when [`advance`](MockClock::advance) (or
/// [`set`](MockClock::set)) is called. Sleepers wake as soon as the clock
/// reaches their deadline; the watch channel makes the wakeup race-free.
#[derive(Clone)]
pub struct MockClock {
    now: watch::Sender<DateTime<Utc>>,
}

impl MockClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        let (now, _) = watch::channel(start);
        Self { now }
    }

    /// A clock starting at an arbitrary fixed instant.
    pub fn fixed() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single().unwrap_or_default())
    }

    /// Move the clock forward, waking any sleeper whose deadline passed.
    pub fn advance(&self, delta: Duration) {
        self.now.send_modify(|now| *now = *now + delta);
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        self.now.send_modify(|now| *now = instant);
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }

    async fn sleep(&self, duration: StdDuration) {
        let delta = Duration::from_std(duration).unwrap_or_else(|_| Duration::max_value());
        let deadline = self.now() + delta;
        let mut rx = self.now.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
