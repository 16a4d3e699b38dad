use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Time source for the coordinator.
///
/// Every deadline computation in the crate routes through this trait, so
/// tests can substitute an advanceable clock and drive expiration
/// deterministically. The sleep primitive exists for the expiration sweeper;
/// foreground operations never sleep.
#[async_trait]
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for the given duration, as measured by this clock.
    async fn sleep(&self, duration: Duration);
}

/// Production clock: wall time and tokio timers.
#[derive(Clone, Copy, Debug, Default)]
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
