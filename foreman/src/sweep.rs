//! Periodic expiration sweep.
//!
//! One sweeper runs per coordinator. Each tick calls
//! [`Coordinate::expire_attempts`], which terminates attempts past their
//! deadline and releases workers past theirs. The pass is idempotent and
//! interleaves safely with foreground operations, so a missed or doubled
//! tick is harmless. Sleeping goes through the injected [`Clock`] so tests
//! can drive ticks by advancing a mock clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::Coordinate;
use crate::clock::Clock;

/// Token for signaling the sweeper (or anything else) to stop.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task driving the expiration sweep at a fixed cadence.
pub struct ExpirySweeper {
    coordinate: Arc<dyn Coordinate>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    shutdown: ShutdownToken,
}

impl ExpirySweeper {
    pub fn new(
        coordinate: Arc<dyn Coordinate>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            coordinate,
            clock,
            interval,
            shutdown: ShutdownToken::new(),
        }
    }

    /// Token to stop the spawned task.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Spawn the sweep loop onto the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.clock.sleep(self.interval) => {}
                }
                match self.coordinate.expire_attempts().await {
                    Ok(0) => {}
                    Ok(expired) => debug!(expired, "expiration sweep"),
                    Err(error) => warn!(%error, "expiration sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel();
        handle.await.expect("waiter completes");
        assert!(token.is_cancelled());
    }
}
