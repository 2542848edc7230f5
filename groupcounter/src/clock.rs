//! The time source every scheduling decision goes through.
//!
//! Nothing in this crate consults the wall clock directly. The host supplies
//! a [`Clock`] -- [`RealClock`] in production -- which makes flush timing and
//! snapshot rewind fully deterministic under test.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::time::Duration;

/// The `Clock` used for all scheduling and timestamping.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time as whole seconds since the unix epoch.
    fn now(&self) -> u64;
    /// Wait for `period` of time.
    async fn wait(&self, period: Duration);
}

/// A clock that operates with respect to real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

#[async_trait]
impl Clock for RealClock {
    /// # Panics
    ///
    /// Function will panic if the system clock reads earlier than the unix
    /// epoch.
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("UNIX_EPOCH is earlier than the system clock")
            .as_secs()
    }

    async fn wait(&self, period: Duration) {
        tokio::time::sleep(period).await;
    }
}
