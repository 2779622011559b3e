//! Clock injection for deterministic tests.

use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// The clock the transports observe. Production code uses
/// [`SystemTimeProvider`]; tests drive a [`ManualTimeProvider`].
pub trait TimeProvider: Send + Sync + Debug {
    fn now_instant(&self) -> Instant;
    /// Wall-clock milliseconds since the UNIX epoch, for wire timestamps.
    fn now_system_ms(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_system_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A manual time provider for deterministic simulations.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: RwLock<Instant>,
    system_ms: RwLock<u64>,
}

impl ManualTimeProvider {
    pub fn new(instant: Instant, system_ms: u64) -> Self {
        Self {
            instant: RwLock::new(instant),
            system_ms: RwLock::new(system_ms),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write().unwrap() += duration;
        *self.system_ms.write().unwrap() += duration.as_millis() as u64;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        *self.instant.read().unwrap()
    }

    fn now_system_ms(&self) -> u64 {
        *self.system_ms.read().unwrap()
    }
}
