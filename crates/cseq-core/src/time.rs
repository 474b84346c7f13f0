//! Wall-clock sources for CSN generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time in milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A clock that only moves when told to. Useful for deterministic tests
/// and for simulating skewed or frozen clocks.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(now: u64) -> Self {
        ManualTimeSource {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_source() {
        let t = ManualTimeSource::new(100);
        assert_eq!(t.now_millis(), 100);
        t.advance(5);
        assert_eq!(t.now_millis(), 105);
        t.set(1);
        assert_eq!(t.now_millis(), 1);
    }

    #[test]
    fn test_system_time_source_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(SystemTimeSource.now_millis() > 1_577_836_800_000);
    }
}
