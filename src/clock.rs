//! Time source
//!
//! Everything that compares timestamps (cooldowns, consolidation schedule,
//! recency ranking) reads time through [`Clock`] so tests can drive it.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock, truncated to milliseconds so persisted timestamps round-trip exactly
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Start at a fixed, arbitrary instant (2025-01-01T00:00:00Z)
    pub fn fixed() -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(1_735_689_600_000)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.now_ms.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.now_ms.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(ms).unwrap_or_default()
    }
}

/// Time elapsed from `earlier` to `now`, zero if the clock went backwards
pub fn elapsed_between(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}

/// Millisecond timestamp for storage
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> crate::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| crate::Error::Persistence(format!("invalid timestamp: {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::fixed();
        let start = clock.now();
        clock.advance(Duration::from_secs(600));
        assert_eq!(elapsed_between(start, clock.now()), Duration::from_secs(600));
    }

    #[test]
    fn test_elapsed_never_negative() {
        let clock = ManualClock::fixed();
        let later = clock.now();
        clock.set(later - chrono::Duration::seconds(5));
        assert_eq!(elapsed_between(later, clock.now()), Duration::ZERO);
    }

    #[test]
    fn test_system_clock_millis_roundtrip() {
        let now = SystemClock.now();
        assert_eq!(from_millis(to_millis(now)).unwrap(), now);
    }
}
