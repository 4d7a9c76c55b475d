//! Time source abstraction.
//!
//! Every day-boundary and tick computation goes through a `Clock` handle so
//! budget resets and pause expiries can be tested without sleeping.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests. Cloning shares the underlying instant.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap() = instant;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.now.lock().unwrap();
        *guard = *guard + delta;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Truncates an instant to UTC midnight of the same day.
pub fn truncate_day(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .unwrap_or(t)
}

/// The UTC midnight following `t`. Used for budget pauses.
pub fn next_utc_midnight(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_day(t) + chrono::Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 11, 8, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now_utc(), start);
        clock.advance(chrono::Duration::hours(24));
        assert_eq!(clock.now_utc(), start + chrono::Duration::hours(24));
    }

    #[test]
    fn day_truncation() {
        let t = Utc.with_ymd_and_hms(2025, 11, 8, 23, 59, 59).unwrap();
        assert_eq!(truncate_day(t), Utc.with_ymd_and_hms(2025, 11, 8, 0, 0, 0).unwrap());
        assert_eq!(next_utc_midnight(t), Utc.with_ymd_and_hms(2025, 11, 9, 0, 0, 0).unwrap());
    }
}
