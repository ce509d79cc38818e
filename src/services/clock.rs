//! Time source.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Local, TimeZone, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Start of the day containing `at`, in the clock's time zone.
    fn midnight(&self, at: DateTime<Utc>) -> DateTime<Utc>;

    /// Start of today.
    fn today(&self) -> DateTime<Utc> {
        self.midnight(self.now())
    }
}

/// Wall clock; days start at local midnight.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn midnight(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let local_date = at.with_timezone(&Local).date_naive();
        local_date
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            // Midnight skipped by a DST jump; fall back to the UTC day.
            .unwrap_or_else(|| local_date.and_time(chrono::NaiveTime::MIN).and_utc())
    }
}

/// Settable clock for tests; days start at UTC midnight.
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn midnight(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at.date_naive().and_time(chrono::NaiveTime::MIN).and_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_moves() {
        let start = DateTime::parse_from_rfc3339("2026-03-10T15:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.today().to_rfc3339(), "2026-03-10T00:00:00+00:00");

        clock.advance(Duration::hours(10));
        assert_eq!(clock.today().to_rfc3339(), "2026-03-11T00:00:00+00:00");
    }

    #[test]
    fn system_midnight_is_not_after_now() {
        let clock = SystemClock;
        let now = clock.now();
        let midnight = clock.today();
        assert!(midnight <= now);
        assert!(now - midnight < Duration::hours(25));
    }
}
