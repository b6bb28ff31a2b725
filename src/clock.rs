//! Injectable time source.
//!
//! Every guard in this crate that compares wall-clock times (the reactivation
//! block, alert suppression, the location cache TTL, reminder dating) reads
//! time through [`Clock`] so tests can drive it deterministically with
//! [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Local, NaiveDate, SecondsFormat, TimeZone, Utc};

/// A source of "now": epoch milliseconds plus the local civil date.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
    /// Today's date in the device's local timezone.
    fn today(&self) -> NaiveDate;
}

/// Production clock backed by [`SystemTime`] and the local timezone.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Hand-cranked clock for tests: time only moves when told to.
pub struct ManualClock {
    millis: AtomicU64,
    date: Mutex<NaiveDate>,
}

impl ManualClock {
    pub fn new(millis: u64, date: NaiveDate) -> Self {
        Self {
            millis: AtomicU64::new(millis),
            date: Mutex::new(date),
        }
    }

    /// Move the millisecond clock forward. The civil date is independent and
    /// changes only via [`set_date`](Self::set_date).
    pub fn advance_millis(&self, delta: u64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn set_date(&self, date: NaiveDate) {
        *self.date.lock().unwrap() = date;
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }

    fn today(&self) -> NaiveDate {
        *self.date.lock().unwrap()
    }
}

/// Format epoch milliseconds as an ISO-8601 UTC timestamp, e.g.
/// `2026-08-29T09:12:44Z`.
pub fn millis_to_iso8601(millis: u64) -> String {
    match Utc.timestamp_millis_opt(millis as i64) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        _ => String::from("1970-01-01T00:00:00Z"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 29).unwrap();
        let clock = ManualClock::new(1000, date);
        assert_eq!(clock.now_millis(), 1000);
        clock.advance_millis(2500);
        assert_eq!(clock.now_millis(), 3500);
        assert_eq!(clock.today(), date);
    }

    #[test]
    fn iso8601_formatting() {
        assert_eq!(millis_to_iso8601(0), "1970-01-01T00:00:00Z");
        assert_eq!(millis_to_iso8601(1_756_454_400_000), "2025-08-29T08:00:00Z");
    }
}
