//! Trading-session calendar used for retry expiry.
//!
//! An order expires after the close of the next trading session following
//! its first failure, weekends skipped. All functions take `now` explicitly
//! so expiry logic stays deterministic under test.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};

/// Parse "HH:MM" session boundaries
pub fn parse_session_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// Session boundaries for expiry math
#[derive(Debug, Clone, Copy)]
pub struct TradingCalendar {
    pub session_open: NaiveTime,
    pub session_close: NaiveTime,
}

impl TradingCalendar {
    pub fn new(session_open: NaiveTime, session_close: NaiveTime) -> Self {
        Self {
            session_open,
            session_close,
        }
    }

    pub fn from_config(open: &str, close: &str) -> Option<Self> {
        Some(Self::new(parse_session_time(open)?, parse_session_time(close)?))
    }

    fn is_trading_day(day: Weekday) -> bool {
        !matches!(day, Weekday::Sat | Weekday::Sun)
    }

    /// Close of the next trading day strictly after the reference date,
    /// skipping Saturday and Sunday
    pub fn next_session_close(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        let mut date = reference.date_naive() + Duration::days(1);
        while !Self::is_trading_day(date.weekday()) {
            date += Duration::days(1);
        }
        Utc.from_utc_datetime(&date.and_time(self.session_close))
    }

    /// Expiry deadline for an order whose first failure (or creation, for a
    /// never-failed pending order) happened at `failed_at`
    pub fn expiry_deadline(&self, failed_at: DateTime<Utc>) -> DateTime<Utc> {
        self.next_session_close(failed_at)
    }

    pub fn is_expired(&self, failed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now > self.expiry_deadline(failed_at)
    }
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self::new(
            NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
        )
    }
}
