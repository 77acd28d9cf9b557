//! Backdating and offline-deadline calendar rules.
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};

/// Whole days between the invoice's business date and `today` (negative for future dates).
pub fn days_behind(business_date: NaiveDate, today: NaiveDate) -> i64 {
    (today - business_date).num_days()
}

pub fn is_backdated(business_date: NaiveDate, today: NaiveDate) -> bool {
    days_behind(business_date, today) > 0
}

/// First Monday-to-Friday day strictly after `date`.
pub fn next_business_day(date: NaiveDate) -> NaiveDate {
    let mut next = date + Duration::days(1);
    while matches!(next.weekday(), Weekday::Sat | Weekday::Sun) {
        next += Duration::days(1);
    }
    next
}

/// Last moment an offline invoice may be delivered: 23:59:59 of the next business day.
pub fn offline_deadline(business_date: NaiveDate) -> NaiveDateTime {
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    next_business_day(business_date).and_time(end_of_day)
}

/// [`offline_deadline`] interpreted in the host's local time zone.
pub fn offline_deadline_utc(business_date: NaiveDate) -> DateTime<Utc> {
    let deadline = offline_deadline(business_date);
    Local
        .from_local_datetime(&deadline)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&deadline))
}
