//! Reporting periods and their `[start, end)` boundaries.
//!
//! Both the online and the offline read paths resolve a period through
//! [`period_range`]; it is the only place that knows where a week starts or
//! how long a month is.

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Granularity of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Day,
    Week,
    Month,
    Year,
}

impl PeriodKind {
    pub const ALL: [PeriodKind; 4] = [
        PeriodKind::Day,
        PeriodKind::Week,
        PeriodKind::Month,
        PeriodKind::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodKind::Day => "day",
            PeriodKind::Week => "week",
            PeriodKind::Month => "month",
            PeriodKind::Year => "year",
        }
    }
}

/// Half-open UTC time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> DomainResult<Self> {
        if start >= end {
            return Err(DomainError::validation(format!(
                "empty time range: {start} >= {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// Resolve the period of kind `kind` that contains the local calendar date
/// `anchor`, evaluated at the fixed UTC offset `offset`.
///
/// Weeks start on Monday. Month and year boundaries follow the calendar.
pub fn period_range(kind: PeriodKind, anchor: NaiveDate, offset: FixedOffset) -> DomainResult<TimeRange> {
    let (first, next) = match kind {
        PeriodKind::Day => (anchor, add_days(anchor, 1)?),
        PeriodKind::Week => {
            let back = u64::from(anchor.weekday().num_days_from_monday());
            let monday = anchor
                .checked_sub_days(Days::new(back))
                .ok_or_else(|| out_of_range(anchor))?;
            (monday, add_days(monday, 7)?)
        }
        PeriodKind::Month => {
            let first = first_of_month(anchor.year(), anchor.month())?;
            let next = if anchor.month() == 12 {
                first_of_month(anchor.year() + 1, 1)?
            } else {
                first_of_month(anchor.year(), anchor.month() + 1)?
            };
            (first, next)
        }
        PeriodKind::Year => (
            first_of_month(anchor.year(), 1)?,
            first_of_month(anchor.year() + 1, 1)?,
        ),
    };

    TimeRange::new(local_midnight(first, offset)?, local_midnight(next, offset)?)
}

/// Resolve the period of kind `kind` containing `instant` as seen at `offset`.
pub fn period_containing(kind: PeriodKind, instant: DateTime<Utc>, offset: FixedOffset) -> DomainResult<TimeRange> {
    period_range(kind, instant.with_timezone(&offset).date_naive(), offset)
}

fn add_days(date: NaiveDate, days: u64) -> DomainResult<NaiveDate> {
    date.checked_add_days(Days::new(days))
        .ok_or_else(|| out_of_range(date))
}

fn first_of_month(year: i32, month: u32) -> DomainResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| DomainError::out_of_range(format!("{year}-{month:02}")))
}

fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DomainResult<DateTime<Utc>> {
    offset
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| out_of_range(date))
}

fn out_of_range(date: NaiveDate) -> DomainError {
    DomainError::out_of_range(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn zero() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn week_starts_on_monday() {
        // 2024-03-14 is a Thursday.
        let range = period_range(PeriodKind::Week, date(2024, 3, 14), zero()).unwrap();
        assert_eq!(range.start, utc(2024, 3, 11));
        assert_eq!(range.end, utc(2024, 3, 18));
    }

    #[test]
    fn sunday_belongs_to_the_preceding_week() {
        let range = period_range(PeriodKind::Week, date(2024, 3, 17), zero()).unwrap();
        assert_eq!(range.start, utc(2024, 3, 11));
    }

    #[test]
    fn december_rolls_into_next_year() {
        let range = period_range(PeriodKind::Month, date(2023, 12, 31), zero()).unwrap();
        assert_eq!(range.start, utc(2023, 12, 1));
        assert_eq!(range.end, utc(2024, 1, 1));
    }

    #[test]
    fn leap_february_has_29_days() {
        let range = period_range(PeriodKind::Month, date(2024, 2, 10), zero()).unwrap();
        assert_eq!(range.end - range.start, chrono::Duration::days(29));
    }

    #[test]
    fn positive_offset_shifts_boundaries_back_in_utc() {
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let range = period_range(PeriodKind::Day, date(2024, 5, 2), offset).unwrap();
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 5, 1, 21, 0, 0).unwrap());
        assert_eq!(range.end, Utc.with_ymd_and_hms(2024, 5, 2, 21, 0, 0).unwrap());
    }

    #[test]
    fn period_containing_uses_local_date() {
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        // 22:30 UTC on May 1st is already May 2nd at +03:00.
        let instant = Utc.with_ymd_and_hms(2024, 5, 1, 22, 30, 0).unwrap();
        let range = period_containing(PeriodKind::Day, instant, offset).unwrap();
        assert!(range.contains(instant));
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 5, 1, 21, 0, 0).unwrap());
    }

    #[test]
    fn empty_range_is_rejected() {
        let t = utc(2024, 1, 1);
        assert!(TimeRange::new(t, t).is_err());
    }

    fn any_kind() -> impl Strategy<Value = PeriodKind> {
        prop::sample::select(PeriodKind::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        /// Property: the period always contains the anchor's local midnight,
        /// and the next period starts exactly where this one ends.
        #[test]
        fn periods_tile_the_calendar(
            kind in any_kind(),
            days in 0i64..60_000,
            offset_minutes in -720i32..=840,
        ) {
            let offset = FixedOffset::east_opt(offset_minutes * 60).unwrap();
            let anchor = date(1970, 1, 1) + chrono::Duration::days(days);
            let range = period_range(kind, anchor, offset).unwrap();

            let midnight = local_midnight(anchor, offset).unwrap();
            prop_assert!(range.contains(midnight));

            let next_anchor = range.end.with_timezone(&offset).date_naive();
            let next = period_range(kind, next_anchor, offset).unwrap();
            prop_assert_eq!(next.start, range.end);

            if kind == PeriodKind::Week {
                prop_assert_eq!(range.start.with_timezone(&offset).weekday(), Weekday::Mon);
            }
        }
    }
}
