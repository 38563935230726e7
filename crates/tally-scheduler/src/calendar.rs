//! Recurrence arithmetic: advancing a rule from one due instant to the next.
//!
//! Month-based frequencies clamp the target day to the length of the target
//! month, so a rule anchored on the 31st lands on the 28th/29th in February
//! and returns to the 31st in March. Weekend and holiday deferral is applied
//! after the frequency arithmetic and never feeds back into the clamping.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc, Weekday};

use crate::types::{Recurrence, RecurrenceRule};

/// Upper bound on consecutive days a single occurrence may be deferred.
const MAX_DEFERRAL_DAYS: u32 = 31;

/// Source of non-business days used when a rule sets `skip_holidays`.
pub trait HolidayCalendar: Send + Sync {
    fn is_holiday(&self, date: NaiveDate) -> bool;
}

/// Calendar without holidays. `skip_holidays` is a no-op under it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHolidays;

impl HolidayCalendar for NoHolidays {
    fn is_holiday(&self, _date: NaiveDate) -> bool {
        false
    }
}

/// Calendar backed by an explicit set of dates.
#[derive(Debug, Clone, Default)]
pub struct FixedHolidays {
    dates: BTreeSet<NaiveDate>,
}

impl FixedHolidays {
    pub fn new(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            dates: dates.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

impl HolidayCalendar for FixedHolidays {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }
}

/// One occurrence of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    /// Nominal instant, before weekend/holiday deferral.
    pub anchor: DateTime<Utc>,
    /// Instant the occurrence actually becomes due.
    pub due: DateTime<Utc>,
}

/// Computes due instants for recurrence rules.
#[derive(Clone)]
pub struct RecurrenceCalculator {
    holidays: Arc<dyn HolidayCalendar>,
}

impl Default for RecurrenceCalculator {
    fn default() -> Self {
        Self::new(Arc::new(NoHolidays))
    }
}

impl std::fmt::Debug for RecurrenceCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurrenceCalculator").finish_non_exhaustive()
    }
}

/// Next due instant after `current`, using no holiday calendar.
pub fn next(current: DateTime<Utc>, recurrence: &Recurrence) -> DateTime<Utc> {
    RecurrenceCalculator::default().next(current, recurrence)
}

impl RecurrenceCalculator {
    pub fn new(holidays: Arc<dyn HolidayCalendar>) -> Self {
        Self { holidays }
    }

    /// Next due instant after `current`, treating `current` as its own anchor.
    pub fn next(&self, current: DateTime<Utc>, recurrence: &Recurrence) -> DateTime<Utc> {
        self.next_occurrence(
            Occurrence {
                anchor: current,
                due: current,
            },
            recurrence,
        )
        .due
    }

    /// Advance one occurrence.
    ///
    /// Every frequency steps from the nominal anchor, so deferral never shifts
    /// later occurrences. When deferral pushes several anchors onto the same
    /// business day (a daily rule over a weekend) the shadowed anchors are
    /// stepped over so a due instant never repeats.
    pub fn next_occurrence(&self, current: Occurrence, recurrence: &Recurrence) -> Occurrence {
        let mut following = self.defer(step(current.anchor, recurrence), recurrence);
        while following.due <= current.due {
            following = self.defer(step(following.anchor, recurrence), recurrence);
        }
        following
    }

    /// First occurrence on or after `start`.
    pub fn first_occurrence(&self, start: DateTime<Utc>, recurrence: &Recurrence) -> Occurrence {
        let start_date = start.date_naive();
        let date = if let (true, Some(day)) =
            (recurrence.frequency.is_month_based(), recurrence.day_of_month)
        {
            let this_month = clamp_day(start_date.year(), start_date.month(), day);
            if this_month >= start_date {
                this_month
            } else {
                add_months(start_date, 1, Some(day))
            }
        } else if let (true, Some(dow)) =
            (recurrence.frequency.is_week_based(), recurrence.day_of_week)
        {
            let current = start_date.weekday().num_days_from_sunday();
            let ahead = (dow + 7 - current) % 7;
            start_date + Duration::days(i64::from(ahead))
        } else {
            start_date
        };
        self.defer(at_time(date, start.time()), recurrence)
    }

    /// Project the next `count` due instants of a rule without touching it.
    pub fn upcoming(&self, rule: &RecurrenceRule, count: usize) -> Vec<DateTime<Utc>> {
        let limit = rule
            .remaining_executions()
            .map_or(count, |remaining| count.min(remaining as usize));

        let mut dates = Vec::with_capacity(limit);
        let mut occurrence = rule.occurrence();
        while dates.len() < limit {
            if rule.end_date.is_some_and(|end| occurrence.due > end) {
                break;
            }
            dates.push(occurrence.due);
            occurrence = self.next_occurrence(occurrence, &rule.recurrence);
        }
        dates
    }

    /// Apply weekend and holiday deferral to a nominal instant.
    fn defer(&self, anchor: DateTime<Utc>, recurrence: &Recurrence) -> Occurrence {
        let mut date = anchor.date_naive();

        if recurrence.skip_weekends {
            date = skip_weekend(date);
        }

        if recurrence.skip_holidays {
            for _ in 0..MAX_DEFERRAL_DAYS {
                let blocked = self.holidays.is_holiday(date)
                    || (recurrence.skip_weekends && is_weekend(date));
                if !blocked {
                    break;
                }
                date = date.succ_opt().unwrap_or(date);
            }
        }

        Occurrence {
            anchor,
            due: at_time(date, anchor.time()),
        }
    }
}

/// Nominal frequency arithmetic, before any deferral.
fn step(anchor: DateTime<Utc>, recurrence: &Recurrence) -> DateTime<Utc> {
    if let Some(months) = recurrence.frequency.month_step() {
        let date = add_months(anchor.date_naive(), months, recurrence.day_of_month);
        return at_time(date, anchor.time());
    }
    let days = recurrence.frequency.day_step().unwrap_or(1);
    anchor + Duration::days(days)
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn skip_weekend(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date + Duration::days(2),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn at_time(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    date.and_time(time).and_utc()
}

/// Number of days in the given month.
pub(crate) fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map_or(28, |d| d.day())
}

/// `day` in the given month, clamped to the month's last day.
fn clamp_day(year: i32, month: u32, day: u32) -> NaiveDate {
    let day = day.clamp(1, days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MAX)
}

/// Move `months` forward, landing on `day_of_month` (or the current day) clamped.
fn add_months(date: NaiveDate, months: u32, day_of_month: Option<u32>) -> NaiveDate {
    let Some(target) = date
        .with_day(1)
        .and_then(|first| first.checked_add_months(Months::new(months)))
    else {
        return NaiveDate::MAX;
    };
    clamp_day(
        target.year(),
        target.month(),
        day_of_month.unwrap_or(date.day()),
    )
}
