//! Cron expressions.
//!
//! Five fields (`minute hour day-of-month month day-of-week`) or six with a
//! leading seconds field. Each field accepts `*`, `?`, single values, lists
//! (`1,15`), ranges (`1-5`) and steps (`*/10`, `5/15`, `10-40/10`). Months and
//! weekdays also accept three-letter names. Day-of-week `7` is Sunday.
//!
//! When both day fields are restricted a day matches if *either* matches,
//! as in classic cron: `0 0 1 * MON` fires on the 1st and on every Monday.
//!
//! All times are UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 or 6 fields, found {0}")]
    FieldCount(usize),

    #[error("unknown macro '{0}'")]
    UnknownMacro(String),

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Searches further out than this give up and report no next run.
const SEARCH_YEARS: i32 = 10;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct FieldRange {
    name: &'static str,
    min: u32,
    max: u32,
    /// Names map to `min + index`.
    names: &'static [&'static str],
}

const SECONDS: FieldRange = FieldRange { name: "second", min: 0, max: 59, names: &[] };
const MINUTES: FieldRange = FieldRange { name: "minute", min: 0, max: 59, names: &[] };
const HOURS: FieldRange = FieldRange { name: "hour", min: 0, max: 23, names: &[] };
const DAYS_OF_MONTH: FieldRange = FieldRange { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTHS: FieldRange = FieldRange { name: "month", min: 1, max: 12, names: MONTH_NAMES };
const DAYS_OF_WEEK: FieldRange = FieldRange { name: "day-of-week", min: 0, max: 7, names: DAY_NAMES };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bits(u64);

impl Bits {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: Bits,
    minutes: Bits,
    hours: Bits,
    days_of_month: Bits,
    months: Bits,
    days_of_week: Bits,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();
        let expanded = if trimmed.starts_with('@') {
            expand_macro(trimmed)?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (seconds, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => return Err(CronError::FieldCount(n)),
        };

        let mut days_of_week = parse_field(rest[4], &DAYS_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week = Bits((days_of_week.0 | 1) & !(1 << 7));
        }

        Ok(Self {
            expression: trimmed.to_string(),
            seconds: parse_field(seconds, &SECONDS)?,
            minutes: parse_field(rest[0], &MINUTES)?,
            hours: parse_field(rest[1], &HOURS)?,
            days_of_month: parse_field(rest[2], &DAYS_OF_MONTH)?,
            months: parse_field(rest[3], &MONTHS)?,
            days_of_week,
            dom_restricted: is_restricted(rest[2]),
            dow_restricted: is_restricted(rest[4]),
        })
    }

    /// The expression as written.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        let t = at.naive_utc();
        self.months.contains(t.month())
            && self.day_matches(t.date())
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
            && self.seconds.contains(t.second())
    }

    /// First matching instant strictly after `after`, at whole-second
    /// resolution. `None` if nothing matches within the search horizon
    /// (for example `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_nanosecond(0)? + Duration::seconds(1);
        let horizon = start.year() + SEARCH_YEARS;
        let mut t = start;

        loop {
            if t.year() > horizon {
                return None;
            }
            if !self.months.contains(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t.and_utc());
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn expand_macro(name: &str) -> Result<&'static str, CronError> {
    match name.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        _ => Err(CronError::UnknownMacro(name.to_string())),
    }
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

fn start_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(text: &str, bounds: &FieldRange) -> Result<Bits, CronError> {
    let invalid = |reason: String| CronError::InvalidField {
        field: bounds.name,
        value: text.to_string(),
        reason,
    };

    let mut bits = 0u64;
    for part in text.split(',') {
        if part.is_empty() {
            return Err(invalid("empty list element".to_string()));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("step '{step}' is not a number")))?;
                if step == 0 {
                    return Err(invalid("step must be positive".to_string()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (low, high) = if range == "*" || range == "?" {
            (bounds.min, bounds.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, bounds).map_err(invalid)?, parse_value(high, bounds).map_err(invalid)?)
        } else {
            let value = parse_value(range, bounds).map_err(invalid)?;
            // `5/15` means "from 5, every 15".
            (value, if step.is_some() { bounds.max } else { value })
        };

        if low > high {
            return Err(invalid(format!("range {low}-{high} is reversed")));
        }

        for value in (low..=high).step_by(step.unwrap_or(1) as usize) {
            bits |= 1 << value;
        }
    }

    Ok(Bits(bits))
}

fn parse_value(text: &str, bounds: &FieldRange) -> Result<u32, String> {
    let value = match text.parse::<u32>() {
        Ok(n) => n,
        Err(_) => bounds
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(text))
            .map(|i| bounds.min + i as u32)
            .ok_or_else(|| format!("'{text}' is not a valid value"))?,
    };

    if value < bounds.min || value > bounds.max {
        return Err(format!(
            "{value} is outside {}-{}",
            bounds.min, bounds.max
        ));
    }
    Ok(value)
}
