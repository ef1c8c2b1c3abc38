//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, evaluated in UTC. Each field
//! accepts `*`, single values, ranges (`1-5`), lists (`1,15`), and steps
//! (`*/15`, `10-40/10`). Months and weekdays also accept three-letter names;
//! weekday `7` is Sunday like `0`. The `@hourly`, `@daily`, `@weekly`,
//! `@monthly` and `@yearly` shortcuts are accepted.
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! either matches.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CronError {
    #[error("cron expression '{expr}' has {got} fields, expected 5")]
    FieldCount { expr: String, got: usize },

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Years searched ahead before giving up on `next_after`.
const SEARCH_YEARS: i32 = 5;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

struct FieldDef {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of the first name in `names`.
    names_start: u32,
}

const MINUTE: FieldDef = FieldDef {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_start: 0,
};
const HOUR: FieldDef = FieldDef {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_start: 0,
};
const DAY_OF_MONTH: FieldDef = FieldDef {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_start: 0,
};
const MONTH: FieldDef = FieldDef {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    names_start: 1,
};
// 7 is accepted and folded onto 0.
const DAY_OF_WEEK: FieldDef = FieldDef {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &WEEKDAY_NAMES,
    names_start: 0,
};

/// A parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let trimmed = expr.trim();
        let expanded = match trimmed {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount {
                expr: expr.to_string(),
                got: parts.len(),
            });
        }

        let mut days_of_week = parse_field(parts[4], &DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            minutes: parse_field(parts[0], &MINUTE)?,
            hours: parse_field(parts[1], &HOUR)?,
            days_of_month: parse_field(parts[2], &DAY_OF_MONTH)?,
            months: parse_field(parts[3], &MONTH)?,
            days_of_week,
            dom_restricted: parts[2] != "*",
            dow_restricted: parts[4] != "*",
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the minute containing `at` is a fire time.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        bit(self.minutes, at.minute())
            && bit(self.hours, at.hour())
            && bit(self.months, at.month())
            && self.day_matches(at)
    }

    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        let dom = bit(self.days_of_month, at.day());
        let dow = bit(self.days_of_week, at.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }

    /// First fire time strictly after `after`, at minute resolution.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(after)? + Duration::minutes(1);
        let limit_year = after.year() + SEARCH_YEARS;

        while t.year() <= limit_year {
            if !bit(self.months, t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_next_day(t)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = truncate_to_hour(t)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// Whether a fire time lies in `(after, until]`.
    pub fn fires_between(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> bool {
        self.next_after(after).is_some_and(|t| t <= until)
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
        f.write_str(&self.source)
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn parse_field(text: &str, def: &FieldDef) -> Result<u64, CronError> {
    let invalid = |reason: String| CronError::InvalidField {
        field: def.name,
        value: text.to_string(),
        reason,
    };

    let mut mask = 0u64;
    for item in text.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("bad step '{}'", step)))?;
                if step == 0 {
                    return Err(invalid("step must be positive".to_string()));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (def.min, def.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(lo, def)?, parse_value(hi, def)?)
        } else {
            let start = parse_value(range, def)?;
            // `5/15` means every 15 starting at 5.
            if item.contains('/') {
                (start, def.max)
            } else {
                (start, start)
            }
        };

        if start > end {
            return Err(invalid(format!("range {}-{} is reversed", start, end)));
        }

        let mut v = start;
        while v <= end {
            mask |= 1u64 << v;
            v += step;
        }
    }
    Ok(mask)
}

fn parse_value(text: &str, def: &FieldDef) -> Result<u32, CronError> {
    let lower = text.to_ascii_lowercase();
    let value = match def.names.iter().position(|n| *n == lower) {
        Some(i) => i as u32 + def.names_start,
        None => text.parse::<u32>().map_err(|_| CronError::InvalidField {
            field: def.name,
            value: text.to_string(),
            reason: "not a number".to_string(),
        })?,
    };

    if value < def.min || value > def.max {
        return Err(CronError::InvalidField {
            field: def.name,
            value: text.to_string(),
            reason: format!("out of range {}-{}", def.min, def.max),
        });
    }
    Ok(value)
}

fn truncate_to_minute(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(t.timestamp().div_euclid(60) * 60, 0)
}

fn truncate_to_hour(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(t.timestamp().div_euclid(3600) * 3600, 0)
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_minute() {
        let cron = CronSchedule::parse("* * * * *").unwrap();
        assert!(cron.matches(at(2024, 3, 5, 10, 17)));
        assert_eq!(
            cron.next_after(at(2024, 3, 5, 10, 17) + Duration::seconds(30)),
            Some(at(2024, 3, 5, 10, 18))
        );
    }

    #[test]
    fn test_steps_ranges_and_lists() {
        let cron = CronSchedule::parse("*/15 9-17 * * mon-fri").unwrap();
        // 2024-03-04 is a Monday.
        assert!(cron.matches(at(2024, 3, 4, 9, 45)));
        assert!(!cron.matches(at(2024, 3, 4, 9, 50)));
        assert!(!cron.matches(at(2024, 3, 4, 18, 0)));
        assert!(!cron.matches(at(2024, 3, 9, 10, 0)));

        let cron = CronSchedule::parse("5,35 0 1 jan,jul *").unwrap();
        assert!(cron.matches(at(2024, 7, 1, 0, 35)));
        assert!(!cron.matches(at(2024, 8, 1, 0, 35)));
    }

    #[test]
    fn test_next_after_skips_months_and_days() {
        let cron = CronSchedule::parse("30 6 29 2 *").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 1, 0, 0)), Some(at(2028, 2, 29, 6, 30)));

        let daily = CronSchedule::parse("@daily").unwrap();
        assert_eq!(daily.next_after(at(2024, 12, 31, 0, 0)), Some(at(2025, 1, 1, 0, 0)));
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // The 13th, or any Friday.
        let cron = CronSchedule::parse("0 0 13 * 5").unwrap();
        assert!(cron.matches(at(2024, 3, 13, 0, 0)));
        assert!(cron.matches(at(2024, 3, 8, 0, 0)));
        assert!(!cron.matches(at(2024, 3, 9, 0, 0)));
    }

    #[test]
    fn test_sunday_as_seven() {
        let cron = CronSchedule::parse("0 12 * * 7").unwrap();
        // 2024-03-10 is a Sunday.
        assert!(cron.matches(at(2024, 3, 10, 12, 0)));
    }

    #[test]
    fn test_fires_between() {
        let cron = CronSchedule::parse("0 * * * *").unwrap();
        assert!(cron.fires_between(at(2024, 1, 1, 9, 59), at(2024, 1, 1, 10, 0)));
        assert!(!cron.fires_between(at(2024, 1, 1, 10, 0), at(2024, 1, 1, 10, 59)));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            CronSchedule::parse("* * * *"),
            Err(CronError::FieldCount { got: 4, .. })
        ));
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("10-5 * * * *").is_err());
        assert!(CronSchedule::parse("* * * foo *").is_err());
    }
}
