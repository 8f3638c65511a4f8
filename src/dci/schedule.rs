//! Cron-like schedule matching for advanced polling schedules.
//!
//! A pattern has five fields (minute, hour, day of month, month, day of
//! week) and an optional sixth one for seconds. Each field is `*`, a value,
//! a range `a-b` or a comma separated list of values and ranges, optionally
//! followed by `/step`. The step applies to `*` and ranges and is checked
//! against the absolute value (`10-20/5` matches 10, 15 and 20). `L` alone
//! means the last valid value of the field; in the day-of-week field `nL`
//! means the last weekday `n` of the month. Day of week accepts 0-7 where
//! both 0 and 7 are Sunday.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;

/// Schedule pattern errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule must have 5 or 6 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field} field '{value}'")]
    InvalidField { field: &'static str, value: String },
}

/// Result of matching one pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleMatch {
    pub matched: bool,
    /// The pattern carries a seconds field.
    pub with_seconds: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
    Second,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day of month",
            Self::Month => "month",
            Self::DayOfWeek => "day of week",
            Self::Second => "second",
        }
    }

    fn bounds(self) -> (u32, u32) {
        match self {
            Self::Minute | Self::Second => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            Self::DayOfWeek => (0, 7),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Element {
    Value(u32),
    Range(u32, u32),
    LastWeekday(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any { step: u32 },
    Last,
    List { elements: Vec<Element>, step: u32 },
}

/// Calendar context a field is matched in.
struct Calendar {
    day_of_month: u32,
    last_day_of_month: u32,
}

fn invalid(kind: FieldKind, text: &str) -> ScheduleError {
    ScheduleError::InvalidField {
        field: kind.name(),
        value: text.to_string(),
    }
}

fn parse_number(kind: FieldKind, text: &str, full: &str) -> Result<u32, ScheduleError> {
    let n: u32 = text.trim().parse().map_err(|_| invalid(kind, full))?;
    let (lo, hi) = kind.bounds();
    if n < lo || n > hi {
        return Err(invalid(kind, full));
    }
    Ok(n)
}

fn parse_field(kind: FieldKind, text: &str) -> Result<Field, ScheduleError> {
    if text.starts_with('L') {
        return if text == "L" { Ok(Field::Last) } else { Err(invalid(kind, text)) };
    }

    let (body, step) = match text.split_once('/') {
        Some((body, "")) => (body, 1),
        Some((body, step)) => match step.parse::<u32>() {
            Ok(s) if s > 0 => (body, s),
            _ => return Err(invalid(kind, text)),
        },
        None => (text, 1),
    };

    if body == "*" {
        return Ok(Field::Any { step });
    }
    if body.is_empty() {
        return Err(invalid(kind, text));
    }

    let mut elements = Vec::new();
    for part in body.split(',') {
        let hyphens = part.matches('-').count();
        if hyphens > 1 {
            return Err(invalid(kind, text));
        }
        if hyphens == 1 {
            let (from, to) = part.split_once('-').ok_or_else(|| invalid(kind, text))?;
            elements.push(Element::Range(
                parse_number(kind, from, text)?,
                parse_number(kind, to, text)?,
            ));
        } else if let Some(day) = part.strip_suffix('L') {
            if kind != FieldKind::DayOfWeek {
                return Err(invalid(kind, text));
            }
            elements.push(Element::LastWeekday(parse_number(kind, day, text)? % 7));
        } else {
            elements.push(Element::Value(parse_number(kind, part, text)?));
        }
    }
    Ok(Field::List { elements, step })
}

impl Field {
    fn matches(&self, kind: FieldKind, value: u32, max: u32, cal: &Calendar) -> bool {
        let sunday = kind == FieldKind::DayOfWeek && value == 0;
        match self {
            Field::Last => value == max,
            Field::Any { step } => value % step == 0,
            Field::List { elements, step } => elements.iter().any(|e| match *e {
                Element::Value(n) => n == value || (sunday && n == 7),
                Element::Range(from, to) => {
                    let in_range = (from..=to).contains(&value) || (sunday && (from..=to).contains(&7));
                    in_range && value % step == 0
                }
                Element::LastWeekday(n) => n == value && cal.day_of_month + 7 > cal.last_day_of_month,
            }),
        }
    }
}

/// Last day of the given month.
pub fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (y, m) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(31)
}

fn split_fields(pattern: &str) -> Result<Vec<&str>, ScheduleError> {
    let fields: Vec<&str> = pattern.split_whitespace().collect();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(ScheduleError::FieldCount(fields.len()));
    }
    Ok(fields)
}

const KINDS: [FieldKind; 6] = [
    FieldKind::Minute,
    FieldKind::Hour,
    FieldKind::DayOfMonth,
    FieldKind::Month,
    FieldKind::DayOfWeek,
    FieldKind::Second,
];

/// Check that a pattern is well formed.
pub fn validate(pattern: &str) -> Result<(), ScheduleError> {
    for (text, kind) in split_fields(pattern)?.into_iter().zip(KINDS) {
        parse_field(kind, text)?;
    }
    Ok(())
}

/// Match a pattern against a local time.
pub fn evaluate<T: Datelike + Timelike>(pattern: &str, time: &T) -> Result<ScheduleMatch, ScheduleError> {
    let fields = split_fields(pattern)?;
    let cal = Calendar {
        day_of_month: time.day(),
        last_day_of_month: last_day_of_month(time.year(), time.month()),
    };

    let mut matched = true;
    for (text, kind) in fields.iter().zip(KINDS) {
        let field = parse_field(kind, text)?;
        let (value, max) = match kind {
            FieldKind::Minute => (time.minute(), 59),
            FieldKind::Hour => (time.hour(), 23),
            FieldKind::DayOfMonth => (time.day(), cal.last_day_of_month),
            FieldKind::Month => (time.month(), 12),
            FieldKind::DayOfWeek => (time.weekday().num_days_from_sunday(), 6),
            FieldKind::Second => (time.second(), 59),
        };
        if !field.matches(kind, value, max, &cal) {
            matched = false;
        }
    }

    Ok(ScheduleMatch {
        matched,
        with_seconds: fields.len() == 6,
    })
}

/// Match a pattern, treating a malformed pattern as non-matching.
pub fn matches<T: Datelike + Timelike>(pattern: &str, time: &T) -> bool {
    match evaluate(pattern, time) {
        Ok(m) => m.matched,
        Err(e) => {
            tracing::warn!("Schedule '{}' ignored: {}", pattern, e);
            false
        }
    }
}

/// Decide whether any of `patterns` fires at `now`.
///
/// A matching minute-resolution pattern fires at most once per calendar
/// minute: it needs at least 60 seconds since `last_check`, or `now` to be
/// in a different minute than `last_check`.
pub fn schedules_due(patterns: &[String], now: &NaiveDateTime, last_check: Option<&NaiveDateTime>) -> bool {
    for pattern in patterns {
        let m = match evaluate(pattern, now) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Schedule '{}' ignored: {}", pattern, e);
                continue;
            }
        };
        if !m.matched {
            continue;
        }
        let fresh_minute = match last_check {
            None => true,
            Some(last) => {
                (*now - *last).num_seconds() >= 60
                    || now.minute() != last.minute()
                    || now.hour() != last.hour()
                    || now.date() != last.date()
            }
        };
        if m.with_seconds || fresh_minute {
            return true;
        }
    }
    false
}
