//! Cron expression validation and fire-time computation.
//!
//! Grammar per field: `*` or `?`, a number or name, a range `a-b` (`a < b`),
//! a step `*/n` or `a-b/n`, or a comma list of those. Five-field expressions
//! (`minute hour day month weekday`) fire at second 0; six-field expressions
//! prepend a seconds field.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::Serialize;

use crate::error::ScheduleError;

/// Give up searching for a fire time this far past the reference instant.
const SEARCH_HORIZON_DAYS: i64 = 5 * 366;

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Symbolic names; `names[i]` stands for `min + i`.
    names: &'static [&'static str],
}

const SECOND: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: &[] };
const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTH_NAMES };
// 0 and 7 are both Sunday.
const WEEKDAY: FieldSpec = FieldSpec { name: "weekday", min: 0, max: 7, names: WEEKDAY_NAMES };

/// Outcome of [`validate`], shaped for status payloads and CLI output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Check a cron expression without side effects. Returns the first error found.
pub fn validate(expr: &str) -> ValidationResult {
    match CronSchedule::parse(expr) {
        Ok(_) => ValidationResult { valid: true, error: None },
        Err(e) => ValidationResult {
            valid: false,
            error: Some(e.to_string()),
        },
    }
}

/// A parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    weekdays: u64,
    // Vixie semantics: when both day fields are restricted, either may match.
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        // Reject anything outside the grammar's alphabet before touching fields.
        if !expr.chars().all(is_allowed_char) {
            return Err(ScheduleError::InvalidCharacters);
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        let (second_raw, rest) = match fields.len() {
            5 => (None, &fields[..]),
            6 => (Some(fields[0]), &fields[1..]),
            count => return Err(ScheduleError::FieldCount { count }),
        };

        let seconds = match second_raw {
            Some(raw) => parse_field(raw, &SECOND)?,
            None => 1,
        };
        let minutes = parse_field(rest[0], &MINUTE)?;
        let hours = parse_field(rest[1], &HOUR)?;
        let days_of_month = parse_field(rest[2], &DAY_OF_MONTH)?;
        let months = parse_field(rest[3], &MONTH)?;
        let mut weekdays = parse_field(rest[4], &WEEKDAY)?;
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays | 1) & !(1 << 7);
        }

        Ok(Self {
            expression: fields.join(" "),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            weekdays,
            dom_restricted: is_restricted(rest[2]),
            dow_restricted: is_restricted(rest[4]),
        })
    }

    /// Normalised expression text (single-space separated).
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First instant strictly after `after` matching every field, or `None`
    /// when the expression cannot fire within the search horizon
    /// (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_nanosecond(0)? + Duration::seconds(1);
        let limit = start + Duration::days(SEARCH_HORIZON_DAYS);
        let mut t = start;

        while t <= limit {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }
            if !bit(self.seconds, t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(Utc.from_utc_datetime(&t));
        }
        None
    }

    /// The next `n` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(n);
        let mut cursor = after;
        while out.len() < n {
            match self.next_after(cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }

    fn day_matches(&self, t: NaiveDateTime) -> bool {
        let dom = bit(self.days_of_month, t.day());
        let dow = bit(self.weekdays, t.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl std::str::FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-' | ' ' | '?')
}

fn is_restricted(raw: &str) -> bool {
    !(raw.starts_with('*') || raw.starts_with('?'))
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn field_error(spec: &FieldSpec, raw: &str, reason: impl Into<String>) -> ScheduleError {
    ScheduleError::InvalidField {
        field: spec.name,
        value: raw.to_string(),
        reason: reason.into(),
    }
}

fn parse_field(raw: &str, spec: &FieldSpec) -> Result<u64, ScheduleError> {
    let mut mask = 0u64;
    for part in raw.split(',') {
        if part.is_empty() {
            return Err(field_error(spec, raw, "empty list element"));
        }
        mask |= parse_part(part, raw, spec)?;
    }
    Ok(mask)
}

fn parse_part(part: &str, raw: &str, spec: &FieldSpec) -> Result<u64, ScheduleError> {
    if let Some((base, step)) = part.split_once('/') {
        let step: u32 = step
            .parse()
            .map_err(|_| field_error(spec, raw, format!("step '{step}' is not a number")))?;
        if step == 0 {
            return Err(field_error(spec, raw, "step must be greater than 0"));
        }
        let (lo, hi) = if is_wildcard(base) {
            (spec.min, spec.max)
        } else if base.contains('-') {
            parse_range(base, raw, spec)?
        } else {
            return Err(field_error(
                spec,
                raw,
                format!("step base '{base}' must be '*' or a range"),
            ));
        };
        return Ok((lo..=hi).step_by(step as usize).fold(0, |m, v| m | (1u64 << v)));
    }

    let (lo, hi) = if is_wildcard(part) {
        (spec.min, spec.max)
    } else if part.contains('-') {
        parse_range(part, raw, spec)?
    } else {
        let v = parse_value(part, raw, spec)?;
        (v, v)
    };
    Ok((lo..=hi).fold(0, |m, v| m | (1u64 << v)))
}

fn is_wildcard(token: &str) -> bool {
    token == "*" || token == "?"
}

fn parse_range(token: &str, raw: &str, spec: &FieldSpec) -> Result<(u32, u32), ScheduleError> {
    let Some((lo, hi)) = token.split_once('-') else {
        return Err(field_error(spec, raw, format!("'{token}' is not a range")));
    };
    let lo = parse_value(lo, raw, spec)?;
    let hi = parse_value(hi, raw, spec)?;
    if lo >= hi {
        return Err(field_error(
            spec,
            raw,
            format!("range start {lo} must be less than end {hi}"),
        ));
    }
    Ok((lo, hi))
}

fn parse_value(token: &str, raw: &str, spec: &FieldSpec) -> Result<u32, ScheduleError> {
    if token.is_empty() {
        return Err(field_error(spec, raw, "missing value"));
    }
    let value = if token.chars().all(|c| c.is_ascii_digit()) {
        token
            .parse::<u32>()
            .map_err(|_| field_error(spec, raw, format!("'{token}' is out of range")))?
    } else {
        let lower = token.to_ascii_lowercase();
        match spec.names.iter().position(|n| *n == lower) {
            Some(idx) => spec.min + idx as u32,
            None => return Err(field_error(spec, raw, format!("unknown value '{token}'"))),
        }
    };
    if value < spec.min || value > spec.max {
        return Err(field_error(
            spec,
            raw,
            format!("{value} is outside {}-{}", spec.min, spec.max),
        ));
    }
    Ok(value)
}
