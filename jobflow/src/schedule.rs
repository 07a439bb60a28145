// Schedule parsing and firing window checks
//
// A job's cron expression is compiled once and then polled by an external
// trigger loop with consecutive time windows.

use crate::errors::ScheduleError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Compiled cron schedule in a timezone
#[derive(Debug, Clone)]
pub struct Schedule {
    // Several entries when day-of-month and day-of-week are both restricted
    cron: Vec<CronSchedule>,
    timezone: Tz,
}

impl Schedule {
    /// Compile a schedule. With no cron expression the schedule never fires.
    pub fn new(cron: Option<&str>, tz: Option<&str>) -> Result<Self, ScheduleError> {
        let cron = cron.map(parse_cron_expression).transpose()?.unwrap_or_default();
        let timezone = tz.map(parse_timezone).transpose()?.unwrap_or_else(default_timezone);
        Ok(Self { cron, timezone })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// True if the schedule fires at least once in `(start, end]`
    pub fn should_run(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        if end < start {
            return Err(ScheduleError::InvalidWindow {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }

        Ok(self
            .next_run_after(start)
            .map(|next| next <= end)
            .unwrap_or(false))
    }

    /// `should_run` for RFC 3339 instants. Missing or unparsable instants are errors.
    pub fn should_run_rfc3339(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<bool, ScheduleError> {
        let start = parse_instant(start)?;
        let end = parse_instant(end)?;
        self.should_run(start, end)
    }

    /// First firing instant strictly after `after`
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after_in_tz = after.with_timezone(&self.timezone);
        self.cron
            .iter()
            .filter_map(|cron| cron.after(&after_in_tz).next())
            .map(|next| next.with_timezone(&Utc))
            .min()
    }
}

/// Parse and validate a cron expression
///
/// Five-field expressions use standard cron semantics:
/// - a leading seconds field of `0` is added
/// - day-of-week numbers run 0-7 with 0 and 7 both Sunday
/// - when day-of-month and day-of-week are both restricted, either may match
///
/// Six and seven field expressions are passed through unchanged.
pub fn parse_cron_expression(expression: &str) -> Result<Vec<CronSchedule>, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason,
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, day_of_month, month, day_of_week] => {
            let day_of_week = normalize_day_of_week(day_of_week).map_err(invalid)?;
            if is_restricted(day_of_month) && is_restricted(day_of_week.as_str()) {
                vec![
                    format!("0 {} {} {} {} *", minute, hour, day_of_month, month),
                    format!("0 {} {} * {} {}", minute, hour, month, day_of_week),
                ]
            } else {
                vec![format!(
                    "0 {} {} {} {} {}",
                    minute, hour, day_of_month, month, day_of_week
                )]
            }
        }
        _ => vec![fields.join(" ")],
    };

    normalized
        .iter()
        .map(|normalized| {
            CronSchedule::from_str(normalized).map_err(|e| invalid(e.to_string()))
        })
        .collect()
}

// A field starting with `*` (or `?`) does not restrict the day
fn is_restricted(field: &str) -> bool {
    !field.starts_with('*') && field != "?"
}

/// Convert standard day-of-week numbers (0-7, Sunday = 0 or 7) into the
/// 1-7 numbering of the `cron` crate (Sunday = 1). Ranges and steps are
/// expanded into lists. Names such as `MON` are kept as written.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days: Vec<String> = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            days.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{}'", item))?;
                (range, Some(step))
            }
            None => (item, None),
        };
        if step == Some(0) {
            return Err(format!("invalid day-of-week step '{}'", item));
        }

        let (first, last) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((first, last)) => (parse_day_of_week(first)?, parse_day_of_week(last)?),
            // `n/step` runs from n to the end of the week
            None if step.is_some() => (parse_day_of_week(range)?, 6),
            None => {
                let day = parse_day_of_week(range)?;
                (day, day)
            }
        };
        if first > last {
            return Err(format!("invalid day-of-week range '{}'", item));
        }

        for day in (first..=last).step_by(step.unwrap_or(1)) {
            let converted = (day % 7 + 1).to_string();
            if !days.contains(&converted) {
                days.push(converted);
            }
        }
    }

    Ok(days.join(","))
}

fn parse_day_of_week(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("invalid day of week '{}'", value)),
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

fn parse_instant(value: Option<&str>) -> Result<DateTime<Utc>, ScheduleError> {
    let value = value.ok_or_else(|| ScheduleError::InvalidInstant {
        value: String::new(),
        reason: "instant is missing".to_string(),
    })?;

    DateTime::parse_from_rfc3339(value)
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|e| ScheduleError::InvalidInstant {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Timezone used when a job does not name one
pub fn default_timezone() -> Tz {
    Tz::UTC
}
