//! Recurrence expressions and next-trigger calculation.
//!
//! Supported forms (all evaluated in UTC):
//! - `every 30m` / `every 2h` / `every 1d` / `every 45s` / `every 1w`, plus `hourly`
//! - `daily 08:00`
//! - `weekly mon 18:30`
//! - 5-field cron `MIN HOUR DOM MON DOW` with `*`, `*/N`, `N` and `a,b,c`
//!
//! Every calculation returns the smallest instant strictly after `now`.

use std::fmt;
use std::str::FromStr;

use chorely_core::error::{ChorelyError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc, Weekday};

/// How far ahead a cron expression is searched before it's considered dead.
const CRON_SEARCH_DAYS: i64 = 366;

/// A parsed recurrence expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Recurrence {
    /// Fixed interval from the previous trigger computation.
    Every(Duration),
    /// Every day at a wall-clock time.
    Daily { at: NaiveTime },
    /// Every week on a given day.
    Weekly { weekday: Weekday, at: NaiveTime },
    /// Simplified cron.
    Cron(CronSchedule),
}

impl Recurrence {
    /// Parse an expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = expression.trim().to_ascii_lowercase();
        let parts: Vec<&str> = normalized.split_whitespace().collect();

        match parts.as_slice() {
            ["hourly"] => Ok(Recurrence::Every(Duration::hours(1))),
            ["every", interval] => parse_interval(expression, interval).map(Recurrence::Every),
            ["daily", time] => Ok(Recurrence::Daily {
                at: parse_time(expression, time)?,
            }),
            ["weekly", day, time] => {
                let weekday = Weekday::from_str(day).map_err(|_| {
                    ChorelyError::invalid_recurrence(expression, format!("unknown weekday '{day}'"))
                })?;
                Ok(Recurrence::Weekly {
                    weekday,
                    at: parse_time(expression, time)?,
                })
            }
            fields if fields.len() == 5 => CronSchedule::parse(expression).map(Recurrence::Cron),
            _ => Err(ChorelyError::invalid_recurrence(
                expression,
                "expected 'every <N><s|m|h|d|w>', 'daily HH:MM', 'weekly <day> HH:MM' or 5 cron fields",
            )),
        }
    }

    /// Smallest trigger instant strictly greater than `now`.
    /// `None` for cron expressions that never match within a year, or when the
    /// next instant is past the representable range.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::Every(every) => now.checked_add_signed(*every),
            Recurrence::Daily { at } => {
                let today = now.date_naive().and_time(*at).and_utc();
                if today > now {
                    Some(today)
                } else {
                    today.checked_add_signed(Duration::days(1))
                }
            }
            Recurrence::Weekly { weekday, at } => {
                let ahead = (7 + weekday.num_days_from_monday() as i64
                    - now.weekday().num_days_from_monday() as i64)
                    % 7;
                let candidate = now
                    .date_naive()
                    .checked_add_signed(Duration::days(ahead))?
                    .and_time(*at)
                    .and_utc();
                if candidate > now {
                    Some(candidate)
                } else {
                    candidate.checked_add_signed(Duration::weeks(1))
                }
            }
            Recurrence::Cron(schedule) => schedule.next_after(now),
        }
    }
}

impl FromStr for Recurrence {
    type Err = ChorelyError;

    fn from_str(s: &str) -> Result<Self> {
        Recurrence::parse(s)
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Every(d) => write!(f, "every {}s", d.num_seconds()),
            Recurrence::Daily { at } => write!(f, "daily {}", at.format("%H:%M")),
            Recurrence::Weekly { weekday, at } => {
                write!(f, "weekly {} {}", weekday, at.format("%H:%M"))
            }
            Recurrence::Cron(schedule) => f.write_str(&schedule.source),
        }
    }
}

/// Parse and compute in one step.
pub fn next_run(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    Recurrence::parse(expression)?
        .next_after(after)
        .ok_or_else(|| ChorelyError::invalid_recurrence(expression, "has no future trigger"))
}

fn parse_interval(expression: &str, interval: &str) -> Result<Duration> {
    let split = interval
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ChorelyError::invalid_recurrence(expression, "interval needs a unit"))?;
    let (num, unit) = interval.split_at(split);
    let n: i64 = num
        .parse()
        .map_err(|_| ChorelyError::invalid_recurrence(expression, "interval needs a number"))?;
    if n <= 0 {
        return Err(ChorelyError::invalid_recurrence(expression, "interval must be positive"));
    }
    let duration = match unit {
        "s" => Duration::try_seconds(n),
        "m" => Duration::try_minutes(n),
        "h" => Duration::try_hours(n),
        "d" => Duration::try_days(n),
        "w" => Duration::try_weeks(n),
        other => {
            return Err(ChorelyError::invalid_recurrence(
                expression,
                format!("unknown interval unit '{other}'"),
            ));
        }
    };
    duration.ok_or_else(|| ChorelyError::invalid_recurrence(expression, "interval is too large"))
}

fn parse_time(expression: &str, time: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(time, "%H:%M").map_err(|_| {
        ChorelyError::invalid_recurrence(expression, format!("'{time}' is not a HH:MM time"))
    })
}

/// Simplified cron schedule: `MIN HOUR DOM MON DOW`. DOM and DOW must both
/// match (AND), unlike classic cron's OR.
#[derive(Debug, Clone, PartialEq)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    /// 0 = Sunday.
    days_of_week: Vec<u32>,
    source: String,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ChorelyError::invalid_recurrence(
                expression,
                "need 5 fields: MIN HOUR DOM MON DOW",
            ));
        }

        let field = |idx: usize, name: &str, min: u32, max: u32| {
            parse_field(parts[idx], min, max).ok_or_else(|| {
                ChorelyError::invalid_recurrence(expression, format!("bad {name} field '{}'", parts[idx]))
            })
        };

        let mut days_of_week: Vec<u32> = field(4, "day-of-week", 0, 7)?
            .into_iter()
            .map(|d| d % 7)
            .collect();
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            minutes: field(0, "minute", 0, 59)?,
            hours: field(1, "hour", 0, 23)?,
            days_of_month: field(2, "day-of-month", 1, 31)?,
            months: field(3, "month", 1, 12)?,
            days_of_week,
            source: expression.trim().to_string(),
        })
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        self.months.contains(&date.month())
            && self.days_of_month.contains(&date.day())
            && self
                .days_of_week
                .contains(&date.weekday().num_days_from_sunday())
    }

    /// Next matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let floor = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after);
        let start = floor.checked_add_signed(Duration::minutes(1))?;
        let start_date = start.date_naive();

        for offset in 0..=CRON_SEARCH_DAYS {
            let date = start_date.checked_add_signed(Duration::days(offset))?;
            if !self.matches_date(date) {
                continue;
            }
            for &h in &self.hours {
                for &m in &self.minutes {
                    let Some(time) = NaiveTime::from_hms_opt(h, m, 0) else {
                        continue;
                    };
                    let candidate = date.and_time(time).and_utc();
                    if candidate >= start {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }
}

/// Parse a cron field into a sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    if field == "*" {
        return Some((min..=max).collect());
    }

    // */N: every N
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((min..=max).step_by(n as usize).collect());
    }

    let mut vals = field
        .split(',')
        .map(|s| s.trim().parse::<u32>().ok().filter(|v| (min..=max).contains(v)))
        .collect::<Option<Vec<u32>>>()?;
    vals.sort_unstable();
    vals.dedup();
    Some(vals)
}
