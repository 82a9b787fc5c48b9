//! Time expression resolver shared by `due:`, `wait:` and filter bounds.
//!
//! Resolution is pure: every form is evaluated against the caller's `now`,
//! in `now`'s UTC offset. Forms are tried from most to least specific:
//!
//! | form                              | result                                   |
//! |-----------------------------------|------------------------------------------|
//! | `now`                             | `now`                                    |
//! | `today` `sod` `tomorrow` `yesterday` | start of that day                     |
//! | `eod` `eow` `eom` `eoq` `eoy`     | end (23:59:59) of the period containing `now` |
//! | `sow` `som` `soq` `soy`           | start of the period containing `now`     |
//! | `mon` … `sunday`                  | end of the next such day (today counts)  |
//! | `jan` … `december`                | start of the next 1st of that month      |
//! | `1st` … `31st`                    | end of the next such day-of-month        |
//! | `17:30` `5pm` `5:30pm`            | today at that time                       |
//! | `later` `someday`                 | 2038-01-18T00:00:00                      |
//! | ISO-8601 / RFC 3339               | that instant (dates: start of day)       |
//! | `P1DT2H`, `2h30m`, `3 days`       | a duration                               |

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc, Weekday,
};

use crate::error::TimeError;

/// Outcome of [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Instant(DateTime<FixedOffset>),
    Duration(Duration),
}

impl Resolved {
    /// Durations count from `now`. `None` when that lands outside the
    /// representable calendar.
    pub fn to_instant(self, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        match self {
            Resolved::Instant(at) => Some(at),
            Resolved::Duration(d) => now.checked_add_signed(d),
        }
    }
}

/// Resolve `expr` relative to `now`.
pub fn resolve(expr: &str, now: DateTime<FixedOffset>) -> Result<Resolved, TimeError> {
    let token = expr.trim();
    let invalid = || TimeError::InvalidExpression(expr.to_owned());
    if token.is_empty() {
        return Err(invalid());
    }
    let lower = token.to_ascii_lowercase();

    let instant = symbolic(&lower, now)
        .or_else(|| weekday(&lower, now))
        .or_else(|| month(&lower, now))
        .or_else(|| ordinal(&lower, now))
        .or_else(|| time_of_day(&lower, now))
        .or_else(|| iso_datetime(token, now));
    if let Some(at) = instant {
        return Ok(Resolved::Instant(at));
    }

    let steps = iso_duration(&lower)
        .or_else(|| compound_duration(&lower))
        .ok_or_else(invalid)?;
    total(steps)
        .map(Resolved::Duration)
        .ok_or_else(|| TimeError::OutOfRange(expr.to_owned()))
}

/// [`resolve`], with durations added to `now`, as a UTC instant.
pub fn resolve_instant(expr: &str, now: DateTime<FixedOffset>) -> Result<DateTime<Utc>, TimeError> {
    resolve(expr, now)?
        .to_instant(now)
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| TimeError::OutOfRange(expr.to_owned()))
}

// ---------------------------------------------------------------------------
// Calendar helpers
// ---------------------------------------------------------------------------

fn at(date: NaiveDate, time: NaiveTime, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    now.offset()
        .from_local_datetime(&NaiveDateTime::new(date, time))
        .single()
}

fn start_of(date: NaiveDate, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    at(date, NaiveTime::from_hms_opt(0, 0, 0)?, now)
}

fn end_of(date: NaiveDate, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    at(date, NaiveTime::from_hms_opt(23, 59, 59)?, now)
}

fn first_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Day before the first of the month `months` after `first`:
/// `last_day(first, 1)` is the last day of `first`'s month.
fn last_day(first: NaiveDate, months: u32) -> Option<NaiveDate> {
    first.checked_add_months(Months::new(months))?.pred_opt()
}

fn quarter_start(date: NaiveDate) -> Option<NaiveDate> {
    first_of_month(date.year(), (date.month0() / 3) * 3 + 1)
}

fn symbolic(token: &str, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    let today = now.date_naive();
    let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    let month = first_of_month(today.year(), today.month())?;
    let year = first_of_month(today.year(), 1)?;
    match token {
        "now" => Some(now),
        "today" | "sod" => start_of(today, now),
        "tomorrow" => start_of(today.succ_opt()?, now),
        "yesterday" => start_of(today.pred_opt()?, now),
        "eod" => end_of(today, now),
        "sow" | "socw" => start_of(monday, now),
        "eow" | "eocw" => end_of(monday + Duration::days(6), now),
        "som" | "socm" => start_of(month, now),
        "eom" | "eocm" => end_of(last_day(month, 1)?, now),
        "soq" | "socq" => start_of(quarter_start(today)?, now),
        "eoq" | "eocq" => end_of(last_day(quarter_start(today)?, 3)?, now),
        "soy" | "socy" => start_of(year, now),
        "eoy" | "eocy" => end_of(last_day(year, 12)?, now),
        "later" | "someday" => start_of(NaiveDate::from_ymd_opt(2038, 1, 18)?, now),
        _ => None,
    }
}

fn parse_weekday(token: &str) -> Option<Weekday> {
    Some(match token {
        "monday" | "mon" => Weekday::Mon,
        "tuesday" | "tue" | "tues" => Weekday::Tue,
        "wednesday" | "wed" => Weekday::Wed,
        "thursday" | "thu" | "thur" | "thurs" => Weekday::Thu,
        "friday" | "fri" => Weekday::Fri,
        "saturday" | "sat" => Weekday::Sat,
        "sunday" | "sun" => Weekday::Sun,
        _ => return None,
    })
}

fn weekday(token: &str, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    let target = parse_weekday(token)?;
    let today = now.date_naive();
    let ahead = (7 + target.num_days_from_monday() - today.weekday().num_days_from_monday()) % 7;
    let candidate = end_of(today + Duration::days(i64::from(ahead)), now)?;
    if candidate > now {
        Some(candidate)
    } else {
        end_of(today + Duration::days(i64::from(ahead) + 7), now)
    }
}

fn parse_month(token: &str) -> Option<u32> {
    Some(match token {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sep" | "sept" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    })
}

fn month(token: &str, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    let target = parse_month(token)?;
    let today = now.date_naive();
    let year = if target > today.month() {
        today.year()
    } else {
        today.year() + 1
    };
    start_of(first_of_month(year, target)?, now)
}

fn ordinal_suffix(day: u32) -> &'static str {
    match (day % 10, day % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    }
}

fn ordinal(token: &str, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    let digits = token.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let suffix = &token[digits.len()..];
    let day: u32 = digits.parse().ok()?;
    if !(1..=31).contains(&day) || suffix != ordinal_suffix(day) {
        return None;
    }
    let this_month = first_of_month(now.year(), now.month())?;
    (0..=12).find_map(|offset| {
        let first = this_month.checked_add_months(Months::new(offset))?;
        let date = NaiveDate::from_ymd_opt(first.year(), first.month(), day)?;
        end_of(date, now).filter(|end| *end > now)
    })
}

fn time_of_day(token: &str, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    let (clock, meridiem) = if let Some(rest) = token.strip_suffix("am") {
        (rest.trim_end(), Some(false))
    } else if let Some(rest) = token.strip_suffix("pm") {
        (rest.trim_end(), Some(true))
    } else {
        (token, None)
    };
    let (hour, minute) = match clock.split_once(':') {
        Some((h, m)) if m.len() == 2 => (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?),
        None if meridiem.is_some() => (clock.parse::<u32>().ok()?, 0),
        _ => return None,
    };
    if clock.is_empty() || clock.len() > 5 {
        return None;
    }
    let hour = match meridiem {
        Some(pm) if (1..=12).contains(&hour) => hour % 12 + if pm { 12 } else { 0 },
        Some(_) => return None,
        None => hour,
    };
    at(now.date_naive(), NaiveTime::from_hms_opt(hour, minute, 0)?, now)
}

fn iso_datetime(token: &str, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(token) {
        return Some(parsed);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%dT%H:%M%z"] {
        if let Ok(parsed) = DateTime::parse_from_str(token, format) {
            return Some(parsed);
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(token, format) {
            return now.offset().from_local_datetime(&naive).single();
        }
    }
    NaiveDate::parse_from_str(token, "%Y-%m-%d")
        .ok()
        .and_then(|date| start_of(date, now))
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

/// A duration as `(count, seconds per unit)` steps.
type Steps = Vec<(i64, i64)>;

/// Sum of `steps`; `None` on overflow.
fn total(steps: Steps) -> Option<Duration> {
    steps.into_iter().try_fold(Duration::zero(), |sum, (n, unit)| {
        let step = Duration::try_seconds(n.checked_mul(unit)?)?;
        sum.checked_add(&step)
    })
}

/// `P[nY][nM][nW][nD][T[nH][nM][nS]]`, with a year of 365 days and a month of 30.
fn iso_duration(token: &str) -> Option<Steps> {
    let body = token.strip_prefix('p')?;
    let (date_part, time_part) = match body.split_once('t') {
        Some((d, t)) if !t.is_empty() => (d, Some(t)),
        Some(_) => return None,
        None => (body, None),
    };
    let mut steps = Vec::new();
    for (n, unit) in split_components(date_part)? {
        let unit = match unit.as_str() {
            "y" => 365 * DAY,
            "m" => 30 * DAY,
            "w" => WEEK,
            "d" => DAY,
            _ => return None,
        };
        steps.push((n, unit));
    }
    for (n, unit) in split_components(time_part.unwrap_or(""))? {
        let unit = match unit.as_str() {
            "h" => HOUR,
            "m" => MINUTE,
            "s" => 1,
            _ => return None,
        };
        steps.push((n, unit));
    }
    (!steps.is_empty()).then_some(steps)
}

/// `2h30m`, `3d`, `45min`, `2 weeks`.
fn compound_duration(token: &str) -> Option<Steps> {
    let compact: String = token.chars().filter(|c| !c.is_whitespace()).collect();
    let components = split_components(&compact)?;
    if components.is_empty() {
        return None;
    }
    components
        .into_iter()
        .map(|(n, unit)| {
            let unit = match unit.as_str() {
                "s" | "sec" | "secs" | "second" | "seconds" => 1,
                "m" | "min" | "mins" | "minute" | "minutes" => MINUTE,
                "h" | "hr" | "hrs" | "hour" | "hours" => HOUR,
                "d" | "day" | "days" => DAY,
                "w" | "wk" | "wks" | "week" | "weeks" => WEEK,
                _ => return None,
            };
            Some((n, unit))
        })
        .collect()
}

/// Split `12h30m` into `[(12, "h"), (30, "m")]`. Every number needs a unit.
fn split_components(s: &str) -> Option<Vec<(i64, String)>> {
    let mut out = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return None;
        }
        let n: i64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let letters = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()).len();
        if letters == 0 {
            return None;
        }
        out.push((n, rest[..letters].to_owned()));
        rest = &rest[letters..];
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
