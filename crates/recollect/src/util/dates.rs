//! Time-point parsing for generated queries
//!
//! The query generator describes when something happened with short strings
//! such as `#2w`, `2023-05`, `march` or `friday`. They are resolved against
//! the current UTC time to epoch seconds. Calendar dates resolve to midnight.

use chrono::{DateTime, Datelike, Duration, Month, NaiveDate, NaiveDateTime, Utc, Weekday};

const SECONDS_PER_DAY: i64 = 86_400;

const SEPARATORS: [char; 4] = [' ', '-', '/', '.'];

/// Resolve `input` relative to now. `None` when it cannot be resolved.
pub fn parse_time_point(input: &str) -> Option<i64> {
    parse_time_point_at(input, Utc::now())
}

/// Resolve `input` relative to `now`.
///
/// Relative forms: `N`, `Nd`, `Ndays` (days ago), `Nw`, `Nm` (30-day
/// months), `Ny` (365-day years), optionally prefixed with `#`. Without `#`
/// a bare one or two digit number is a day of the current month and a bare
/// four digit number is a year.
pub fn parse_time_point_at(input: &str, now: DateTime<Utc>) -> Option<i64> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unknown") {
        return None;
    }

    let (hashed, s) = match trimmed.strip_prefix('#') {
        Some(rest) => (true, rest.trim()),
        None => (false, trimmed),
    };

    if !hashed && s.chars().all(|c| c.is_ascii_digit()) {
        match s.len() {
            1 | 2 => {
                let day: u32 = s.parse().ok()?;
                return midnight(NaiveDate::from_ymd_opt(now.year(), now.month(), day)?);
            }
            4 => {
                let year: i32 = s.parse().ok()?;
                return midnight(NaiveDate::from_ymd_opt(year, 1, 1)?);
            }
            _ => {}
        }
    }

    relative(s, now).or_else(|| absolute(s, now))
}

fn relative(s: &str, now: DateTime<Utc>) -> Option<i64> {
    let lower = s.to_ascii_lowercase();
    let split = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    if split == 0 {
        return None;
    }

    let n: i64 = lower[..split].parse().ok()?;
    let days_per_unit = match lower[split..].trim() {
        "" | "d" | "day" | "days" => 1,
        "w" | "week" | "weeks" => 7,
        "m" | "month" | "months" => 30,
        "y" | "year" | "years" => 365,
        _ => return None,
    };

    // offsets past the i64 range resolve to nothing
    let seconds = n.checked_mul(days_per_unit)?.checked_mul(SECONDS_PER_DAY)?;
    now.timestamp().checked_sub(seconds)
}

fn absolute(s: &str, now: DateTime<Utc>) -> Option<i64> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%d-%m-%Y") {
        return midnight(date);
    }

    for sep in SEPARATORS {
        for fmt in [
            format!("%Y{sep}%m{sep}%d %H:%M:%S"),
            format!("%Y{sep}%m{sep}%d %H:%M"),
        ] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, &fmt) {
                return Some(dt.and_utc().timestamp());
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, &format!("%Y{sep}%m{sep}%d")) {
            return midnight(date);
        }
        if let Some((year, month)) = s.split_once(sep) {
            if year.len() == 4 {
                if let (Ok(year), Ok(month)) = (year.parse::<i32>(), month.parse::<u32>()) {
                    return midnight(NaiveDate::from_ymd_opt(year, month, 1)?);
                }
            }
        }
    }

    // DD-MM in the current year
    if let Some((day, month)) = s.split_once('-') {
        if let (Ok(day), Ok(month)) = (day.parse::<u32>(), month.parse::<u32>()) {
            return midnight(NaiveDate::from_ymd_opt(now.year(), month, day)?);
        }
    }

    if let Ok(month) = s.parse::<Month>() {
        return midnight(NaiveDate::from_ymd_opt(now.year(), month.number_from_month(), 1)?);
    }

    if let Ok(weekday) = s.parse::<Weekday>() {
        let today = now.date_naive();
        let monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
        return midnight(monday + Duration::days(weekday.num_days_from_monday() as i64));
    }

    None
}

fn midnight(date: NaiveDate) -> Option<i64> {
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}
