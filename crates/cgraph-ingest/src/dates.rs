//! Best-effort normalization of the date shapes found in contact exports.
//!
//! Detectors run in a fixed order, explicit shapes first. Anything that no
//! detector accepts becomes the current instant, flagged as unparsed.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use cgraph_core::NormalizedDate;

type Detector = fn(&str) -> Option<DateTime<Utc>>;

const DETECTORS: [(&str, Detector); 5] = [
    ("short_year_slash_clock", short_year_slash_clock),
    ("slash_month_day_year", slash_month_day_year),
    ("day_month_year", day_month_year),
    ("iso_like", iso_like),
    ("generic", generic),
];

pub fn normalize_date(raw: &str) -> NormalizedDate {
    normalize_date_with_now(raw, Utc::now())
}

pub fn normalize_date_with_now(raw: &str, now: DateTime<Utc>) -> NormalizedDate {
    let value = raw.trim();
    if value.is_empty() {
        return NormalizedDate::fallback(now);
    }
    for (name, detect) in DETECTORS {
        if let Some(instant) = detect(value) {
            tracing::trace!(shape = name, value, "date normalized");
            return NormalizedDate::parsed(instant);
        }
    }
    tracing::debug!(value, "unrecognized date; using current instant");
    NormalizedDate::fallback(now)
}

/// Normalize an optional column value; absent values stay absent.
pub fn normalize_optional(raw: Option<&str>) -> Option<NormalizedDate> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(normalize_date)
}

fn naive_utc(value: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(value, Utc)
}

fn parse_with(value: &str, formats: &[&str]) -> Option<DateTime<Utc>> {
    formats
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
        .map(naive_utc)
}

fn parse_date_with(value: &str, formats: &[&str]) -> Option<DateTime<Utc>> {
    formats
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(value, f).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(naive_utc)
}

/// Year component length of an `m/d/y...` value, if it has that shape.
fn slash_year_len(value: &str) -> Option<usize> {
    let date_part = value.split([',', ' ']).next()?;
    let parts = date_part.split('/').collect::<Vec<_>>();
    if parts.len() != 3 || !parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    Some(parts[2].len())
}

// `10/15/23, 3:45 PM`
fn short_year_slash_clock(value: &str) -> Option<DateTime<Utc>> {
    if slash_year_len(value)? != 2 {
        return None;
    }
    parse_with(value, &["%m/%d/%y, %I:%M %p", "%m/%d/%y %I:%M %p", "%m/%d/%y, %I:%M:%S %p"])
}

// `3/15/2023`, optionally with a clock time
fn slash_month_day_year(value: &str) -> Option<DateTime<Utc>> {
    if slash_year_len(value)? != 4 {
        return None;
    }
    parse_with(
        value,
        &[
            "%m/%d/%Y, %I:%M %p",
            "%m/%d/%Y %I:%M %p",
            "%m/%d/%Y, %H:%M",
            "%m/%d/%Y %H:%M",
            "%m/%d/%Y %H:%M:%S",
        ],
    )
    .or_else(|| parse_date_with(value, &["%m/%d/%Y"]))
}

// `15 Mar 2023`
fn day_month_year(value: &str) -> Option<DateTime<Utc>> {
    parse_date_with(value, &["%d %b %Y", "%d %B %Y"])
}

// `2023-10-15 14:03:22 UTC`, `2023-10-15T14:03:22Z`
fn iso_like(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    parse_with(
        value,
        &[
            "%Y-%m-%d %H:%M:%S UTC",
            "%Y-%m-%d %H:%M:%S",
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%d %H:%M",
        ],
    )
}

fn generic(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    parse_date_with(
        value,
        &["%Y-%m-%d", "%Y/%m/%d", "%B %d, %Y", "%b %d, %Y", "%m/%d/%y"],
    )
}
