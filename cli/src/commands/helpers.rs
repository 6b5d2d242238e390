use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

use heft_core::models::{Gender, WeightUnit};

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            "tomorrow" => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

/// Parse `HH:MM` (24-hour).
pub(crate) fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("Invalid time '{s}'. Use HH:MM (24-hour)"))
}

fn local_to_utc(date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>> {
    match Local.from_local_datetime(&date.and_time(time)) {
        LocalResult::Single(ts) | LocalResult::Ambiguous(ts, _) => Ok(ts.with_timezone(&Utc)),
        LocalResult::None => bail!("{date} {time} does not exist in the local time zone"),
    }
}

/// Build a timestamp from optional date and time arguments, in local time.
/// A missing time keeps the current time of day; both missing means now.
pub(crate) fn parse_recorded_at(
    date: Option<String>,
    time: Option<String>,
) -> Result<DateTime<Utc>> {
    if date.is_none() && time.is_none() {
        return Ok(Utc::now());
    }
    let date = parse_date(date)?;
    let time = match time {
        Some(t) => parse_time(&t)?,
        None => Local::now().time().with_nanosecond(0).unwrap_or_default(),
    };
    local_to_utc(date, time)
}

/// Replace the date and/or time of an existing timestamp, keeping whichever
/// part was not given.
pub(crate) fn adjust_recorded_at(
    current: DateTime<Utc>,
    date: Option<String>,
    time: Option<String>,
) -> Result<Option<DateTime<Utc>>> {
    if date.is_none() && time.is_none() {
        return Ok(None);
    }
    let local = current.with_timezone(&Local);
    let date = match date {
        Some(d) => parse_date(Some(d))?,
        None => local.date_naive(),
    };
    let time = match time {
        Some(t) => parse_time(&t)?,
        None => local.time(),
    };
    local_to_utc(date, time).map(Some)
}

pub(crate) fn parse_unit(s: &str) -> Result<WeightUnit> {
    WeightUnit::parse(s).with_context(|| format!("Invalid unit '{s}'. Use 'kg' or 'lb'"))
}

pub(crate) fn parse_gender(s: &str) -> Result<Gender> {
    Gender::parse(s)
        .with_context(|| format!("Invalid gender '{s}'. Use female, male, other or unspecified"))
}

pub(crate) fn fmt_local(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

pub(crate) fn fmt_optional(ts: Option<&DateTime<Utc>>) -> String {
    ts.map_or_else(|| "never".to_string(), fmt_local)
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn fmt_weight(value: f64, unit: WeightUnit) -> String {
    format!("{:.1} {}", no_neg_zero(value), unit.as_str())
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_none() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(None).unwrap(), today);
    }

    #[test]
    fn test_parse_date_keywords() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(Some("today".to_string())).unwrap(), today);
        assert_eq!(
            parse_date(Some("yesterday".to_string())).unwrap(),
            today - chrono::Duration::days(1)
        );
        assert_eq!(
            parse_date(Some("tomorrow".to_string())).unwrap(),
            today + chrono::Duration::days(1)
        );
    }

    #[test]
    fn test_parse_date_iso() {
        let date = parse_date(Some("2024-01-15".to_string())).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
    }

    #[test]
    fn test_parse_date_invalid() {
        assert!(parse_date(Some("nope".to_string())).is_err());
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("07:30").unwrap(), NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert!(parse_time("7am").is_err());
        assert!(parse_time("25:00").is_err());
    }

    #[test]
    fn test_parse_recorded_at_uses_local_date_and_time() {
        let ts =
            parse_recorded_at(Some("2024-03-10".to_string()), Some("12:15".to_string())).unwrap();
        let local = ts.with_timezone(&Local);
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(local.time(), NaiveTime::from_hms_opt(12, 15, 0).unwrap());
    }

    #[test]
    fn test_adjust_recorded_at_keeps_other_part() {
        let original =
            parse_recorded_at(Some("2024-03-10".to_string()), Some("12:15".to_string())).unwrap();
        assert!(adjust_recorded_at(original, None, None).unwrap().is_none());

        let moved = adjust_recorded_at(original, Some("2024-03-12".to_string()), None)
            .unwrap()
            .unwrap()
            .with_timezone(&Local);
        assert_eq!(moved.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 12).unwrap());
        assert_eq!(moved.time(), NaiveTime::from_hms_opt(12, 15, 0).unwrap());

        let retimed = adjust_recorded_at(original, None, Some("06:00".to_string()))
            .unwrap()
            .unwrap()
            .with_timezone(&Local);
        assert_eq!(retimed.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(retimed.time(), NaiveTime::from_hms_opt(6, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_unit() {
        assert_eq!(parse_unit("KG").unwrap(), WeightUnit::Kilograms);
        assert_eq!(parse_unit("lbs").unwrap(), WeightUnit::Pounds);
        assert!(parse_unit("stone").is_err());
    }

    #[test]
    fn test_parse_gender() {
        assert_eq!(parse_gender("Female").unwrap(), Gender::Female);
        assert!(parse_gender("robot").is_err());
    }

    #[test]
    fn test_fmt_weight() {
        assert_eq!(fmt_weight(81.26, WeightUnit::Kilograms), "81.3 kg");
        assert_eq!(fmt_weight(-0.0, WeightUnit::Pounds), "0.0 lb");
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world this is long", 10), "hello w...");
        assert_eq!(truncate("Crème fraîche", 10), "Crème f...");
    }
}
