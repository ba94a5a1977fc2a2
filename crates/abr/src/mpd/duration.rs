use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;

use crate::{
    error::{PlayerError, PlayerResult},
    time::{TimeValue, HNS_PER_SECOND},
};

// xs:duration, e.g. "PT1H2M3.5S" or "P1DT12H". Years and months use 365 and 30 days.
static DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(-)?P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)(?:\.(\d+))?S)?)?$",
    )
    .unwrap()
});

pub fn parse_duration(s: &str) -> PlayerResult<TimeValue> {
    let s = s.trim();
    if s == "INF" {
        return Ok(TimeValue::positive_infinity());
    }
    let caps = DURATION_REGEX
        .captures(s)
        .filter(|_| s != "P" && !s.ends_with('T'))
        .ok_or_else(|| PlayerError::MpdParsing(format!("Invalid duration: {s}")))?;

    let number = |index: usize| -> i64 {
        caps.get(index)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(0)
    };
    let days = number(2) * 365 + number(3) * 30 + number(4) * 7 + number(5);
    let seconds = days * 86400 + number(6) * 3600 + number(7) * 60 + number(8);

    let mut hns = seconds.saturating_mul(HNS_PER_SECOND);
    if let Some(fraction) = caps.get(9) {
        // Only 7 digits are significant at 100ns resolution.
        let digits: String = fraction.as_str().chars().take(7).collect();
        let scale = 10i64.pow(7 - digits.len() as u32);
        hns += digits.parse::<i64>().unwrap_or(0) * scale;
    }
    if caps.get(1).is_some() {
        hns = -hns;
    }
    Ok(TimeValue::from_hns(hns))
}

/// Parses an xs:dateTime. Values without a timezone are taken as UTC.
pub fn parse_datetime(s: &str) -> PlayerResult<TimeValue> {
    let s = s.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(s) {
        return Ok(TimeValue::from_datetime(time.with_timezone(&Utc)));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| PlayerError::DateTimeParsing(format!("{s}: {e}")))?;
    Ok(TimeValue::from_datetime(naive.and_utc()))
}
