use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    error::{PlayerError, PlayerResult},
    http::{fetch_blocking, HttpMethod, HttpRequest, HttpTransport},
    time::TimeValue,
};

/// A `<UTCTiming>` element of the MPD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtcTiming {
    pub scheme_id_uri: String,
    pub value: Option<String>,
}

/// Wallclock of the session, synchronized to the server time.
#[derive(Debug, Default)]
pub struct SynchronizedUtcClock {
    /// How much time the local clock is behind the remote clock
    offset: Mutex<TimeDelta>,
}

impl SynchronizedUtcClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.offset.lock().unwrap()
    }

    pub fn now_time(&self) -> TimeValue {
        TimeValue::from_datetime(self.now())
    }

    pub fn offset(&self) -> TimeDelta {
        *self.offset.lock().unwrap()
    }

    /// Moves the clock by `delta`. Used by tests and to apply a manual correction.
    pub fn adjust(&self, delta: TimeDelta) {
        *self.offset.lock().unwrap() += delta;
    }

    pub fn set_time(
        &self,
        remote_now: DateTime<Utc>,
        before_request: DateTime<Utc>,
        after_request: DateTime<Utc>,
    ) {
        // The server stamped its time roughly in the middle of the round trip.
        let half_rtt = (after_request - before_request) / 2;
        let server_now = remote_now + half_rtt;
        let offset = server_now - after_request;
        *self.offset.lock().unwrap() = offset;
        tracing::debug!(offset_milliseconds = %offset.num_milliseconds(), "Clock time set to {}, offset calculated", remote_now);
    }

    /// Resynchronizes from an HTTP `Date` response header.
    pub fn sync_from_date_header(
        &self,
        date: &str,
        before_request: DateTime<Utc>,
        after_request: DateTime<Utc>,
    ) -> PlayerResult<()> {
        let remote = DateTime::parse_from_rfc2822(date.trim())
            .map_err(|e| PlayerError::DateTimeParsing(format!("{date}: {e}")))?;
        self.set_time(remote.with_timezone(&Utc), before_request, after_request);
        Ok(())
    }

    /// Tries the `<UTCTiming>` elements in document order until one succeeds.
    pub fn sync_from_utc_timing(
        &self,
        timings: &[UtcTiming],
        transport: &dyn HttpTransport,
    ) -> PlayerResult<()> {
        let mut last_error = None;
        for timing in timings {
            match self.sync_with(timing, transport) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(scheme = %timing.scheme_id_uri, error = %e, "Time synchronization failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn sync_with(&self, timing: &UtcTiming, transport: &dyn HttpTransport) -> PlayerResult<()> {
        let value = timing.value.as_deref().ok_or_else(|| {
            PlayerError::InvalidTimingSchema(format!("Missing value for {}", timing.scheme_id_uri))
        })?;
        match timing.scheme_id_uri.as_str() {
            "urn:mpeg:dash:utc:direct:2014" => {
                let now = Utc::now();
                self.set_time(parse_iso8601(value)?, now, now);
                Ok(())
            }
            "urn:mpeg:dash:utc:http-xsdate:2014" | "urn:mpeg:dash:utc:http-iso:2014" => {
                let before = Utc::now();
                let response = fetch_blocking(transport, HttpRequest::get(value));
                let after = Utc::now();
                if !response.is_success() {
                    return Err(response.to_error());
                }
                let text = String::from_utf8_lossy(&response.body);
                self.set_time(parse_iso8601(text.trim())?, before, after);
                Ok(())
            }
            "urn:mpeg:dash:utc:http-head:2014" => {
                let before = Utc::now();
                let mut request = HttpRequest::get(value);
                request.method = HttpMethod::Head;
                let response = fetch_blocking(transport, request);
                let after = Utc::now();
                if !response.is_success() {
                    return Err(response.to_error());
                }
                let date = response
                    .header("date")
                    .ok_or_else(|| PlayerError::DateTimeParsing("Missing Date header".into()))?;
                self.sync_from_date_header(date, before, after)
            }
            others => Err(PlayerError::InvalidTimingSchema(others.to_string())),
        }
    }
}

fn parse_iso8601(text: &str) -> PlayerResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // xsdate without a zone designator is UTC
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.and_utc())
        })?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_from_date_header() {
        let clock = SynchronizedUtcClock::new();
        let now = Utc::now();
        let remote = now + TimeDelta::seconds(3600);
        clock
            .sync_from_date_header(&remote.to_rfc2822(), now, now)
            .unwrap();
        let offset = clock.offset().num_seconds();
        assert!((3598..=3600).contains(&offset));
    }

    #[test]
    fn test_parse_iso8601() {
        let dt = parse_iso8601("2024-03-01T10:00:00Z").unwrap();
        assert_eq!(dt.timestamp(), 1709287200);
        let dt = parse_iso8601("2024-03-01T10:00:00.500").unwrap();
        assert_eq!(dt.timestamp_millis(), 1709287200500);
    }
}
