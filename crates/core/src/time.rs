use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{FlowscopeError, Result};

/// Source of "now" for anything that schedules against wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn parse_time_or_relative(input: &str) -> Result<DateTime<Utc>> {
    parse_time_or_relative_at(input, Utc::now())
}

/// Accepts RFC3339, epoch milliseconds, or a duration relative to `now`
/// (`15m` means fifteen minutes before `now`).
pub fn parse_time_or_relative_at(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }

    if let Ok(millis) = input.parse::<i64>() {
        if millis < 0 {
            return Err(FlowscopeError::InvalidArgument(format!(
                "negative timestamp: {input}"
            )));
        }
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| FlowscopeError::InvalidArgument(format!("timestamp out of range: {input}")));
    }

    if let Ok(duration) = humantime::parse_duration(input) {
        return Ok(now
            - chrono::Duration::from_std(duration).map_err(|e| {
                FlowscopeError::Parse(format!("failed to parse duration to chrono: {e}"))
            })?);
    }

    Err(FlowscopeError::Parse(format!(
        "expected RFC3339 time, epoch millis or duration, got {input}"
    )))
}

pub fn nanos_to_dt(nanos: u64) -> Option<DateTime<Utc>> {
    let secs = (nanos / 1_000_000_000) as i64;
    let subnanos = (nanos % 1_000_000_000) as u32;
    Utc.timestamp_opt(secs, subnanos).single()
}

pub fn dt_to_nanos(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_nanos_opt().unwrap_or_default().max(0) as u64
}

pub fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| FlowscopeError::Internal(format!("duration conversion failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339() {
        let ts = parse_time_or_relative("2026-01-01T00:00:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn parses_duration_relative_to_now() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        let ts = parse_time_or_relative_at("5m", now).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 2, 1, 11, 55, 0).unwrap());
    }

    #[test]
    fn parses_epoch_millis() {
        let ts = parse_time_or_relative("1767225600000").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn rejects_negative_and_invalid() {
        assert!(matches!(
            parse_time_or_relative("-5"),
            Err(FlowscopeError::InvalidArgument(_))
        ));
        assert!(parse_time_or_relative("nope").is_err());
    }

    #[test]
    fn nanos_round_trip_keeps_precision() {
        let nanos = 1_700_000_000_123_456_789;
        let ts = nanos_to_dt(nanos).unwrap();
        assert_eq!(dt_to_nanos(ts), nanos);
    }
}
