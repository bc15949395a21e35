//! Wall-clock and timing functions.
//!
//! - `time.now()`: seconds since the Unix epoch, with sub-second precision
//! - `time.parse(iso)`: ISO 8601 text to epoch seconds, `nil` when unparsable
//! - `time.format(seconds [, pattern])`: epoch seconds to UTC text
//! - `time.clock()`: monotonic milliseconds since the library was loaded
//! - `time.sleep(ms)`: pause and return the milliseconds actually elapsed
//!
//! In async mode `sleep` called inside a coroutine yields the requested
//! milliseconds to the host instead of blocking; the host resumes the
//! coroutine with the elapsed milliseconds, which become `sleep`'s result.

use std::fmt::Write;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use luau_bridge::{Error, Frame, Outcome, Result, StackOps};
use once_cell::sync::Lazy;

use crate::{Export, Library, bad_argument};

static CLOCK_START: Lazy<Instant> = Lazy::new(Instant::now);

#[derive(Debug)]
pub struct TimeLibrary {
    async_sleep: bool,
}

impl Default for TimeLibrary {
    fn default() -> Self {
        Self::new(false)
    }
}

impl TimeLibrary {
    pub fn new(async_sleep: bool) -> Self {
        Lazy::force(&CLOCK_START);
        Self { async_sleep }
    }
}

impl Library for TimeLibrary {
    fn name(&self) -> &str {
        "time"
    }

    fn description(&self) -> &str {
        "Wall-clock time, ISO 8601 parsing and sleeping"
    }

    fn exports(&self) -> Vec<Export> {
        let async_sleep = self.async_sleep;
        vec![
            Export::new("now", time_now),
            Export::new("parse", time_parse),
            Export::new("format", time_format),
            Export::new("clock", time_clock),
            Export::new("sleep", move |frame: &Frame| time_sleep(frame, async_sleep)),
        ]
    }
}

fn time_now(frame: &Frame) -> Result<Outcome> {
    let now = Utc::now();
    frame.push_number(now.timestamp_millis() as f64 / 1000.0);
    Ok(Outcome::returns(1))
}

fn time_parse(frame: &Frame) -> Result<Outcome> {
    match frame.to_string(1).as_deref().and_then(parse_iso8601) {
        Some(seconds) => frame.push_number(seconds),
        None => frame.push_nil(),
    }
    Ok(Outcome::returns(1))
}

fn time_format(frame: &Frame) -> Result<Outcome> {
    if !frame.is_number(1) {
        return Err(bad_argument(1, "format", "number", frame));
    }
    let millis = (frame.to_number(1) * 1000.0).round() as i64;
    let Some(at) = DateTime::<Utc>::from_timestamp_millis(millis) else {
        frame.push_nil();
        return Ok(Outcome::returns(1));
    };
    let text = match frame.to_string(2) {
        Some(pattern) => {
            let mut out = String::new();
            if write!(out, "{}", at.format(&pattern)).is_err() {
                return Err(Error::runtime(format!("time.format: invalid pattern '{pattern}'")));
            }
            out
        }
        None => at.to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    frame.push_string(&text);
    Ok(Outcome::returns(1))
}

fn time_clock(frame: &Frame) -> Result<Outcome> {
    frame.push_number(CLOCK_START.elapsed().as_secs_f64() * 1000.0);
    Ok(Outcome::returns(1))
}

fn time_sleep(frame: &Frame, async_sleep: bool) -> Result<Outcome> {
    if !frame.is_number(1) {
        return Err(bad_argument(1, "sleep", "number", frame));
    }
    let ms = frame.to_number(1).max(0.0);
    let Ok(delay) = Duration::try_from_secs_f64(ms / 1000.0) else {
        return Err(bad_argument(1, "sleep", "duration in milliseconds", frame));
    };
    if async_sleep && frame.is_yieldable() {
        frame.set_top(0);
        frame.push_number(ms);
        return frame.yield_values(1);
    }

    let started = Instant::now();
    std::thread::sleep(delay);
    frame.push_number(started.elapsed().as_secs_f64() * 1000.0);
    Ok(Outcome::returns(1))
}

/// Epoch seconds for RFC 3339 text, a naive date-time (taken as UTC) or a
/// bare date (midnight UTC).
pub fn parse_iso8601(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.timestamp_millis() as f64 / 1000.0);
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(text, pattern) {
            return Some(at.and_utc().timestamp_millis() as f64 / 1000.0);
        }
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp() as f64)
}
