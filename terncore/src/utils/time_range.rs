//! Time-range selectors: `[now(-24.5h)..now(6.75d)]`, `[now();9.4s]`.
//!
//! A range is two `now()`-relative bounds joined by `..`, or a start bound
//! plus a `;`-separated duration. The leading bracket sets the start
//! polarity (`[` inclusive, `]` exclusive); the trailing bracket mirrors it
//! for the end (`]` exclusive, `[` inclusive). Offsets take a unit suffix
//! among `u`, `ms`, `s`, `m`, `h`, `d`, `w`, defaulting to seconds.

use crate::error::{TernError, TernResult};

/// One bound of a time range, as a second offset relative to `now`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeBound {
    Unbounded,
    Inclusive(f64),
    Exclusive(f64),
}

impl TimeBound {
    fn with_polarity(offset: f64, inclusive: bool) -> Self {
        if inclusive {
            TimeBound::Inclusive(offset)
        } else {
            TimeBound::Exclusive(offset)
        }
    }

    pub fn offset(&self) -> Option<f64> {
        match self {
            TimeBound::Unbounded => None,
            TimeBound::Inclusive(o) | TimeBound::Exclusive(o) => Some(*o),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: TimeBound,
    pub end: TimeBound,
}

impl TimeRange {
    pub fn parse(s: &str) -> TernResult<Self> {
        parse(s).ok_or_else(|| TernError::InvalidArgument(format!("time range `{s}`")))
    }
}

fn parse(s: &str) -> Option<TimeRange> {
    let bytes = s.as_bytes();
    if bytes.len() < 2 {
        return None;
    }
    let start_inclusive = match bytes[0] {
        b'[' => true,
        b']' => false,
        _ => return None,
    };
    let end_inclusive = match bytes[bytes.len() - 1] {
        b']' => false,
        b'[' => true,
        _ => return None,
    };
    let inner = &s[1..s.len() - 1];

    if let Some((start, end)) = inner.split_once("..") {
        let start = parse_bound(start, start_inclusive)?;
        let end = parse_bound(end, end_inclusive)?;
        return Some(TimeRange { start, end });
    }

    // Duration form: a mandatory start bound plus a positive duration.
    let (start, duration) = inner.split_once(';')?;
    if start.is_empty() || duration.is_empty() {
        return None;
    }
    let start_offset = parse_now(start)?;
    let duration = parse_seconds(duration)?;
    if duration < 0.0 {
        return None;
    }
    Some(TimeRange {
        start: TimeBound::with_polarity(start_offset, start_inclusive),
        end: TimeBound::with_polarity(start_offset + duration, end_inclusive),
    })
}

fn parse_bound(s: &str, inclusive: bool) -> Option<TimeBound> {
    if s.is_empty() {
        return Some(TimeBound::Unbounded);
    }
    Some(TimeBound::with_polarity(parse_now(s)?, inclusive))
}

/// `now()` or `now(±offset[unit])`.
fn parse_now(s: &str) -> Option<f64> {
    let inner = s.strip_prefix("now(")?.strip_suffix(')')?;
    if inner.is_empty() {
        return Some(0.0);
    }
    parse_seconds(inner)
}

/// A float with an optional unit suffix, reduced to seconds.
fn parse_seconds(s: &str) -> Option<f64> {
    let (number, scale) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1e-3)
    } else if let Some(n) = s.strip_suffix('u') {
        (n, 1e-6)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60.0)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600.0)
    } else if let Some(n) = s.strip_suffix('d') {
        (n, 86_400.0)
    } else if let Some(n) = s.strip_suffix('w') {
        (n, 604_800.0)
    } else {
        (s, 1.0)
    };
    if number.is_empty() {
        return None;
    }
    number.parse::<f64>().ok().map(|v| v * scale)
}
