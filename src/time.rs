use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Unix milliseconds, UTC. The only time type the engine stores.
pub type Ms = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but for untrusted input.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Single source of "now" for the engine. Never read the wall clock ad hoc.
pub trait Clock: Send + Sync {
    fn now(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Ms {
        Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for deterministic expiry tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Ms) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, t: Ms) {
        self.now.store(t, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

// ── Client-facing time zones ─────────────────────────────────────

const MIN_OFFSET_MINUTES: i32 = -12 * 60;
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

/// A client's fixed UTC offset, in minutes east of UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtcOffset(i32);

impl UtcOffset {
    pub const UTC: UtcOffset = UtcOffset(0);

    pub fn from_minutes(minutes: i32) -> Option<Self> {
        (MIN_OFFSET_MINUTES..=MAX_OFFSET_MINUTES)
            .contains(&minutes)
            .then_some(Self(minutes))
    }

    /// Parse `"UTC+4"`, `"GMT-5:30"`, `"utc+0"`. A sign is mandatory.
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim().to_ascii_uppercase();
        let rest = s.strip_prefix("UTC").or_else(|| s.strip_prefix("GMT"))?;
        let (sign, rest) = match rest.as_bytes().first()? {
            b'+' => (1, &rest[1..]),
            b'-' => (-1, &rest[1..]),
            _ => return None,
        };
        let (hours, minutes) = match rest.split_once(':') {
            Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
            None => (rest.parse::<i32>().ok()?, 0),
        };
        if !(0..60).contains(&minutes) || !(0..=14).contains(&hours) {
            return None;
        }
        Self::from_minutes(sign * (hours * 60 + minutes))
    }

    pub fn minutes(&self) -> i32 {
        self.0
    }

    fn fixed(&self) -> FixedOffset {
        // Range-checked at construction, so this cannot fail.
        FixedOffset::east_opt(self.0 * 60).unwrap_or_else(|| Utc.fix())
    }

    pub fn to_local(&self, t: Ms) -> Option<DateTime<FixedOffset>> {
        DateTime::from_timestamp_millis(t).map(|utc| utc.with_timezone(&self.fixed()))
    }

    /// Interpret a wall-clock time entered by the client.
    pub fn resolve_local(&self, local: NaiveDateTime) -> Option<Ms> {
        self.fixed()
            .from_local_datetime(&local)
            .single()
            .map(|dt| dt.timestamp_millis())
    }

    /// `"Jun 01, 10:00-11:00"` in this offset.
    pub fn format_span(&self, span: &Span) -> Option<String> {
        let start = self.to_local(span.start)?;
        let end = self.to_local(span.end)?;
        Some(format!(
            "{}, {}-{}",
            start.format("%b %d"),
            start.format("%H:%M"),
            end.format("%H:%M")
        ))
    }
}

impl std::fmt::Display for UtcOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { '-' } else { '+' };
        let abs = self.0.abs();
        if abs % 60 == 0 {
            write!(f, "UTC{sign}{}", abs / 60)
        } else {
            write!(f, "UTC{sign}{}:{:02}", abs / 60, abs % 60)
        }
    }
}
