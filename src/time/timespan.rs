//! Half-open time intervals.

use super::AstroTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A half-open interval `[begin, end)`.
///
/// `None` bounds are unbounded. Any interval with `begin >= end` is empty and
/// is normalised on construction so that all empty timespans compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawTimespan")]
pub struct Timespan {
    begin: Option<AstroTime>,
    end: Option<AstroTime>,
}

/// Wire form of [`Timespan`]; decoding goes through `Timespan::new`.
#[derive(Deserialize)]
struct RawTimespan {
    begin: Option<AstroTime>,
    end: Option<AstroTime>,
}

impl From<RawTimespan> for Timespan {
    fn from(raw: RawTimespan) -> Self {
        Timespan::new(raw.begin, raw.end)
    }
}

impl Timespan {
    pub fn new(begin: Option<AstroTime>, end: Option<AstroTime>) -> Self {
        match (begin, end) {
            (Some(b), Some(e)) if b >= e => Self::empty(),
            _ => Self { begin, end },
        }
    }

    pub fn empty() -> Self {
        Self {
            begin: Some(AstroTime::MAX),
            end: Some(AstroTime::MIN),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            begin: None,
            end: None,
        }
    }

    /// A timespan containing exactly one nanosecond tick. The end is
    /// clamped to [`AstroTime::MAX`].
    pub fn from_instant(time: AstroTime) -> Self {
        let end = AstroTime {
            tai_nsec: time.tai_nsec().saturating_add(1).min(AstroTime::MAX.tai_nsec()),
        };
        Self::new(Some(time), Some(end))
    }

    pub fn begin(&self) -> Option<AstroTime> {
        if self.is_empty() { None } else { self.begin }
    }

    pub fn end(&self) -> Option<AstroTime> {
        if self.is_empty() { None } else { self.end }
    }

    pub fn is_empty(&self) -> bool {
        matches!((self.begin, self.end), (Some(b), Some(e)) if b >= e)
    }

    /// Lower bound as TAI nanoseconds, `i64::MIN` when unbounded.
    pub(crate) fn begin_nsec(&self) -> i64 {
        self.begin.map_or(i64::MIN, |t| t.tai_nsec())
    }

    /// Upper bound as TAI nanoseconds, `i64::MAX` when unbounded.
    pub(crate) fn end_nsec(&self) -> i64 {
        self.end.map_or(i64::MAX, |t| t.tai_nsec())
    }

    pub fn overlaps(&self, other: &Timespan) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.begin_nsec() < other.end_nsec() && other.begin_nsec() < self.end_nsec()
    }

    pub fn contains(&self, time: AstroTime) -> bool {
        !self.is_empty()
            && self.begin_nsec() <= time.tai_nsec()
            && time.tai_nsec() < self.end_nsec()
    }

    /// True if `other` lies entirely within `self`. Empty timespans are
    /// contained by everything.
    pub fn contains_span(&self, other: &Timespan) -> bool {
        if other.is_empty() {
            return true;
        }
        !self.is_empty()
            && self.begin_nsec() <= other.begin_nsec()
            && other.end_nsec() <= self.end_nsec()
    }

    pub fn intersection(&self, other: &Timespan) -> Timespan {
        if !self.overlaps(other) {
            return Self::empty();
        }
        let begin = match (self.begin, other.begin) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self::new(begin, end)
    }

    /// The parts of `self` not covered by `other`, in order.
    pub fn difference(&self, other: &Timespan) -> Vec<Timespan> {
        if !self.overlaps(other) {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        }
        let mut pieces = Vec::with_capacity(2);
        if self.begin_nsec() < other.begin_nsec() {
            pieces.push(Self::new(self.begin, other.begin));
        }
        if other.end_nsec() < self.end_nsec() {
            pieces.push(Self::new(other.end, self.end));
        }
        pieces
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(empty)");
        }
        let begin = self.begin.map_or_else(|| "-∞".to_string(), |t| t.to_string());
        let end = self.end.map_or_else(|| "∞".to_string(), |t| t.to_string());
        write!(f, "[{}, {})", begin, end)
    }
}
