use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Half-open validity interval `[start, end)`; `end == None` is unbounded.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct Period {
    pub start: i64,
    pub end: Option<i64>,
}

impl Period {
    #[must_use]
    pub fn contains(&self, at_ms: i64) -> bool {
        at_ms >= self.start && self.end.map_or(true, |end| at_ms < end)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end.is_some_and(|end| end <= self.start)
    }
}

/// Inputs that bound a version's validity.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ValidityBounds {
    pub iat: i64,
    pub nbf: Option<i64>,
    pub exp: Option<i64>,
    pub dat: Option<i64>,
}

impl ValidityBounds {
    /// Read `nbf`/`exp` (integer milliseconds) from a meta object.
    #[must_use]
    pub fn from_meta(meta: &Value, iat: i64, dat: Option<i64>) -> Self {
        Self {
            iat,
            nbf: meta.get("nbf").and_then(Value::as_i64),
            exp: meta.get("exp").and_then(Value::as_i64),
            dat,
        }
    }
}

pub trait IntervalComputer: Send + Sync {
    fn period(&self, bounds: ValidityBounds) -> Period;
}

/// `[max(nbf, iat), min(dat, exp))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HalfOpenIntervals;

impl IntervalComputer for HalfOpenIntervals {
    fn period(&self, bounds: ValidityBounds) -> Period {
        let start = bounds.nbf.map_or(bounds.iat, |nbf| nbf.max(bounds.iat));
        let end = match (bounds.dat, bounds.exp) {
            (Some(dat), Some(exp)) => Some(dat.min(exp)),
            (Some(end), None) | (None, Some(end)) => Some(end),
            (None, None) => None,
        };
        Period { start, end }
    }
}
