//! Per-group running statistics and their merge discipline.
//!
//! A [`Stats`] value is the unit of aggregation: one is derived from every
//! ingested record and folded into the counter table, and the table itself is
//! a map of these. Merge obeys the following laws, which the flush path
//! depends on for order-independence across batches and concurrent callers:
//!
//! * `count` and `sum` merges are associative and commutative.
//! * `max` and `min` merges converge to the true extremum regardless of
//!   merge order; merging a value with itself is a no-op.
//! * Absence propagates. A statistic that was never observed stays `None`
//!   through any number of merges with other absent values; it never
//!   collapses to zero.

use serde::{Deserialize, Serialize};

/// Running statistics for one group key within one scope.
///
/// `sum`, `max` and `min` are only ever `Some` once a record carrying a
/// parseable numeric value for the corresponding configured field has been
/// folded in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Number of records folded into this group.
    pub count: u64,
    /// Accumulated value of the configured average field, if any observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    /// Largest observed value of the configured max field, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Smallest observed value of the configured min field, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
}

impl Stats {
    /// Statistics for a single record.
    #[must_use]
    pub fn single(sum: Option<f64>, max: Option<f64>, min: Option<f64>) -> Self {
        Self {
            count: 1,
            sum,
            max,
            min,
        }
    }

    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: &Stats) {
        self.count += other.count;
        self.sum = match (self.sum, other.sum) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        };
        // Absent loses: an unobserved extremum places no constraint.
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Coerce a record value into an `f64` for max/min/avg tracking.
///
/// JSON numbers are used directly and strings are accepted when they parse as
/// a float. Anything else counts as "no value": treating garbage as `0.0`
/// would violate the absence-propagation rule.
#[must_use]
pub(crate) fn numeric(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
