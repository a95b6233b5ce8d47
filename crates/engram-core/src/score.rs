use time::OffsetDateTime;

use crate::{scoring_confidence, CategoryWeights, MemoryRecord};

pub const WEIGHT_FACTOR: f64 = 0.6;
pub const RECENCY_FACTOR: f64 = 0.3;
pub const CONFIDENCE_FACTOR: f64 = 0.1;

const SECONDS_PER_HOUR: f64 = 3600.0;
const HOURS_PER_DAY: f64 = 24.0;

/// Smooth decay in `(0, 1]`: `1 / (1 + age_hours / 24)`. Future timestamps count as age zero.
#[must_use]
pub fn recency(updated_at: OffsetDateTime, now: OffsetDateTime) -> f64 {
    let age_hours = ((now - updated_at).as_seconds_f64() / SECONDS_PER_HOUR).max(0.0);
    1.0 / (1.0 + age_hours / HOURS_PER_DAY)
}

/// Relevance of a record at `now`: `0.6 * weight + 0.3 * recency + 0.1 * confidence`.
#[must_use]
pub fn score_memory(record: &MemoryRecord, now: OffsetDateTime, weights: &CategoryWeights) -> f64 {
    weights.resolve(record) * WEIGHT_FACTOR
        + recency(record.updated_at, now) * RECENCY_FACTOR
        + scoring_confidence(record.confidence) * CONFIDENCE_FACTOR
}
