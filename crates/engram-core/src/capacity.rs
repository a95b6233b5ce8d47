use std::cmp::Ordering;

use time::OffsetDateTime;

use crate::{score_memory, Category, CategoryCaps, CategoryWeights, MemoryRecord};

#[derive(Debug, Clone)]
struct ScoredRecord {
    score: f64,
    record: MemoryRecord,
}

impl ScoredRecord {
    /// Descending by score. Sorting is stable, so ties keep their prior order.
    fn by_score_desc(lhs: &Self, rhs: &Self) -> Ordering {
        rhs.score.total_cmp(&lhs.score)
    }
}

/// Trim a reconciled record set to the category caps and then to `max_memories`.
///
/// Phase one keeps the top `cap` records of each category by score and concatenates the
/// groups in canonical order. If that still exceeds `max_memories` (only possible when
/// overrides push the cap total over budget), phase two re-sorts everything by score and
/// keeps the top `max_memories`, dropping the category grouping.
#[must_use]
pub fn enforce_capacity(
    records: Vec<MemoryRecord>,
    max_memories: usize,
    caps: &CategoryCaps,
    now: OffsetDateTime,
    weights: &CategoryWeights,
) -> Vec<MemoryRecord> {
    let mut grouped: [Vec<ScoredRecord>; 5] = Default::default();
    for record in records {
        let score = score_memory(&record, now, weights);
        grouped[record.category.index()].push(ScoredRecord { score, record });
    }

    let mut trimmed = Vec::new();
    for category in Category::ALL {
        let mut group = std::mem::take(&mut grouped[category.index()]);
        group.sort_by(ScoredRecord::by_score_desc);
        group.truncate(caps.get(category));
        trimmed.append(&mut group);
    }

    if trimmed.len() > max_memories {
        trimmed.sort_by(ScoredRecord::by_score_desc);
        trimmed.truncate(max_memories);
    }

    trimmed.into_iter().map(|scored| scored.record).collect()
}
