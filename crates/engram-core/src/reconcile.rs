use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{comparison_confidence, CategoryWeights, MemoryCandidate, MemoryRecord};

/// What happened to a single candidate during reconciliation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// No record matched; a new one was appended.
    Created,
    /// The candidate was at least as confident and replaced the matched content.
    Replaced,
    /// The candidate was less confident; only `updated_at` advanced.
    Reaffirmed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileSummary {
    pub created: usize,
    pub replaced: usize,
    pub reaffirmed: usize,
}

impl ReconcileSummary {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Created => self.created += 1,
            Disposition::Replaced => self.replaced += 1,
            Disposition::Reaffirmed => self.reaffirmed += 1,
        }
    }
}

/// Position of the first record with the candidate's category and exactly equal content.
///
/// Later duplicates are never considered.
#[must_use]
pub fn find_match(records: &[MemoryRecord], candidate: &MemoryCandidate) -> Option<usize> {
    records
        .iter()
        .position(|record| {
            record.category == candidate.category && record.content == candidate.content
        })
}

/// Apply one candidate to the working set, creating or updating a record.
pub fn apply_candidate(
    records: &mut Vec<MemoryRecord>,
    candidate: &MemoryCandidate,
    now: OffsetDateTime,
    weights: &CategoryWeights,
) -> Disposition {
    let Some(index) = find_match(records, candidate) else {
        records.push(MemoryRecord::from_candidate(candidate, now, weights));
        return Disposition::Created;
    };

    let current = &mut records[index];
    // updated_at never moves backwards, even when the caller's clock trails the record.
    current.updated_at = current.updated_at.max(now);

    // NaN on either side never replaces.
    let replaces =
        comparison_confidence(candidate.confidence) >= comparison_confidence(current.confidence);
    if !replaces {
        return Disposition::Reaffirmed;
    }

    current.content.clone_from(&candidate.content);
    current.rationale = Some(candidate.rationale.clone());
    current.confidence = candidate.confidence;
    current.weight = Some(current.weight.unwrap_or_else(|| weights.get(candidate.category)));
    Disposition::Replaced
}

/// Fold candidates into the working set in input order. Later candidates see records
/// created or updated by earlier ones.
pub fn reconcile(
    records: &mut Vec<MemoryRecord>,
    candidates: &[MemoryCandidate],
    now: OffsetDateTime,
    weights: &CategoryWeights,
) -> ReconcileSummary {
    let mut summary = ReconcileSummary::default();
    for candidate in candidates {
        summary.record(apply_candidate(records, candidate, now, weights));
    }
    summary
}
