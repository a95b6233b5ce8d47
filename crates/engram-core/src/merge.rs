use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    allocate_quotas, enforce_capacity, reconcile, Category, CategoryCaps, CategoryWeights,
    MemoryCandidate, MemoryRecord, ReconcileSummary,
};

pub const DEFAULT_MAX_MEMORIES: usize = 200;

/// Capacity limits and weighting for one merge call.
///
/// `now` is the reference clock for timestamps and recency; the engine never reads the
/// wall clock itself.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOptions {
    pub now: OffsetDateTime,
    pub max_memories: usize,
    pub max_per_type: BTreeMap<Category, f64>,
    pub type_weights: BTreeMap<Category, f64>,
}

impl MergeOptions {
    #[must_use]
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now,
            max_memories: DEFAULT_MAX_MEMORIES,
            max_per_type: BTreeMap::new(),
            type_weights: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_max_memories(mut self, max_memories: usize) -> Self {
        self.max_memories = max_memories;
        self
    }

    #[must_use]
    pub fn with_max_per_type(mut self, category: Category, cap: f64) -> Self {
        self.max_per_type.insert(category, cap);
        self
    }

    #[must_use]
    pub fn with_type_weight(mut self, category: Category, weight: f64) -> Self {
        self.type_weights.insert(category, weight);
        self
    }

    #[must_use]
    pub fn weights(&self) -> CategoryWeights {
        CategoryWeights::with_overrides(&self.type_weights)
    }

    #[must_use]
    pub fn caps(&self) -> CategoryCaps {
        allocate_quotas(self.max_memories, &self.max_per_type)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeReport {
    pub created: usize,
    pub replaced: usize,
    pub reaffirmed: usize,
    /// Records removed by capacity enforcement.
    pub dropped: usize,
    pub kept: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub memories: Vec<MemoryRecord>,
    pub report: MergeReport,
}

/// Merge candidates into existing records, then enforce capacity.
#[must_use]
pub fn merge_memories(
    existing: &[MemoryRecord],
    candidates: &[MemoryCandidate],
    options: &MergeOptions,
) -> Vec<MemoryRecord> {
    merge_memories_with_report(existing, candidates, options).memories
}

/// Same as [`merge_memories`], also counting what happened to each candidate and how many
/// records capacity enforcement removed.
#[must_use]
pub fn merge_memories_with_report(
    existing: &[MemoryRecord],
    candidates: &[MemoryCandidate],
    options: &MergeOptions,
) -> MergeOutcome {
    let weights = options.weights();
    let caps = options.caps();

    let mut working = existing.to_vec();
    let ReconcileSummary { created, replaced, reaffirmed } =
        reconcile(&mut working, candidates, options.now, &weights);
    let reconciled = working.len();

    let memories = enforce_capacity(working, options.max_memories, &caps, options.now, &weights);
    let report = MergeReport {
        created,
        replaced,
        reaffirmed,
        dropped: reconciled - memories.len(),
        kept: memories.len(),
    };
    tracing::debug!(
        existing = existing.len(),
        candidates = candidates.len(),
        created = report.created,
        replaced = report.replaced,
        reaffirmed = report.reaffirmed,
        dropped = report.dropped,
        kept = report.kept,
        "merged memory candidates"
    );

    MergeOutcome { memories, report }
}
