use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod capacity;
mod identity;
mod merge;
mod quota;
mod reconcile;
mod score;
mod store;

pub use capacity::enforce_capacity;
pub use identity::{build_id, hash_content};
pub use merge::{
    merge_memories, merge_memories_with_report, MergeOptions, MergeOutcome, MergeReport,
    DEFAULT_MAX_MEMORIES,
};
pub use quota::{allocate_quotas, resolve_cap_override, CategoryCaps};
pub use reconcile::{apply_candidate, find_match, reconcile, Disposition, ReconcileSummary};
pub use score::{recency, score_memory, CONFIDENCE_FACTOR, RECENCY_FACTOR, WEIGHT_FACTOR};
pub use store::{remember, InMemoryStore, MemoryStore, StoreError};

/// Confidence assumed for a candidate or record without one when deciding whether a
/// candidate replaces the matched record.
pub const COMPARISON_DEFAULT_CONFIDENCE: f64 = 0.0;

/// Confidence assumed for a record without one when scoring.
pub const SCORING_DEFAULT_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// The closed set of memory kinds. Declaration order is the canonical order used for
/// quota remainder distribution and category-major output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Profile,
    Project,
    Goal,
    Preference,
    Temp,
}

impl Category {
    pub const ALL: [Category; 5] =
        [Self::Profile, Self::Project, Self::Goal, Self::Preference, Self::Temp];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Profile => 0,
            Self::Project => 1,
            Self::Goal => 2,
            Self::Preference => 3,
            Self::Temp => 4,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Project => "project",
            Self::Goal => "goal",
            Self::Preference => "preference",
            Self::Temp => "temp",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "profile" => Some(Self::Profile),
            "project" => Some(Self::Project),
            "goal" => Some(Self::Goal),
            "preference" => Some(Self::Preference),
            "temp" => Some(Self::Temp),
            _ => None,
        }
    }

    /// Typical long-term value of the category, used unless overridden.
    #[must_use]
    pub fn default_weight(self) -> f64 {
        match self {
            Self::Profile => 0.9,
            Self::Project => 0.7,
            Self::Goal => 0.6,
            Self::Preference => 0.5,
            Self::Temp => 0.3,
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| {
            KernelError::Validation(format!(
                "unknown memory type `{value}` (expected one of profile, project, goal, preference, temp)"
            ))
        })
    }
}

/// Stable identifier derived from category and content, see [`build_id`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct MemoryId(pub String);

impl MemoryId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MemoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A freshly extracted, untrusted piece of memory. Confidence is not range-checked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryCandidate {
    #[serde(rename = "type")]
    pub category: Category,
    pub content: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl MemoryCandidate {
    #[must_use]
    pub fn new(category: Category, content: impl Into<String>, confidence: f64) -> Self {
        Self {
            category,
            content: content.into(),
            rationale: String::new(),
            confidence: Some(confidence),
        }
    }

    #[must_use]
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: MemoryId,
    #[serde(rename = "type")]
    pub category: Category,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl MemoryRecord {
    /// Build a brand new record from a candidate with `created_at = updated_at = now`.
    #[must_use]
    pub fn from_candidate(
        candidate: &MemoryCandidate,
        now: OffsetDateTime,
        weights: &CategoryWeights,
    ) -> Self {
        Self {
            id: build_id(candidate.category, &candidate.content),
            category: candidate.category,
            content: candidate.content.clone(),
            rationale: Some(candidate.rationale.clone()),
            confidence: candidate.confidence,
            weight: Some(weights.get(candidate.category)),
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the invariants a stored record must hold. The merge engine itself never
    /// rejects input; this is for records arriving from outside, such as imports.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the id does not match category and content,
    /// or when `updatedAt` precedes `createdAt`.
    pub fn validate(&self) -> Result<(), KernelError> {
        let expected = build_id(self.category, &self.content);
        if self.id != expected {
            return Err(KernelError::Validation(format!(
                "id `{}` does not match derived id `{expected}`",
                self.id
            )));
        }

        if self.updated_at < self.created_at {
            return Err(KernelError::Validation(format!(
                "updatedAt MUST NOT precede createdAt for {}",
                self.id
            )));
        }

        Ok(())
    }
}

/// Per-category weights, defaulting to [`Category::default_weight`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryWeights([f64; 5]);

impl CategoryWeights {
    #[must_use]
    pub fn with_overrides(overrides: &BTreeMap<Category, f64>) -> Self {
        let mut weights = Self::default();
        for (category, weight) in overrides {
            weights.0[category.index()] = *weight;
        }
        weights
    }

    #[must_use]
    pub fn get(&self, category: Category) -> f64 {
        self.0[category.index()]
    }

    /// Weight used for a record: its explicit weight, else the category weight.
    #[must_use]
    pub fn resolve(&self, record: &MemoryRecord) -> f64 {
        record.weight.unwrap_or_else(|| self.get(record.category))
    }
}

impl Default for CategoryWeights {
    fn default() -> Self {
        Self(Category::ALL.map(Category::default_weight))
    }
}

/// Confidence used when comparing a candidate against its matched record.
#[must_use]
pub fn comparison_confidence(value: Option<f64>) -> f64 {
    value.unwrap_or(COMPARISON_DEFAULT_CONFIDENCE)
}

/// Confidence used when scoring a record.
#[must_use]
pub fn scoring_confidence(value: Option<f64>) -> f64 {
    value.unwrap_or(SCORING_DEFAULT_CONFIDENCE)
}
