use std::collections::BTreeMap;

use crate::{merge_memories_with_report, MemoryCandidate, MemoryRecord, MergeOptions, MergeOutcome};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Per-user persistence for memory records.
///
/// The contract has no compare-and-swap: callers that may merge for the same user
/// concurrently must serialize the get/merge/put sequence themselves.
pub trait MemoryStore {
    /// Records stored for `user_id`, in stored order. Unknown users have none.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn get(&self, user_id: &str) -> Result<Vec<MemoryRecord>, StoreError>;

    /// Replace every record stored for `user_id`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be written.
    fn put(&mut self, user_id: &str, records: Vec<MemoryRecord>) -> Result<(), StoreError>;

    /// Remove every record sharing `record.id`, then append `record`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be written.
    fn upsert(&mut self, user_id: &str, record: MemoryRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    records: BTreeMap<String, Vec<MemoryRecord>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryStore for InMemoryStore {
    fn get(&self, user_id: &str) -> Result<Vec<MemoryRecord>, StoreError> {
        Ok(self.records.get(user_id).cloned().unwrap_or_default())
    }

    fn put(&mut self, user_id: &str, records: Vec<MemoryRecord>) -> Result<(), StoreError> {
        self.records.insert(user_id.to_string(), records);
        Ok(())
    }

    fn upsert(&mut self, user_id: &str, record: MemoryRecord) -> Result<(), StoreError> {
        let entry = self.records.entry(user_id.to_string()).or_default();
        entry.retain(|existing| existing.id != record.id);
        entry.push(record);
        Ok(())
    }
}

/// Fetch the user's records, merge `candidates` into them and persist the result.
///
/// # Errors
/// Returns [`StoreError`] from the underlying `get` or `put`; on a failed `get` nothing
/// is written.
pub fn remember<S>(
    store: &mut S,
    user_id: &str,
    candidates: &[MemoryCandidate],
    options: &MergeOptions,
) -> Result<MergeOutcome, StoreError>
where
    S: MemoryStore + ?Sized,
{
    let existing = store.get(user_id)?;
    let outcome = merge_memories_with_report(&existing, candidates, options);
    store.put(user_id, outcome.memories.clone())?;
    tracing::info!(
        user_id,
        kept = outcome.report.kept,
        dropped = outcome.report.dropped,
        "stored merged memories"
    );
    Ok(outcome)
}
