use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::keys::Keyed;

/// What happens to existing records whose key is absent from the incoming collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalePolicy {
    Delete,
    Keep,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

impl ReconcileSummary {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }

    pub fn add(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
    }
}

/// Reject a collection in which two records (or two nested records) share a key.
///
/// # Errors
/// Returns [`ReconcileError::DuplicateKey`] naming the first repeated key.
pub fn ensure_unique_keys<T: Keyed>(records: &[T]) -> Result<(), ReconcileError> {
    let mut seen = BTreeSet::new();
    for record in records {
        record.check_nested_keys()?;
        let key = record.key();
        if !seen.insert(key.clone()) {
            return Err(ReconcileError::DuplicateKey {
                collection: T::COLLECTION,
                key: format!("{key:?}"),
            });
        }
    }
    Ok(())
}

/// Merge `incoming` into `existing` by natural key.
///
/// Matched records absorb the incoming fields, unmatched incoming records are inserted and,
/// under [`StalePolicy::Delete`], existing records missing from `incoming` are dropped. The
/// resulting collection is ordered by key, so the outcome does not depend on the order of
/// `incoming`. Keys are validated before `existing` is touched.
///
/// # Errors
/// Returns [`ReconcileError::DuplicateKey`] when `incoming` repeats a key at any depth;
/// `existing` is left unchanged in that case.
pub fn reconcile<T: Keyed>(
    existing: &mut Vec<T>,
    incoming: Vec<T>,
    stale: StalePolicy,
) -> Result<ReconcileSummary, ReconcileError> {
    ensure_unique_keys(&incoming)?;
    Ok(apply(existing, incoming, stale))
}

/// [`reconcile`] without key validation; callers guarantee unique incoming keys.
pub(crate) fn apply<T: Keyed>(
    existing: &mut Vec<T>,
    incoming: Vec<T>,
    stale: StalePolicy,
) -> ReconcileSummary {
    let mut summary = ReconcileSummary::default();
    let mut remaining: BTreeMap<T::Key, T> =
        existing.drain(..).map(|record| (record.key(), record)).collect();
    let mut result = Vec::with_capacity(incoming.len() + remaining.len());

    for candidate in incoming {
        match remaining.remove(&candidate.key()) {
            Some(mut matched) => {
                let before = matched.clone();
                matched.absorb(candidate);
                if matched == before {
                    summary.unchanged += 1;
                } else {
                    summary.updated += 1;
                }
                result.push(matched);
            }
            None => {
                summary.inserted += 1;
                result.push(candidate);
            }
        }
    }

    match stale {
        StalePolicy::Delete => summary.deleted = remaining.len(),
        StalePolicy::Keep => result.extend(remaining.into_values()),
    }

    result.sort_by_cached_key(Keyed::key);
    *existing = result;
    summary
}
