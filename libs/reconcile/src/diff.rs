//! Identity diffing and positional hash comparison.

use std::collections::BTreeSet;

/// Result of diffing two id sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdDiff<K> {
    /// Present before, absent now (sorted).
    pub removed: Vec<K>,

    /// Absent before, present now (sorted).
    pub added: Vec<K>,
}

impl<K> IdDiff<K> {
    /// Returns true if nothing was added or removed.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Set difference over ids: `removed = previous - desired`,
/// `added = desired - previous`.
///
/// Only identity is compared. Two records with the same id are the same
/// entry however much their other fields differ.
pub fn diff_ids<K, P, D>(previous: P, desired: D) -> IdDiff<K>
where
    K: Ord + Clone,
    P: IntoIterator<Item = K>,
    D: IntoIterator<Item = K>,
{
    let previous: BTreeSet<K> = previous.into_iter().collect();
    let desired: BTreeSet<K> = desired.into_iter().collect();

    IdDiff {
        removed: previous.difference(&desired).cloned().collect(),
        added: desired.difference(&previous).cloned().collect(),
    }
}

/// Returns true if `fetched` must be loaded given the last loaded hash.
pub fn needs_reload<H: PartialEq>(cached: Option<&H>, fetched: &H) -> bool {
    cached != Some(fetched)
}

/// Indices whose fetched hash differs from the cached one.
///
/// Both slices are positional. A `None` in `fetched` means the graph could not
/// be resolved and is never reported; a `None` in `cached` (or a cache shorter
/// than `fetched`) always counts as stale.
pub fn stale_positions<H: PartialEq>(cached: &[Option<H>], fetched: &[Option<H>]) -> Vec<usize> {
    fetched
        .iter()
        .enumerate()
        .filter_map(|(index, fetched)| {
            let fetched = fetched.as_ref()?;
            let cached = cached.get(index).and_then(Option::as_ref);
            needs_reload(cached, fetched).then_some(index)
        })
        .collect()
}
