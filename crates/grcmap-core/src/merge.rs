//! Merging result batches into a binding's list
//!
//! Every loader funnels its candidates through [`insert_results`] and its
//! retractions through [`remove_instance`]. Entries are matched by instance
//! key, never by object identity.

use crate::binding::{ListBinding, ResultBatch};
use crate::instance::InstanceKey;
use crate::result::MappingResult;
use std::sync::Arc;

/// Merge `candidates` into `binding`'s list.
///
/// A candidate whose key is already listed (or staged earlier in the same
/// batch) is either a duplicate and skipped, or contributes its missing
/// provenance entries to the existing entry. Unlisted candidates become fresh
/// entries, appended in one mutation followed by one add event.
///
/// Returns every entry touched: the merged ones and the newly appended ones.
pub fn insert_results(
    binding: &Arc<ListBinding>,
    candidates: impl IntoIterator<Item = Arc<MappingResult>>,
) -> Vec<Arc<MappingResult>> {
    let mut touched: Vec<Arc<MappingResult>> = Vec::new();
    let mut staged: ResultBatch = Vec::new();

    {
        let mut list = binding.list_mut();
        for candidate in candidates {
            let Some(instance) = candidate.instance() else {
                continue;
            };
            let existing = list
                .iter()
                .chain(staged.iter())
                .find(|r| r.key() == Some(instance.key()))
                .cloned();

            match existing {
                Some(existing) => {
                    if is_duplicate_result(&existing, &candidate) {
                        continue;
                    }
                    if existing.merge_mappings(&candidate.mappings()) > 0
                        && !touched.iter().any(|t| Arc::ptr_eq(t, &existing))
                    {
                        touched.push(existing);
                    }
                }
                None => {
                    let fresh = MappingResult::bound(
                        Arc::clone(instance),
                        candidate.mappings(),
                        Arc::downgrade(binding),
                    );
                    staged.push(Arc::clone(&fresh));
                    touched.push(fresh);
                }
            }
        }
        list.extend(staged.iter().cloned());
    }

    if !staged.is_empty() {
        tracing::trace!(binding = ?binding, added = staged.len(), "inserted results");
        binding.emit_added(&staged);
    }
    touched
}

/// Whether `incoming` adds nothing to `existing`.
///
/// True when both name the same instance with the same provenance set, or
/// when both carry exactly one provenance entry and each is a plain edge with
/// nothing nested behind it.
pub fn is_duplicate_result(existing: &MappingResult, incoming: &MappingResult) -> bool {
    if existing.key().is_none() || existing.key() != incoming.key() {
        return false;
    }

    let old = existing.mappings();
    let new = incoming.mappings();
    if old.len() == new.len() && new.iter().all(|n| old.iter().any(|o| o.same_provenance(n))) {
        return true;
    }

    old.len() == 1
        && new.len() == 1
        && old[0].is_edge()
        && new[0].is_edge()
        && old[0].mapping_count() == 0
        && new[0].mapping_count() == 0
}

/// Retract `mappings` from the entry listed for `key`.
///
/// An entry with no provenance left is removed outright. Otherwise each given
/// provenance entry is removed from it, and the entry goes once that leaves it
/// empty. Provenance not present on the entry is ignored. Returns the removed
/// entries.
pub fn remove_instance(
    binding: &ListBinding,
    key: &InstanceKey,
    mappings: &[Arc<MappingResult>],
) -> Vec<Arc<MappingResult>> {
    let mut removed: ResultBatch = Vec::new();
    {
        let mut list = binding.list_mut();
        let mut doomed = Vec::new();
        for (index, result) in list.iter().enumerate() {
            if result.key() != Some(key) {
                continue;
            }
            if result.mapping_count() == 0 {
                doomed.push(index);
                continue;
            }
            let mut changed = false;
            for mapping in mappings {
                changed |= result.remove_mapping(mapping);
            }
            if changed && result.mapping_count() == 0 {
                doomed.push(index);
            }
        }

        // Ascending indices, each shifted by the entries already spliced out.
        for (shift, index) in doomed.into_iter().enumerate() {
            removed.push(list.remove(index - shift));
        }
    }

    if !removed.is_empty() {
        tracing::trace!(binding = ?binding, key = %key, "removed results");
        binding.emit_removed(&removed);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;

    fn inst(model: &str, id: u64) -> Arc<Instance> {
        Arc::new(Instance::stub(InstanceKey::new(model, id)))
    }

    #[test]
    fn plain_edges_are_duplicates() {
        let control = inst("Control", 1);
        let a = MappingResult::direct(Arc::clone(&control));
        let b = MappingResult::direct(Arc::clone(&control));
        assert!(is_duplicate_result(&a, &b));
    }

    #[test]
    fn different_keys_are_never_duplicates() {
        let a = MappingResult::direct(inst("Control", 1));
        let b = MappingResult::direct(inst("Risk", 1));
        assert!(!is_duplicate_result(&a, &b));
    }

    #[test]
    fn different_join_records_are_not_duplicates() {
        let control = inst("Control", 1);
        let a = MappingResult::new(
            Arc::clone(&control),
            vec![MappingResult::direct(inst("Relationship", 1))],
        );
        let b = MappingResult::new(
            Arc::clone(&control),
            vec![MappingResult::direct(inst("Relationship", 2))],
        );
        assert!(!is_duplicate_result(&a, &b));

        let a_again = MappingResult::new(
            Arc::clone(&control),
            vec![MappingResult::direct(inst("Relationship", 1))],
        );
        assert!(is_duplicate_result(&a, &a_again));
    }
}
