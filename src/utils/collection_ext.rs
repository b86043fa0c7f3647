//! Small collection helpers reused by the Document Store (order-stable
//! dedup for smart-query term unions) and the Table Registry.

use std::collections::HashMap;
use std::hash::Hash;

/// Converts a `Vec` into a `HashMap` keyed by `key_fn`, keeping the last
/// value seen for a duplicate key.
#[inline]
pub fn vec_to_map<T, K, F>(items: Vec<T>, key_fn: F) -> HashMap<K, T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    items.into_iter().map(|item| (key_fn(&item), item)).collect()
}

/// Deduplicates `items` by `key_fn`, preserving the position of each key's
/// first occurrence. Used to union per-term smart-query results, which must
/// stay order-stable rather than being re-sorted by a hash key.
pub fn unique_ordered_by<T, K, F>(items: Vec<T>, mut key_fn: F) -> Vec<T>
where
    K: Eq + Hash,
    F: FnMut(&T) -> K,
{
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|item| seen.insert(key_fn(item))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ordered_by_keeps_first_occurrence_position() {
        let items = vec![("a", 1), ("b", 2), ("a", 3), ("c", 4)];
        let deduped = unique_ordered_by(items, |(k, _)| *k);
        assert_eq!(deduped, vec![("a", 1), ("b", 2), ("c", 4)]);
    }
}
