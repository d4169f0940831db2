use std::collections::HashMap;

use crate::identifier::Identifier;
use crate::transport::Handle;

/// Children of one container, in discovery order.
///
/// Children are keyed by `(identifier, ordinal)`, where the ordinal counts
/// earlier siblings sharing the same identifier.
#[derive(Debug, Clone)]
pub(crate) struct ChildTable<K> {
    entries: Vec<(Identifier, K)>,
}

impl<K> Default for ChildTable<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K: Copy + Eq> ChildTable<K> {
    /// Appends a child and returns its ordinal among same-identifier siblings.
    pub(crate) fn push(&mut self, identifier: Identifier, key: K) -> usize {
        let ordinal = self.count(identifier);
        self.entries.push((identifier, key));
        ordinal
    }

    fn count(&self, identifier: Identifier) -> usize {
        self.entries
            .iter()
            .filter(|(candidate, _)| *candidate == identifier)
            .count()
    }

    /// Returns the child at `(identifier, ordinal)`.
    pub(crate) fn get(&self, identifier: Identifier, ordinal: usize) -> Option<K> {
        self.all(identifier).nth(ordinal)
    }

    /// Returns the first child with `identifier`.
    pub(crate) fn first(&self, identifier: Identifier) -> Option<K> {
        self.get(identifier, 0)
    }

    /// Returns every child with `identifier`, in discovery order.
    pub(crate) fn all(&self, identifier: Identifier) -> impl Iterator<Item = K> + '_ {
        self.entries
            .iter()
            .filter(move |(candidate, _)| *candidate == identifier)
            .map(|(_, key)| *key)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.entries.iter().map(|(_, key)| *key)
    }
}

/// Outcome of matching known children against a live handle list.
#[derive(Debug)]
pub(crate) struct Reconciliation<K, H> {
    /// Known children paired with their new handle.
    pub(crate) matched: Vec<(K, H)>,
    /// Known children with no counterpart in the live list.
    pub(crate) missing: Vec<K>,
    /// Live handles with no known child, in live order.
    pub(crate) fresh: Vec<H>,
    /// Every live position resolved to a known key, or `None` for fresh handles.
    pub(crate) order: Vec<Option<K>>,
}

/// Pairs live handles with known children by `(identifier, ordinal)`.
///
/// Pure: neither input is modified and no proxy records are created.
pub(crate) fn reconcile<K, H>(known: &ChildTable<K>, live: &[H]) -> Reconciliation<K, H>
where
    K: Copy + Eq,
    H: Handle,
{
    let mut seen: HashMap<Identifier, usize> = HashMap::new();
    let mut matched = Vec::new();
    let mut fresh = Vec::new();
    let mut order = Vec::with_capacity(live.len());

    for handle in live {
        let identifier = handle.identifier();
        let ordinal = seen.entry(identifier).or_default();
        match known.get(identifier, *ordinal) {
            Some(key) => {
                matched.push((key, handle.clone()));
                order.push(Some(key));
            }
            None => {
                fresh.push(handle.clone());
                order.push(None);
            }
        }
        *ordinal += 1;
    }

    let missing = known
        .keys()
        .filter(|key| !matched.iter().any(|(candidate, _)| candidate == key))
        .collect();

    Reconciliation {
        matched,
        missing,
        fresh,
        order,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Clone, Eq, PartialEq)]
    struct Live(u16, u8);

    impl Handle for Live {
        fn identifier(&self) -> Identifier {
            Identifier::from_u16(self.0)
        }
    }

    fn table(entries: &[(u16, u32)]) -> ChildTable<u32> {
        let mut table = ChildTable::default();
        for (identifier, key) in entries {
            table.push(Identifier::from_u16(*identifier), *key);
        }
        table
    }

    #[test]
    fn push_reports_ordinal_within_identifier() {
        let mut table = ChildTable::default();
        assert_eq!(0, table.push(Identifier::from_u16(0x180f), 1));
        assert_eq!(0, table.push(Identifier::from_u16(0x180a), 2));
        assert_eq!(1, table.push(Identifier::from_u16(0x180f), 3));
        assert_eq!(Some(3), table.get(Identifier::from_u16(0x180f), 1));
        assert_eq!(Some(1), table.first(Identifier::from_u16(0x180f)));
    }

    #[test]
    fn reconcile_matches_by_identifier_and_ordinal() {
        let known = table(&[(0x180f, 1), (0x180f, 2), (0x180a, 3)]);
        let live = vec![Live(0x180a, 9), Live(0x180f, 9), Live(0x180f, 9)];

        let outcome = reconcile(&known, &live);

        assert_eq!(vec![3, 1, 2], outcome.matched.iter().map(|(k, _)| *k).collect::<Vec<_>>());
        assert!(outcome.missing.is_empty());
        assert!(outcome.fresh.is_empty());
        assert_eq!(vec![Some(3), Some(1), Some(2)], outcome.order);
    }

    #[test]
    fn reconcile_reports_missing_and_fresh_children() {
        let known = table(&[(0x180f, 1), (0x180a, 2)]);
        let live = vec![Live(0x180f, 1), Live(0x1812, 1), Live(0x180f, 1)];

        let outcome = reconcile(&known, &live);

        assert_eq!(vec![1], outcome.matched.iter().map(|(k, _)| *k).collect::<Vec<_>>());
        assert_eq!(vec![2], outcome.missing);
        assert_eq!(vec![Live(0x1812, 1), Live(0x180f, 1)], outcome.fresh);
        assert_eq!(vec![Some(1), None, None], outcome.order);
    }

    #[test]
    fn reconcile_leaves_inputs_untouched() {
        let known = table(&[(0x180f, 1)]);
        let _ = reconcile(&known, &[Live(0x180f, 2)]);
        assert_eq!(vec![1], known.keys().collect::<Vec<_>>());
    }
}
