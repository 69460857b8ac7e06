//! Matching a new configuration against the live resources.
//!
//! Entries are matched by identity only. Matched entries are kept as they are; whether their
//! descriptor changed is decided by the caller.

use ahash::AHashMap;
use std::hash::Hash;

#[derive(Debug)]
pub(crate) enum Planned<E, D> {
    /// A live entry that reappears, with its new descriptor.
    Kept(E, D),
    /// A descriptor without a live counterpart.
    Added(D),
}

#[derive(Debug)]
pub(crate) struct Plan<E, D> {
    /// In declaration order.
    pub entries: Vec<Planned<E, D>>,
    /// Live entries that no longer appear, in their previous order.
    pub removed: Vec<E>,
}

impl<E, D> Plan<E, D> {
    /// Whether the set of entries itself changed.
    pub fn reshaped(&self) -> bool {
        !self.removed.is_empty()
            || self
                .entries
                .iter()
                .any(|planned| matches!(planned, Planned::Added(_)))
    }
}

pub(crate) fn plan<E, D, K>(
    current: Vec<E>,
    desired: Vec<D>,
    entry_key: impl Fn(&E) -> K,
    descriptor_key: impl Fn(&D) -> K,
) -> Plan<E, D>
where
    K: Eq + Hash,
{
    let mut by_key: AHashMap<K, E> = AHashMap::with_capacity(current.len());
    let mut order = Vec::with_capacity(current.len());
    for entry in current {
        order.push(entry_key(&entry));
        by_key.insert(entry_key(&entry), entry);
    }

    let entries = desired
        .into_iter()
        .map(|descriptor| match by_key.remove(&descriptor_key(&descriptor)) {
            Some(entry) => Planned::Kept(entry, descriptor),
            None => Planned::Added(descriptor),
        })
        .collect();

    let removed = order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect();

    Plan { entries, removed }
}
