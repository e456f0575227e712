//! A shared read-only contract implemented by both map types, letting test
//! code run the same property checks against either one.
//!
//! Mutation is deliberately left out: `ConcurrentAvlMap::put`/`remove` take
//! `&self` (serialized internally by per-node locks), while
//! `SequentialAvlMap::put`/`remove` take `&mut self` (no locking at all).
//! Forcing those behind one signature would mean giving the sequential map
//! interior mutability it has no use for.

use crate::concurrent::ConcurrentAvlMap;
use crate::sequential::SequentialAvlMap;

pub trait OrderedMap<K, V> {
    fn get(&self, key: &K) -> Option<V>;

    fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn height(&self) -> u32;
}

impl<K, V> OrderedMap<K, V> for ConcurrentAvlMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn get(&self, key: &K) -> Option<V> {
        ConcurrentAvlMap::get(self, key)
    }

    fn len(&self) -> usize {
        ConcurrentAvlMap::len(self)
    }

    fn height(&self) -> u32 {
        ConcurrentAvlMap::height(self)
    }
}

impl<K, V> OrderedMap<K, V> for SequentialAvlMap<K, V>
where
    K: Ord,
    V: Clone,
{
    fn get(&self, key: &K) -> Option<V> {
        SequentialAvlMap::get(self, key).cloned()
    }

    fn len(&self) -> usize {
        SequentialAvlMap::len(self)
    }

    fn height(&self) -> u32 {
        SequentialAvlMap::height(self)
    }
}

/// A property-check helper shared by both maps' test modules, run through
/// `OrderedMap` so it never needs to know which implementation it's holding.
#[cfg(test)]
pub(crate) mod test_support {
    use super::OrderedMap;
    use std::collections::BTreeMap;
    use std::fmt::Debug;

    /// Checks that `map`'s externally observable state agrees with `oracle`:
    /// same length, same emptiness, and every key in `oracle` resolves to
    /// the same value through `map`.
    pub(crate) fn assert_matches_oracle<K, V, M>(map: &M, oracle: &BTreeMap<K, V>)
    where
        K: Ord + Debug,
        V: Clone + PartialEq + Debug,
        M: OrderedMap<K, V>,
    {
        assert_eq!(map.len(), oracle.len());
        assert_eq!(map.is_empty(), oracle.is_empty());
        for (key, value) in oracle {
            assert_eq!(map.get(key), Some(value.clone()), "mismatch at key {key:?}");
        }
    }
}
