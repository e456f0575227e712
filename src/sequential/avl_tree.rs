//! Single-threaded AVL map sharing the rotation geometry and external
//! contract of the concurrent map, built on the plain recursive
//! `Option<Box<Node<T>>>` shape rather than any locking/version-word
//! machinery.

use std::cmp::Ordering as CmpOrdering;
use std::fmt::Write as _;
use std::mem;

struct Node<K, V> {
    key: K,
    value: V,
    height: u32,
    balance_factor: i8,
    left: Option<Box<Node<K, V>>>,
    right: Option<Box<Node<K, V>>>,
}

impl<K, V> Node<K, V> {
    fn new(key: K, value: V) -> Self {
        Node {
            key,
            value,
            height: 1,
            balance_factor: 0,
            left: None,
            right: None,
        }
    }

    fn update(&mut self) {
        let h_l = self.left.as_ref().map_or(0, |n| n.height);
        let h_r = self.right.as_ref().map_or(0, |n| n.height);
        self.height = 1 + h_l.max(h_r);
        self.balance_factor = (h_r as i64 - h_l as i64) as i8;
    }
}

/// A single-threaded, ordered key-value map kept AVL-balanced on every
/// insert and remove.
pub struct SequentialAvlMap<K, V> {
    root: Option<Box<Node<K, V>>>,
    len: usize,
}

impl<K, V> Default for SequentialAvlMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SequentialAvlMap<K, V> {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn height(&self) -> u32 {
        self.root.as_ref().map_or(0, |n| n.height)
    }
}

impl<K: Ord, V> SequentialAvlMap<K, V> {
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut cursor = self.root.as_deref();
        while let Some(node) = cursor {
            match key.cmp(&node.key) {
                CmpOrdering::Less => cursor = node.left.as_deref(),
                CmpOrdering::Greater => cursor = node.right.as_deref(),
                CmpOrdering::Equal => return Some(&node.value),
            }
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts `key`/`value`, returning the previous value if the key was
    /// already present (an update in place, no structural change).
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        let prev = Self::insert(&mut self.root, key, value);
        if prev.is_none() {
            self.len += 1;
        }
        prev
    }

    fn insert(slot: &mut Option<Box<Node<K, V>>>, key: K, value: V) -> Option<V> {
        let prev = match slot {
            None => {
                *slot = Some(Box::new(Node::new(key, value)));
                return None;
            }
            Some(node) => match key.cmp(&node.key) {
                CmpOrdering::Less => Self::insert(&mut node.left, key, value),
                CmpOrdering::Greater => Self::insert(&mut node.right, key, value),
                CmpOrdering::Equal => Some(mem::replace(&mut node.value, value)),
            },
        };
        let node = slot.as_mut().unwrap();
        node.update();
        Self::balance(node);
        prev
    }

    /// Removes `key`, returning its value if present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let prev = Self::remove_rec(&mut self.root, key);
        if prev.is_some() {
            self.len -= 1;
        }
        prev
    }

    fn remove_rec(slot: &mut Option<Box<Node<K, V>>>, key: &K) -> Option<V> {
        let node = slot.as_mut()?;
        let prev = match key.cmp(&node.key) {
            CmpOrdering::Less => Self::remove_rec(&mut node.left, key),
            CmpOrdering::Greater => Self::remove_rec(&mut node.right, key),
            CmpOrdering::Equal => {
                let removed = slot.take().unwrap();
                let Node {
                    value, left, right, ..
                } = *removed;
                *slot = match (left, right) {
                    (None, None) => None,
                    (None, Some(r)) => Some(r),
                    (Some(l), None) => Some(l),
                    (Some(l), Some(r)) => {
                        if l.height >= r.height {
                            let mut x = Self::remove_max(l);
                            x.right = Some(r);
                            Some(x)
                        } else {
                            let mut x = Self::remove_min(r);
                            x.left = Some(l);
                            Some(x)
                        }
                    }
                };
                if let Some(n) = slot.as_mut() {
                    n.update();
                    Self::balance(n);
                }
                return Some(value);
            }
        };
        if let Some(n) = slot.as_mut() {
            n.update();
            Self::balance(n);
        }
        prev
    }

    fn remove_min(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
        fn inner<K, V>(node: &mut Node<K, V>) -> Option<Box<Node<K, V>>> {
            let extracted = match node.left.as_mut() {
                Some(next) => {
                    let res = inner(next);
                    if res.is_none() {
                        node.left.take()
                    } else {
                        res
                    }
                }
                None => return None,
            };
            node.update();
            SequentialAvlMap::balance(node);
            extracted
        }
        let extracted = inner(&mut node);
        extracted.unwrap_or(node)
    }

    fn remove_max(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
        fn inner<K, V>(node: &mut Node<K, V>) -> Option<Box<Node<K, V>>> {
            let extracted = match node.right.as_mut() {
                Some(next) => {
                    let res = inner(next);
                    if res.is_none() {
                        node.right.take()
                    } else {
                        res
                    }
                }
                None => return None,
            };
            node.update();
            SequentialAvlMap::balance(node);
            extracted
        }
        let extracted = inner(&mut node);
        extracted.unwrap_or(node)
    }

    /// Rebalances a node whose balance factor has just been recomputed and
    /// found to be +2 or -2.
    fn balance(node: &mut Box<Node<K, V>>) {
        match node.balance_factor {
            -2 => {
                if node.left.as_ref().unwrap().balance_factor <= 0 {
                    Self::rotate_right(node);
                } else {
                    Self::rotate_left(node.left.as_mut().unwrap());
                    Self::rotate_right(node);
                }
            }
            2 => {
                if node.right.as_ref().unwrap().balance_factor >= 0 {
                    Self::rotate_left(node);
                } else {
                    Self::rotate_right(node.right.as_mut().unwrap());
                    Self::rotate_left(node);
                }
            }
            _ => {}
        }
    }

    fn rotate_left(node: &mut Box<Node<K, V>>) {
        let right_left = node.right.as_mut().unwrap().left.take();
        let new_parent = mem::replace(&mut node.right, right_left).unwrap();
        let old_node = mem::replace(node, new_parent);
        node.left = Some(old_node);
        node.left.as_mut().unwrap().update();
        node.update();
    }

    fn rotate_right(node: &mut Box<Node<K, V>>) {
        let left_right = node.left.as_mut().unwrap().right.take();
        let new_parent = mem::replace(&mut node.left, left_right).unwrap();
        let old_node = mem::replace(node, new_parent);
        node.right = Some(old_node);
        node.right.as_mut().unwrap().update();
        node.update();
    }

    pub fn min(&self) -> Option<&K> {
        let mut cursor = self.root.as_deref()?;
        while let Some(left) = cursor.left.as_deref() {
            cursor = left;
        }
        Some(&cursor.key)
    }

    pub fn max(&self) -> Option<&K> {
        let mut cursor = self.root.as_deref()?;
        while let Some(right) = cursor.right.as_deref() {
            cursor = right;
        }
        Some(&cursor.key)
    }
}

impl<K: Ord + std::fmt::Display, V> SequentialAvlMap<K, V> {
    /// Parenthesized pre-order serialization, mirroring
    /// `ConcurrentAvlMap::to_string`.
    pub fn to_string(&self) -> String {
        let mut out = String::new();
        Self::write_subtree(self.root.as_deref(), &mut out);
        out
    }

    fn write_subtree(node: Option<&Node<K, V>>, out: &mut String) {
        match node {
            None => out.push_str("()"),
            Some(node) => {
                let _ = write!(out, "({}", node.key);
                if node.left.is_some() || node.right.is_some() {
                    out.push(' ');
                    Self::write_subtree(node.left.as_deref(), out);
                    out.push(' ');
                    Self::write_subtree(node.right.as_deref(), out);
                }
                out.push(')');
            }
        }
    }
}

#[cfg(test)]
impl<K: Ord + Clone + std::fmt::Debug, V> SequentialAvlMap<K, V> {
    /// Walks the whole tree checking BST order, AVL balance, and cached
    /// heights, mirroring `ConcurrentAvlMap::check_invariants`.
    pub(crate) fn check_invariants(&self) -> Result<(), crate::error::TreeError<K>> {
        Self::check_subtree(self.root.as_deref(), None, None).map(|_| ())
    }

    fn check_subtree(
        node: Option<&Node<K, V>>,
        lower: Option<&K>,
        upper: Option<&K>,
    ) -> Result<u32, crate::error::TreeError<K>> {
        use crate::error::TreeError;

        let node = match node {
            None => return Ok(0),
            Some(node) => node,
        };
        if let Some(lo) = lower {
            if &node.key <= lo {
                return Err(TreeError::OrderViolation {
                    key: node.key.clone(),
                    side: "left",
                });
            }
        }
        if let Some(hi) = upper {
            if &node.key >= hi {
                return Err(TreeError::OrderViolation {
                    key: node.key.clone(),
                    side: "right",
                });
            }
        }
        let h_l = Self::check_subtree(node.left.as_deref(), lower, Some(&node.key))?;
        let h_r = Self::check_subtree(node.right.as_deref(), Some(&node.key), upper)?;
        if (h_l as i64 - h_r as i64).abs() > 1 {
            return Err(TreeError::BalanceViolation {
                key: node.key.clone(),
            });
        }
        let expected = 1 + h_l.max(h_r);
        if node.height != expected {
            return Err(TreeError::HeightMismatch {
                key: node.key.clone(),
                cached: node.height,
                actual: expected,
            });
        }
        Ok(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_roundtrips() {
        let mut tree = SequentialAvlMap::new();
        assert_eq!(tree.put(5, "five"), None);
        assert_eq!(tree.put(3, "three"), None);
        assert_eq!(tree.put(5, "FIVE"), Some("five"));
        assert_eq!(tree.get(&5), Some(&"FIVE"));
        assert_eq!(tree.get(&3), Some(&"three"));
        assert_eq!(tree.get(&9), None);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn remove_absent_key_is_a_no_op() {
        let mut tree: SequentialAvlMap<i32, i32> = SequentialAvlMap::new();
        tree.put(1, 1);
        assert_eq!(tree.remove(&42), None);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn remove_drops_len_and_value() {
        let mut tree = SequentialAvlMap::new();
        tree.put(1, "a");
        tree.put(2, "b");
        assert_eq!(tree.remove(&1), Some("a"));
        assert_eq!(tree.get(&1), None);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn sequential_insertion_stays_height_balanced() {
        let mut tree = SequentialAvlMap::new();
        for i in 0..255u32 {
            tree.put(i, i);
        }
        // A strict AVL tree of n nodes has height <= 1.44 * log2(n+2).
        let bound = (1.44 * ((tree.len() as f64) + 2.0).log2()).ceil() as u32;
        assert!(tree.height() <= bound, "height {} exceeds bound {}", tree.height(), bound);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn min_and_max_track_the_spine() {
        let mut tree = SequentialAvlMap::new();
        for i in [5, 1, 9, 3, 7] {
            tree.put(i, i);
        }
        assert_eq!(tree.min(), Some(&1));
        assert_eq!(tree.max(), Some(&9));
    }

    #[test]
    fn two_child_removal_promotes_from_the_taller_side() {
        let mut tree = SequentialAvlMap::new();
        for i in [5, 2, 8, 1, 3, 7, 9] {
            tree.put(i, i);
        }
        assert_eq!(tree.remove(&5), Some(5));
        tree.check_invariants().unwrap();
        for i in [2, 8, 1, 3, 7, 9] {
            assert_eq!(tree.get(&i), Some(&i));
        }
        assert_eq!(tree.get(&5), None);
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn random_insert_remove_mirrors_a_btreemap_oracle() {
        use std::collections::BTreeMap;

        let mut tree = SequentialAvlMap::new();
        let mut oracle = BTreeMap::new();
        // Deterministic pseudo-random sequence, no external RNG needed.
        let mut state: u64 = 0x2545F4914F6CDD1D;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 200) as i32
        };
        for _ in 0..3000 {
            let key = next();
            if next() % 2 == 0 {
                assert_eq!(tree.put(key, key), oracle.insert(key, key));
            } else {
                assert_eq!(tree.remove(&key), oracle.remove(&key));
            }
        }
        tree.check_invariants().unwrap();
        crate::map::test_support::assert_matches_oracle(&tree, &oracle);
    }

    #[test]
    fn to_string_is_parenthesized_preorder() {
        let mut tree = SequentialAvlMap::new();
        tree.put(2, "b");
        tree.put(1, "a");
        tree.put(3, "c");
        assert_eq!(tree.to_string(), "(2 (1) (3))");
    }
}
