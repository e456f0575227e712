//! Node layout for the concurrent tree.
//!
//! The sentinel root holder is an ordinary `Node` whose `key` is `None` and
//! whose `right` edge is the real tree root — mirroring the original
//! prototype's `self.root = Node(None)`, which is why the holder can reuse
//! every locking/linking primitive a normal node uses.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam_epoch::{Atomic, Guard, Shared};
use parking_lot::Mutex;

use super::version::VersionCell;

/// Which child slot an edge occupies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Dir {
    Left,
    Right,
}

impl Dir {
    /// `key.cmp(node.key)` translated into a traversal direction. `Equal`
    /// has no direction and must be handled by the caller before reaching
    /// here.
    pub(crate) fn from_cmp(cmp: std::cmp::Ordering) -> Dir {
        match cmp {
            std::cmp::Ordering::Less => Dir::Left,
            std::cmp::Ordering::Greater => Dir::Right,
            std::cmp::Ordering::Equal => unreachable!("Equal has no traversal direction"),
        }
    }
}

pub(crate) struct Node<K, V> {
    /// `None` only for the sentinel holder.
    pub(crate) key: Option<K>,
    pub(crate) value: ArcSwapOption<V>,
    pub(crate) height: AtomicU32,
    /// Advisory back-reference, re-validated under `parent`'s lock before
    /// any use that would break correctness on staleness. Carries no
    /// reclamation ownership — ownership is established solely by whoever
    /// calls `guard.defer_destroy`.
    pub(crate) parent: Atomic<Node<K, V>>,
    pub(crate) left: Atomic<Node<K, V>>,
    pub(crate) right: Atomic<Node<K, V>>,
    pub(crate) version: VersionCell,
    pub(crate) lock: Mutex<()>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn holder() -> Self {
        Node {
            key: None,
            value: ArcSwapOption::from(None),
            height: AtomicU32::new(0),
            parent: Atomic::null(),
            left: Atomic::null(),
            right: Atomic::null(),
            version: VersionCell::new(),
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn new_leaf(key: K, value: V) -> Self {
        Node {
            key: Some(key),
            value: ArcSwapOption::from(Some(Arc::new(value))),
            height: AtomicU32::new(1),
            parent: Atomic::null(),
            left: Atomic::null(),
            right: Atomic::null(),
            version: VersionCell::new(),
            lock: Mutex::new(()),
        }
    }

    #[inline]
    pub(crate) fn child<'g>(&self, dir: Dir, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        match dir {
            Dir::Left => self.left.load(Ordering::Acquire, guard),
            Dir::Right => self.right.load(Ordering::Acquire, guard),
        }
    }

    #[inline]
    pub(crate) fn child_slot(&self, dir: Dir) -> &Atomic<Node<K, V>> {
        match dir {
            Dir::Left => &self.left,
            Dir::Right => &self.right,
        }
    }

    #[inline]
    pub(crate) fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_height(&self, h: u32) {
        self.height.store(h, Ordering::Release);
    }
}

/// Height of a possibly-absent child, as seen through a `Shared` edge.
#[inline]
pub(crate) fn child_height<K, V>(child: Shared<'_, Node<K, V>>) -> u32 {
    if child.is_null() {
        0
    } else {
        unsafe { child.deref() }.height()
    }
}
