//! The concurrent map: search, update, logical/physical deletion, and the
//! bottom-up rebalance driver.
//!
//! Follows Bronson, Casper, Chafi, Olukotun, "A Practical Concurrent Binary
//! Search Tree" (PPoPP 2010), as translated into this crate's node layout
//! (`super::node`) and version-word protocol (`super::version`).

use std::cmp::Ordering as CmpOrdering;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Guard, Owned, Shared};
use crossbeam_utils::Backoff;

use super::node::{child_height, Dir, Node};
use super::version::Version;

/// Bounded spin budget for shrink-wait. Purely a tuning knob; correctness
/// never depends on its value.
const SHRINK_SPIN_BUDGET: u32 = 100;

enum NodeCondition {
    Nothing,
    Unlink,
    Rebalance,
    FixHeight(u32),
}

fn node_condition<K, V>(node: &Node<K, V>, guard: &Guard) -> NodeCondition {
    let left = node.left.load(Ordering::Acquire, guard);
    let right = node.right.load(Ordering::Acquire, guard);
    if (left.is_null() || right.is_null()) && node.value.load_full().is_none() {
        return NodeCondition::Unlink;
    }
    let h_n = node.height();
    let h_l = child_height(left);
    let h_r = child_height(right);
    if diff(h_l, h_r) > 1 {
        return NodeCondition::Rebalance;
    }
    let h_repl = 1 + h_l.max(h_r);
    if h_n == h_repl {
        NodeCondition::Nothing
    } else {
        NodeCondition::FixHeight(h_repl)
    }
}

#[inline]
fn diff(a: u32, b: u32) -> i64 {
    (a as i64 - b as i64).abs()
}

/// Waits for `node`'s version to move past `observed`, which was seen with
/// `shrinking` or `unlinked` set. Spins briefly, then falls back to
/// acquiring and releasing `node`'s lock to piggy-back on the writer's
/// release barrier.
fn shrink_wait<K, V>(node: &Node<K, V>, observed: Version) {
    if !observed.is_shrinking() {
        // Already unlinked with no shrink in progress: nothing to wait for.
        return;
    }
    let backoff = Backoff::new();
    for _ in 0..SHRINK_SPIN_BUDGET {
        if node.version.load() != observed {
            return;
        }
        backoff.spin();
    }
    log::trace!("shrink-wait falling back to lock/unlock");
    let _guard = node.lock.lock();
    drop(_guard);
    debug_assert_ne!(
        node.version.load(),
        observed,
        "woke from shrink-wait but version did not advance"
    );
}

/// A concurrent, ordered key-value map implemented as a relaxed-balance AVL
/// tree.
pub struct ConcurrentAvlMap<K, V> {
    holder: Box<Node<K, V>>,
    len: AtomicUsize,
}

impl<K, V> Default for ConcurrentAvlMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ConcurrentAvlMap<K, V> {
    pub fn new() -> Self {
        Self {
            holder: Box::new(Node::holder()),
            len: AtomicUsize::new(0),
        }
    }

    /// A non-owning, non-reclaimed view of the sentinel holder, valid for as
    /// long as `self` is alive (the holder is never passed to
    /// `guard.defer_destroy`).
    fn holder_shared<'g>(&self) -> Shared<'g, Node<K, V>> {
        unsafe { Shared::from(self.holder.as_ref() as *const Node<K, V>) }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached height of the root, or 0 for an empty tree.
    pub fn height(&self) -> u32 {
        let guard = &epoch::pin();
        let root = self.holder.right.load(Ordering::Acquire, guard);
        child_height(root)
    }
}

impl<K, V> ConcurrentAvlMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<V> {
        let guard = &epoch::pin();
        loop {
            let right = self.holder.right.load(Ordering::Acquire, guard);
            if right.is_null() {
                return None;
            }
            let right_ref = unsafe { right.deref() };
            let cmp = key.cmp(right_ref.key.as_ref().expect("non-holder node has a key"));
            if cmp == CmpOrdering::Equal {
                return right_ref.value.load_full().map(|v| (*v).clone());
            }
            let v = right_ref.version.load();
            if v.is_shrinking() || v.is_unlinked() {
                shrink_wait(right_ref, v);
                continue;
            }
            if right != self.holder.right.load(Ordering::Acquire, guard) {
                continue;
            }
            match self.attempt_get(key, right_ref, Dir::from_cmp(cmp), v, guard) {
                Some(result) => return result,
                None => continue,
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn attempt_get(
        &self,
        key: &K,
        node: &Node<K, V>,
        dir: Dir,
        node_v: Version,
        guard: &Guard,
    ) -> Option<Option<V>> {
        loop {
            let child = node.child(dir, guard);
            if child.is_null() {
                if node.version.load() != node_v {
                    log::trace!("get: retry-up (absent child, node version moved)");
                    return None;
                }
                return Some(None);
            }
            let child_ref = unsafe { child.deref() };
            let cmp = key.cmp(child_ref.key.as_ref().expect("non-holder node has a key"));
            if cmp == CmpOrdering::Equal {
                return Some(child_ref.value.load_full().map(|v| (*v).clone()));
            }
            let child_v = child_ref.version.load();
            if child_v.is_shrinking() || child_v.is_unlinked() {
                shrink_wait(child_ref, child_v);
                if node.version.load() != node_v {
                    return None;
                }
                continue;
            }
            if child != node.child(dir, guard) {
                continue;
            }
            if node.version.load() != node_v {
                return None;
            }
            match self.attempt_get(key, child_ref, Dir::from_cmp(cmp), child_v, guard) {
                Some(result) => return Some(result),
                None => continue,
            }
        }
    }

    /// `put`: returns the previous value, or `None` if the key was absent.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.update(key, Some(value))
    }

    /// `remove`: returns the previous value, or `None` if the key was
    /// already absent. A no-op on an absent key, observable only through the
    /// `None` return.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.update(key.clone(), None)
    }

    fn update(&self, key: K, new_value: Option<V>) -> Option<V> {
        let guard = &epoch::pin();
        let prev = self.do_update(key, new_value.clone(), guard);
        match (&prev, &new_value) {
            (None, Some(_)) => {
                self.len.fetch_add(1, Ordering::AcqRel);
            }
            (Some(_), None) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
        prev
    }

    fn do_update(&self, key: K, new_value: Option<V>, guard: &Guard) -> Option<V> {
        loop {
            let right = self.holder.right.load(Ordering::Acquire, guard);
            if right.is_null() {
                match &new_value {
                    None => return None,
                    Some(v) => {
                        if self.attempt_insert_into_empty(key.clone(), v.clone(), guard) {
                            return None;
                        }
                        continue;
                    }
                }
            }
            let right_ref = unsafe { right.deref() };
            let v = right_ref.version.load();
            if v.is_shrinking() || v.is_unlinked() {
                shrink_wait(right_ref, v);
                continue;
            }
            if right != self.holder.right.load(Ordering::Acquire, guard) {
                continue;
            }
            match self.attempt_update(
                &key,
                new_value.clone(),
                self.holder_shared(),
                right,
                v,
                guard,
            ) {
                Some(result) => return result,
                None => continue,
            }
        }
    }

    fn attempt_insert_into_empty(&self, key: K, value: V, guard: &Guard) -> bool {
        let _lock = self.holder.lock.lock();
        if !self.holder.right.load(Ordering::Acquire, guard).is_null() {
            return false;
        }
        let mut leaf = Owned::new(Node::new_leaf(key, value));
        leaf.parent.store(self.holder_shared(), Ordering::Release);
        self.holder.right.store(leaf, Ordering::Release);
        true
    }

    fn attempt_update<'g>(
        &self,
        key: &K,
        new_value: Option<V>,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        node_v: Version,
        guard: &'g Guard,
    ) -> Option<Option<V>> {
        let node_ref = unsafe { node.deref() };
        let cmp = key.cmp(node_ref.key.as_ref().expect("non-holder node has a key"));
        if cmp == CmpOrdering::Equal {
            return self.attempt_node_update(new_value, parent, node, guard);
        }
        let dir = Dir::from_cmp(cmp);
        loop {
            let child = node_ref.child(dir, guard);
            if node_ref.version.load() != node_v {
                log::trace!("update: retry-up (node version moved)");
                return None;
            }
            if child.is_null() {
                match &new_value {
                    None => return Some(None),
                    Some(v) => {
                        let damaged = {
                            let _lock = node_ref.lock.lock();
                            if node_ref.version.load() != node_v {
                                return None;
                            }
                            if !node_ref.child(dir, guard).is_null() {
                                None // lost a race with a concurrent insert; retry locally
                            } else {
                                let mut leaf = Owned::new(Node::new_leaf(key.clone(), v.clone()));
                                leaf.parent.store(node, Ordering::Release);
                                node_ref.child_slot(dir).store(leaf, Ordering::Release);
                                Some(self.fix_height_start(node, node_ref, guard))
                            }
                        };
                        match damaged {
                            Some(start) => {
                                self.fix_height_and_rebalance(start, guard);
                                return Some(None);
                            }
                            None => continue,
                        }
                    }
                }
            } else {
                let child_ref = unsafe { child.deref() };
                let child_v = child_ref.version.load();
                if child_v.is_shrinking() || child_v.is_unlinked() {
                    shrink_wait(child_ref, child_v);
                    continue;
                }
                if child != node_ref.child(dir, guard) {
                    continue;
                }
                if node_ref.version.load() != node_v {
                    return None;
                }
                match self.attempt_update(key, new_value.clone(), node, child, child_v, guard) {
                    Some(result) => return Some(result),
                    None => continue,
                }
            }
        }
    }

    /// Computes the starting point for the bottom-up walk right after
    /// linking a new leaf under `node`'s lock (still held by the caller).
    fn fix_height_start<'g>(
        &self,
        node: Shared<'g, Node<K, V>>,
        node_ref: &Node<K, V>,
        guard: &'g Guard,
    ) -> Shared<'g, Node<K, V>> {
        match node_condition(node_ref, guard) {
            NodeCondition::FixHeight(h) => {
                node_ref.set_height(h);
                node_ref.parent.load(Ordering::Acquire, guard)
            }
            NodeCondition::Nothing => Shared::null(),
            // A single insert can, at most, make its parent's own balance
            // factor exceed one; walk from `node` itself so the dispatcher
            // re-evaluates it fresh rather than skipping the repair.
            NodeCondition::Rebalance | NodeCondition::Unlink => node,
        }
    }

    fn same_parent(&self, node: &Node<K, V>, parent: Shared<'_, Node<K, V>>, guard: &Guard) -> bool {
        node.parent.load(Ordering::Acquire, guard) == parent
    }

    fn attempt_node_update<'g>(
        &self,
        new_value: Option<V>,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) -> Option<Option<V>> {
        let node_ref = unsafe { node.deref() };
        if new_value.is_none() && node_ref.value.load_full().is_none() {
            return Some(None);
        }
        let left_absent = node_ref.left.load(Ordering::Acquire, guard).is_null();
        let right_absent = node_ref.right.load(Ordering::Acquire, guard).is_null();
        if new_value.is_none() && (left_absent || right_absent) {
            let parent_ref = unsafe { parent.deref() };
            let _parent_lock = parent_ref.lock.lock();
            if parent_ref.version.load().is_unlinked() || !self.same_parent(node_ref, parent, guard)
            {
                return None;
            }
            let prev;
            {
                let _node_lock = node_ref.lock.lock();
                prev = node_ref.value.load_full();
                if prev.is_none() {
                    return Some(None);
                }
                if !self.attempt_unlink(parent, node, guard) {
                    return None;
                }
                log::debug!("physically unlinked a node during remove");
            }
            let damaged = self.fix_height_start(parent, parent_ref, guard);
            self.fix_height_and_rebalance(damaged, guard);
            return Some(Some((*prev.unwrap()).clone()));
        }
        let _node_lock = node_ref.lock.lock();
        if node_ref.version.load().is_unlinked() {
            return None;
        }
        let prev = node_ref.value.load_full();
        if new_value.is_none() {
            let left_absent = node_ref.left.load(Ordering::Acquire, guard).is_null();
            let right_absent = node_ref.right.load(Ordering::Acquire, guard).is_null();
            if left_absent || right_absent {
                // Unlink became possible while we waited for the lock.
                return None;
            }
        }
        node_ref
            .value
            .store(new_value.map(std::sync::Arc::new));
        Some(prev.map(|v| (*v).clone()))
    }

    /// Pre: both `parent` and `node` locked by the caller, `node.value` is
    /// absent, and at least one of `node`'s children is absent.
    fn attempt_unlink<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) -> bool {
        let parent_ref = unsafe { parent.deref() };
        let node_ref = unsafe { node.deref() };
        let parent_left = parent_ref.left.load(Ordering::Acquire, guard);
        let parent_right = parent_ref.right.load(Ordering::Acquire, guard);
        if parent_left != node && parent_right != node {
            return false;
        }
        let left = node_ref.left.load(Ordering::Acquire, guard);
        let right = node_ref.right.load(Ordering::Acquire, guard);
        if !left.is_null() && !right.is_null() {
            return false;
        }
        let splice = if !left.is_null() { left } else { right };
        if parent_left == node {
            parent_ref.left.store(splice, Ordering::Release);
        } else {
            parent_ref.right.store(splice, Ordering::Release);
        }
        if !splice.is_null() {
            unsafe { splice.deref() }.parent.store(parent, Ordering::Release);
        }
        node_ref.version.mark_unlinked();
        node_ref.value.store(None);
        unsafe { guard.defer_destroy(node) };
        true
    }

    /// Bottom-up repair: climbs from `node` via parent links, refreshing
    /// heights and rotating as needed. Not a coroutine — a plain loop
    /// re-acquiring locks per step.
    fn fix_height_and_rebalance<'g>(&self, mut node: Shared<'g, Node<K, V>>, guard: &'g Guard) {
        loop {
            if node.is_null() {
                return;
            }
            let node_ref = unsafe { node.deref() };
            let parent = node_ref.parent.load(Ordering::Acquire, guard);
            if parent.is_null() {
                return;
            }
            let condition = node_condition(node_ref, guard);
            if node_ref.version.load().is_unlinked() {
                return;
            }
            match condition {
                NodeCondition::Nothing => return,
                NodeCondition::FixHeight(_) => {
                    let _lock = node_ref.lock.lock();
                    match node_condition(node_ref, guard) {
                        NodeCondition::FixHeight(h) => {
                            node_ref.set_height(h);
                            drop(_lock);
                            node = node_ref.parent.load(Ordering::Acquire, guard);
                        }
                        NodeCondition::Nothing => return,
                        NodeCondition::Rebalance | NodeCondition::Unlink => {
                            // Condition changed under lock; reprocess this
                            // node on the next iteration.
                        }
                    }
                }
                NodeCondition::Unlink | NodeCondition::Rebalance => {
                    let parent_ref = unsafe { parent.deref() };
                    let _parent_lock = parent_ref.lock.lock();
                    if !parent_ref.version.load().is_unlinked()
                        && self.same_parent(node_ref, parent, guard)
                    {
                        let _node_lock = node_ref.lock.lock();
                        node = self.rebalance_node(parent, node, guard);
                    }
                    // else: parent changed concurrently; re-derive it above.
                }
            }
        }
    }

    /// Pre: `parent` and `node` locked by the caller.
    fn rebalance_node<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, Node<K, V>> {
        let node_ref = unsafe { node.deref() };
        let left = node_ref.left.load(Ordering::Acquire, guard);
        let right = node_ref.right.load(Ordering::Acquire, guard);
        if (left.is_null() || right.is_null()) && node_ref.value.load_full().is_none() {
            if self.attempt_unlink(parent, node, guard) {
                let parent_ref = unsafe { parent.deref() };
                return self.fix_height_start(parent, parent_ref, guard);
            }
            return node;
        }
        let h_n = node_ref.height();
        let h_l = child_height(left);
        let h_r = child_height(right);
        if (h_l as i64) - (h_r as i64) < -1 {
            log::trace!("rebalance: left-heavy on the right side");
            self.rebalance_left(parent, node, right, h_l, guard)
        } else if (h_l as i64) - (h_r as i64) > 1 {
            log::trace!("rebalance: right-heavy on the left side");
            self.rebalance_right(parent, node, left, h_r, guard)
        } else {
            let h_repl = 1 + h_l.max(h_r);
            if h_n == h_repl {
                Shared::null()
            } else {
                node_ref.set_height(h_repl);
                parent
            }
        }
    }

    fn rebalance_left<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        right: Shared<'g, Node<K, V>>,
        h_l0: u32,
        guard: &'g Guard,
    ) -> Shared<'g, Node<K, V>> {
        let right_ref = unsafe { right.deref() };
        let _right_lock = right_ref.lock.lock();
        let h_r = right_ref.height();
        if (h_l0 as i64) - (h_r as i64) >= -1 {
            return node;
        }
        let right_left = right_ref.left.load(Ordering::Acquire, guard);
        let right_right = right_ref.right.load(Ordering::Acquire, guard);
        let h_rl0 = child_height(right_left);
        let h_rr0 = child_height(right_right);
        if h_rr0 >= h_rl0 {
            return self.rotate_left(parent, node, h_l0, right, right_left, h_rl0, h_rr0, guard);
        }
        {
            let right_left_ref = unsafe { right_left.deref() };
            let _right_left_lock = right_left_ref.lock.lock();
            let h_rl = right_left_ref.height();
            if h_rr0 >= h_rl {
                return self.rotate_left(parent, node, h_l0, right, right_left, h_rl, h_rr0, guard);
            }
            let h_rlr = child_height(right_left_ref.right.load(Ordering::Acquire, guard));
            if diff(h_rr0, h_rlr) <= 1
                && !((h_rr0 == 0 || h_rlr == 0) && right_ref.value.load_full().is_none())
            {
                return self.rotate_left_over_right(
                    parent, node, h_l0, right, right_left, h_rr0, h_rlr, guard,
                );
            }
        }
        self.rebalance_right(node, right, right_left, h_rr0, guard)
    }

    fn rebalance_right<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        left: Shared<'g, Node<K, V>>,
        h_r0: u32,
        guard: &'g Guard,
    ) -> Shared<'g, Node<K, V>> {
        let left_ref = unsafe { left.deref() };
        let _left_lock = left_ref.lock.lock();
        let h_l = left_ref.height();
        if (h_l as i64) - (h_r0 as i64) <= 1 {
            return node;
        }
        let left_right = left_ref.right.load(Ordering::Acquire, guard);
        let left_left = left_ref.left.load(Ordering::Acquire, guard);
        let h_lr0 = child_height(left_right);
        let h_ll0 = child_height(left_left);
        if h_ll0 >= h_lr0 {
            return self.rotate_right(parent, node, h_r0, left, left_right, h_lr0, h_ll0, guard);
        }
        {
            let left_right_ref = unsafe { left_right.deref() };
            let _left_right_lock = left_right_ref.lock.lock();
            let h_lr = left_right_ref.height();
            if h_ll0 >= h_lr {
                return self.rotate_right(parent, node, h_r0, left, left_right, h_lr, h_ll0, guard);
            }
            let h_lrl = child_height(left_right_ref.left.load(Ordering::Acquire, guard));
            if diff(h_ll0, h_lrl) <= 1
                && !((h_ll0 == 0 || h_lrl == 0) && left_ref.value.load_full().is_none())
            {
                return self.rotate_right_over_left(
                    parent, node, h_r0, left, left_right, h_ll0, h_lrl, guard,
                );
            }
        }
        self.rebalance_left(node, left, left_right, h_ll0, guard)
    }

    /// Pre: `parent`, `node`, and `right` locked by the caller.
    #[allow(clippy::too_many_arguments)]
    fn rotate_left<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        h_l: u32,
        right: Shared<'g, Node<K, V>>,
        right_left: Shared<'g, Node<K, V>>,
        h_rl: u32,
        h_rr: u32,
        guard: &'g Guard,
    ) -> Shared<'g, Node<K, V>> {
        let node_ref = unsafe { node.deref() };
        let right_ref = unsafe { right.deref() };
        let parent_ref = unsafe { parent.deref() };
        let parent_left = parent_ref.left.load(Ordering::Acquire, guard);

        node_ref.version.begin_shrink();

        node_ref.right.store(right_left, Ordering::Release);
        if !right_left.is_null() {
            unsafe { right_left.deref() }.parent.store(node, Ordering::Release);
        }
        right_ref.left.store(node, Ordering::Release);
        node_ref.parent.store(right, Ordering::Release);
        if parent_left == node {
            parent_ref.left.store(right, Ordering::Release);
        } else {
            parent_ref.right.store(right, Ordering::Release);
        }
        right_ref.parent.store(parent, Ordering::Release);

        let h_n_repl = 1 + h_l.max(h_rl);
        node_ref.set_height(h_n_repl);
        right_ref.set_height(1 + h_rr.max(h_n_repl));

        node_ref.version.end_shrink();

        if diff(h_rl, h_l) > 1
            || ((right_left.is_null() || h_l == 0) && node_ref.value.load_full().is_none())
        {
            return node;
        }
        if diff(h_rr, h_n_repl) > 1 || (h_rr == 0 && right_ref.value.load_full().is_none()) {
            return right;
        }
        parent
    }

    #[allow(clippy::too_many_arguments)]
    fn rotate_right<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        h_r: u32,
        left: Shared<'g, Node<K, V>>,
        left_right: Shared<'g, Node<K, V>>,
        h_lr: u32,
        h_ll: u32,
        guard: &'g Guard,
    ) -> Shared<'g, Node<K, V>> {
        let node_ref = unsafe { node.deref() };
        let left_ref = unsafe { left.deref() };
        let parent_ref = unsafe { parent.deref() };
        let parent_left = parent_ref.left.load(Ordering::Acquire, guard);

        node_ref.version.begin_shrink();

        node_ref.left.store(left_right, Ordering::Release);
        if !left_right.is_null() {
            unsafe { left_right.deref() }.parent.store(node, Ordering::Release);
        }
        left_ref.right.store(node, Ordering::Release);
        node_ref.parent.store(left, Ordering::Release);
        if parent_left == node {
            parent_ref.left.store(left, Ordering::Release);
        } else {
            parent_ref.right.store(left, Ordering::Release);
        }
        left_ref.parent.store(parent, Ordering::Release);

        let h_n_repl = 1 + h_r.max(h_lr);
        node_ref.set_height(h_n_repl);
        left_ref.set_height(1 + h_ll.max(h_n_repl));

        node_ref.version.end_shrink();

        if diff(h_lr, h_r) > 1
            || ((left_right.is_null() || h_r == 0) && node_ref.value.load_full().is_none())
        {
            return node;
        }
        if diff(h_ll, h_n_repl) > 1 || (h_ll == 0 && left_ref.value.load_full().is_none()) {
            return left;
        }
        parent
    }

    #[allow(clippy::too_many_arguments)]
    fn rotate_left_over_right<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        h_l: u32,
        right: Shared<'g, Node<K, V>>,
        right_left: Shared<'g, Node<K, V>>,
        h_rr: u32,
        h_rlr: u32,
        guard: &'g Guard,
    ) -> Shared<'g, Node<K, V>> {
        let node_ref = unsafe { node.deref() };
        let right_ref = unsafe { right.deref() };
        let right_left_ref = unsafe { right_left.deref() };
        let parent_ref = unsafe { parent.deref() };

        let parent_left = parent_ref.left.load(Ordering::Acquire, guard);
        let rll = right_left_ref.left.load(Ordering::Acquire, guard);
        let rlr = right_left_ref.right.load(Ordering::Acquire, guard);
        let h_rll = child_height(rll);

        node_ref.version.begin_shrink();
        right_ref.version.begin_shrink();

        node_ref.right.store(rll, Ordering::Release);
        if !rll.is_null() {
            unsafe { rll.deref() }.parent.store(node, Ordering::Release);
        }
        right_ref.left.store(rlr, Ordering::Release);
        if !rlr.is_null() {
            unsafe { rlr.deref() }.parent.store(right, Ordering::Release);
        }
        right_left_ref.right.store(right, Ordering::Release);
        right_ref.parent.store(right_left, Ordering::Release);
        right_left_ref.left.store(node, Ordering::Release);
        node_ref.parent.store(right_left, Ordering::Release);
        if parent_left != node {
            parent_ref.right.store(right_left, Ordering::Release);
        } else {
            parent_ref.left.store(right_left, Ordering::Release);
        }
        right_left_ref.parent.store(parent, Ordering::Release);

        let h_n_repl = 1 + h_rll.max(h_l);
        node_ref.set_height(h_n_repl);
        let h_r_repl = 1 + h_rr.max(h_rlr);
        right_ref.set_height(h_r_repl);
        right_left_ref.set_height(1 + h_n_repl.max(h_r_repl));

        node_ref.version.end_shrink();
        right_ref.version.end_shrink();

        if diff(h_rll, h_l) > 1
            || ((rll.is_null() || h_l == 0) && node_ref.value.load_full().is_none())
        {
            return node;
        }
        if diff(h_r_repl, h_n_repl) > 1 {
            return right_left;
        }
        parent
    }

    #[allow(clippy::too_many_arguments)]
    fn rotate_right_over_left<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        node: Shared<'g, Node<K, V>>,
        h_r: u32,
        left: Shared<'g, Node<K, V>>,
        left_right: Shared<'g, Node<K, V>>,
        h_ll: u32,
        h_lrl: u32,
        guard: &'g Guard,
    ) -> Shared<'g, Node<K, V>> {
        let node_ref = unsafe { node.deref() };
        let left_ref = unsafe { left.deref() };
        let left_right_ref = unsafe { left_right.deref() };
        let parent_ref = unsafe { parent.deref() };

        let parent_left = parent_ref.left.load(Ordering::Acquire, guard);
        let lrl = left_right_ref.left.load(Ordering::Acquire, guard);
        let lrr = left_right_ref.right.load(Ordering::Acquire, guard);
        let h_lrr = child_height(lrr);

        node_ref.version.begin_shrink();
        left_ref.version.begin_shrink();

        node_ref.left.store(lrr, Ordering::Release);
        if !lrr.is_null() {
            unsafe { lrr.deref() }.parent.store(node, Ordering::Release);
        }
        left_ref.right.store(lrl, Ordering::Release);
        if !lrl.is_null() {
            unsafe { lrl.deref() }.parent.store(left, Ordering::Release);
        }
        left_right_ref.left.store(left, Ordering::Release);
        left_ref.parent.store(left_right, Ordering::Release);
        left_right_ref.right.store(node, Ordering::Release);
        node_ref.parent.store(left_right, Ordering::Release);
        if parent_left == node {
            parent_ref.left.store(left_right, Ordering::Release);
        } else {
            parent_ref.right.store(left_right, Ordering::Release);
        }
        left_right_ref.parent.store(parent, Ordering::Release);

        let h_n_repl = 1 + h_lrr.max(h_r);
        node_ref.set_height(h_n_repl);
        let h_l_repl = 1 + h_ll.max(h_lrl);
        left_ref.set_height(h_l_repl);
        left_right_ref.set_height(1 + h_n_repl.max(h_l_repl));

        node_ref.version.end_shrink();
        left_ref.version.end_shrink();

        if diff(h_lrr, h_r) > 1
            || ((lrr.is_null() || h_r == 0) && node_ref.value.load_full().is_none())
        {
            return node;
        }
        if diff(h_l_repl, h_n_repl) > 1 {
            return left_right;
        }
        parent
    }

    /// Key of the minimum live entry, or `None` if the tree is empty. Just
    /// walks the left spine — a valid BST makes any running-minimum
    /// comparison along the way redundant.
    pub fn min(&self) -> Option<K> {
        let guard = &epoch::pin();
        let mut current = self.holder.right.load(Ordering::Acquire, guard);
        if current.is_null() {
            return None;
        }
        loop {
            let node = unsafe { current.deref() };
            let left = node.left.load(Ordering::Acquire, guard);
            if left.is_null() {
                return node.key.clone();
            }
            current = left;
        }
    }

    /// Key of the maximum live entry, or `None` if the tree is empty.
    pub fn max(&self) -> Option<K> {
        let guard = &epoch::pin();
        let mut current = self.holder.right.load(Ordering::Acquire, guard);
        if current.is_null() {
            return None;
        }
        loop {
            let node = unsafe { current.deref() };
            let right = node.right.load(Ordering::Acquire, guard);
            if right.is_null() {
                return node.key.clone();
            }
            current = right;
        }
    }
}

impl<K, V> ConcurrentAvlMap<K, V>
where
    K: Ord + Clone + std::fmt::Display,
    V: Clone,
{
    /// Parenthesized pre-order serialization, for tests. Must be called
    /// under a global quiescence (or from a single thread) — concurrent
    /// structural changes during the walk can produce a torn view.
    pub fn to_string(&self) -> String {
        let guard = &epoch::pin();
        let mut out = String::new();
        self.write_subtree(self.holder.right.load(Ordering::Acquire, guard), guard, &mut out);
        out
    }

    fn write_subtree(&self, node: Shared<'_, Node<K, V>>, guard: &Guard, out: &mut String) {
        if node.is_null() {
            out.push_str("()");
            return;
        }
        let node_ref = unsafe { node.deref() };
        let _ = write!(out, "({}", node_ref.key.as_ref().unwrap());
        let left = node_ref.left.load(Ordering::Acquire, guard);
        let right = node_ref.right.load(Ordering::Acquire, guard);
        if !left.is_null() || !right.is_null() {
            out.push(' ');
            self.write_subtree(left, guard, out);
            out.push(' ');
            self.write_subtree(right, guard, out);
        }
        out.push(')');
    }
}

impl<K, V> Drop for ConcurrentAvlMap<K, V> {
    fn drop(&mut self) {
        // `&mut self`: no concurrent readers or writers can be active, so
        // nodes can be reclaimed directly instead of via deferred destroy.
        let guard = unsafe { epoch::unprotected() };
        let mut stack = vec![self.holder.right.load(Ordering::Relaxed, guard)];
        while let Some(current) = stack.pop() {
            if current.is_null() {
                continue;
            }
            let owned = unsafe { current.into_owned() };
            stack.push(owned.left.load(Ordering::Relaxed, guard));
            stack.push(owned.right.load(Ordering::Relaxed, guard));
        }
    }
}

#[cfg(test)]
impl<K, V> ConcurrentAvlMap<K, V>
where
    K: Ord + Clone + std::fmt::Debug,
{
    /// Walks the whole tree checking BST order, AVL balance, and cached
    /// heights. Only safe to call at quiescence (no concurrent structural
    /// changes in flight) — exactly like `to_string`.
    pub(crate) fn check_invariants(&self) -> Result<(), crate::error::TreeError<K>> {
        let guard = unsafe { epoch::unprotected() };
        self.check_subtree(self.holder.right.load(Ordering::Acquire, guard), None, None, guard)?;
        Ok(())
    }

    fn check_subtree<'g>(
        &self,
        node: Shared<'g, Node<K, V>>,
        lower: Option<&K>,
        upper: Option<&K>,
        guard: &'g Guard,
    ) -> Result<u32, crate::error::TreeError<K>> {
        use crate::error::TreeError;

        if node.is_null() {
            return Ok(0);
        }
        let node_ref = unsafe { node.deref() };
        if node_ref.version.load().is_unlinked() {
            return Err(TreeError::UnlinkedButReachable {
                key: node_ref.key.clone().expect("non-holder node has a key"),
            });
        }
        let key = node_ref.key.as_ref().expect("non-holder node has a key");
        if let Some(lo) = lower {
            if key <= lo {
                return Err(TreeError::OrderViolation {
                    key: key.clone(),
                    side: "left",
                });
            }
        }
        if let Some(hi) = upper {
            if key >= hi {
                return Err(TreeError::OrderViolation {
                    key: key.clone(),
                    side: "right",
                });
            }
        }
        let left = node_ref.left.load(Ordering::Acquire, guard);
        let right = node_ref.right.load(Ordering::Acquire, guard);
        let h_l = self.check_subtree(left, lower, Some(key), guard)?;
        let h_r = self.check_subtree(right, Some(key), upper, guard)?;
        if diff(h_l, h_r) > 1 {
            return Err(TreeError::BalanceViolation { key: key.clone() });
        }
        let expected = 1 + h_l.max(h_r);
        if node_ref.height() != expected {
            return Err(TreeError::HeightMismatch {
                key: key.clone(),
                cached: node_ref.height(),
                actual: expected,
            });
        }
        Ok(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[test]
    fn empty_tree_has_no_entries() {
        let tree: ConcurrentAvlMap<i32, i32> = ConcurrentAvlMap::new();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.get(&0), None);
        assert_eq!(tree.min(), None);
        assert_eq!(tree.max(), None);
        assert_eq!(tree.to_string(), "()");
    }

    #[test]
    fn single_node_tree() {
        let tree = ConcurrentAvlMap::new();
        assert_eq!(tree.put(1, "one"), None);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.get(&1), Some("one"));
        assert_eq!(tree.min(), Some(1));
        assert_eq!(tree.max(), Some(1));
        tree.check_invariants().unwrap();
    }

    #[test]
    fn put_returns_previous_value_and_does_not_grow_len() {
        let tree = ConcurrentAvlMap::new();
        assert_eq!(tree.put(1, "one"), None);
        assert_eq!(tree.put(1, "uno"), Some("one"));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&1), Some("uno"));
    }

    #[test]
    fn remove_is_idempotent_and_reports_absence() {
        let tree = ConcurrentAvlMap::new();
        tree.put(1, "one");
        assert_eq!(tree.remove(&1), Some("one"));
        assert_eq!(tree.remove(&1), None);
        assert_eq!(tree.get(&1), None);
        assert!(tree.is_empty());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn ascending_insertion_triggers_rotations_and_stays_balanced() {
        let tree = ConcurrentAvlMap::new();
        for i in 0..2000i32 {
            tree.put(i, i);
        }
        tree.check_invariants().unwrap();
        let bound = (1.44 * ((tree.len() as f64) + 2.0).log2()).ceil() as u32;
        assert!(tree.height() <= bound);
        for i in 0..2000i32 {
            assert_eq!(tree.get(&i), Some(i));
        }
    }

    #[test]
    fn descending_insertion_and_interleaved_removal_stays_balanced() {
        let tree = ConcurrentAvlMap::new();
        for i in (0..1000i32).rev() {
            tree.put(i, i);
        }
        for i in (0..1000i32).step_by(3) {
            tree.remove(&i);
        }
        tree.check_invariants().unwrap();
        for i in 0..1000i32 {
            let expect = if i % 3 == 0 { None } else { Some(i) };
            assert_eq!(tree.get(&i), expect);
        }
    }

    #[test]
    fn to_string_is_parenthesized_preorder() {
        let tree = ConcurrentAvlMap::new();
        tree.put(2, "b");
        tree.put(1, "a");
        tree.put(3, "c");
        assert_eq!(tree.to_string(), "(2 (1) (3))");
    }

    /// Many threads hammer disjoint key ranges through insert, remove, and
    /// get, all against one shared map.
    #[test]
    fn smoke_concurrent_insert_remove_get() {
        let _ = env_logger::try_init();
        const THREADS: i32 = 16;
        const PER_THREAD: i32 = 500;

        let map = &ConcurrentAvlMap::new();

        crossbeam_utils::thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i32> =
                        (0..PER_THREAD).map(|k| k * THREADS + t).collect();
                    use rand::seq::SliceRandom;
                    keys.shuffle(&mut rng);
                    for key in keys {
                        assert_eq!(map.put(key, key * 2), None);
                    }
                });
            }
        })
        .unwrap();

        crossbeam_utils::thread::scope(|s| {
            for t in 0..(THREADS / 2) {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i32> =
                        (0..PER_THREAD).map(|k| k * THREADS + t).collect();
                    use rand::seq::SliceRandom;
                    keys.shuffle(&mut rng);
                    for key in keys {
                        assert_eq!(map.remove(&key), Some(key * 2));
                    }
                });
            }
        })
        .unwrap();

        crossbeam_utils::thread::scope(|s| {
            for t in (THREADS / 2)..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i32> =
                        (0..PER_THREAD).map(|k| k * THREADS + t).collect();
                    use rand::seq::SliceRandom;
                    keys.shuffle(&mut rng);
                    for key in keys {
                        assert_eq!(map.get(&key), Some(key * 2));
                    }
                });
            }
        })
        .unwrap();

        map.check_invariants().unwrap();
        assert_eq!(map.len() as i32, PER_THREAD * (THREADS / 2));
    }

    /// End-to-end stress test: eight threads issue ten thousand randomized
    /// put/remove/get operations, all drawn from the same `[0, 1000)` key
    /// range and guarded by one shared oracle lock, so the same key is
    /// regularly hit by more than one thread at once — the exact
    /// concurrent insert/unlink/rebalance race the per-node locking and
    /// optimistic reads exist to handle.
    #[test]
    fn stress_eight_threads_ten_thousand_ops_against_oracle() {
        let _ = env_logger::try_init();
        const THREADS: i32 = 8;
        const OPS_PER_THREAD: i32 = 10_000;

        let map = &ConcurrentAvlMap::new();
        let oracle = &Mutex::new(BTreeMap::<i32, i32>::new());

        crossbeam_utils::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    use rand::Rng;
                    for _ in 0..OPS_PER_THREAD {
                        let key = rng.gen_range(0..1000);
                        match rng.gen_range(0..3) {
                            0 => {
                                let value = rng.gen_range(0..i32::MAX);
                                let mut oracle = oracle.lock().unwrap();
                                let prev = map.put(key, value);
                                assert_eq!(prev, oracle.insert(key, value));
                            }
                            1 => {
                                let mut oracle = oracle.lock().unwrap();
                                let prev = map.remove(&key);
                                assert_eq!(prev, oracle.remove(&key));
                            }
                            _ => {
                                let oracle = oracle.lock().unwrap();
                                assert_eq!(map.get(&key), oracle.get(&key).copied());
                            }
                        }
                    }
                });
            }
        })
        .unwrap();

        map.check_invariants().unwrap();
        let oracle = oracle.lock().unwrap();
        crate::map::test_support::assert_matches_oracle(map, &oracle);
    }
}
