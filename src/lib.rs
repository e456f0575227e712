//! A concurrent, ordered, in-memory key-value map implemented as a
//! relaxed-balance AVL tree (Bronson, Casper, Chafi, Olukotun, "A Practical
//! Concurrent Binary Search Tree", PPoPP 2010): fine-grained per-node locks
//! serialize writers, while readers never block, validating an optimistic
//! version word instead.
//!
//! [`ConcurrentAvlMap`] is the concurrent map. [`SequentialAvlMap`] is a
//! plain single-threaded AVL sharing its rotation geometry and external
//! contract, for callers that don't need the concurrency machinery.

mod concurrent;
#[cfg(test)]
mod error;
mod map;
mod sequential;

pub use concurrent::ConcurrentAvlMap;
pub use map::OrderedMap;
pub use sequential::SequentialAvlMap;
