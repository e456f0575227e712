//! Diagnostics for the structural-invariant checker used by the test suite.
//! Never returned by any public map operation — `get`, `put`, and `remove`
//! stay infallible and `Option`-returning.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError<K: std::fmt::Debug> {
    #[error("BST order violated at key {key:?}: a descendant on the {side} lies on the wrong side")]
    OrderViolation { key: K, side: &'static str },

    #[error("AVL balance violated at key {key:?}: |height(left) - height(right)| > 1")]
    BalanceViolation { key: K },

    #[error("cached height at key {key:?} is {cached}, recomputed height is {actual}")]
    HeightMismatch { key: K, cached: u32, actual: u32 },

    #[error("node at key {key:?} is marked unlinked but still reachable from the root")]
    UnlinkedButReachable { key: K },
}
