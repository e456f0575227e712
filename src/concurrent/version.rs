//! The per-node version word: two live flags (`SHRINKING`, `UNLINKED`), one
//! reserved flag (`GROWING`), and a monotonically increasing change counter,
//! all packed into a single `AtomicU64`.
//!
//! Readers sample a node's version before descending into it and re-check it
//! at every decision point; any change forces a retry. Writers set
//! `SHRINKING` before a rotation removes a reachable position from a node's
//! subtree, clear it after, and always bump the counter on publish so that
//! optimistic readers can never observe an ABA false positive.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct Flags: u64 {
        const SHRINKING = 0b001;
        const UNLINKED  = 0b010;
        /// Reserved for a future growing-phase signal. Mirrors the original
        /// Python prototype, whose `Version.growing` field is also declared
        /// but never set by any operation.
        const GROWING   = 0b100;
    }
}

const FLAG_BITS: u32 = 3;
const FLAG_MASK: u64 = (1 << FLAG_BITS) - 1;

/// An immutable snapshot of a node's version word, comparable for equality.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Version(u64);

impl Version {
    pub fn is_shrinking(self) -> bool {
        Flags::from_bits_truncate(self.0).contains(Flags::SHRINKING)
    }

    pub fn is_unlinked(self) -> bool {
        Flags::from_bits_truncate(self.0).contains(Flags::UNLINKED)
    }

    pub fn counter(self) -> u64 {
        self.0 >> FLAG_BITS
    }
}

/// The mutable version word carried by every node, including the sentinel
/// holder.
#[derive(Debug)]
pub struct VersionCell(AtomicU64);

impl VersionCell {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn load(&self) -> Version {
        Version(self.0.load(Ordering::Acquire))
    }

    /// Sets `SHRINKING`. Callers must already hold this node's lock.
    pub fn begin_shrink(&self) {
        let prev = self.0.load(Ordering::Relaxed);
        debug_assert!(!Flags::from_bits_truncate(prev).contains(Flags::SHRINKING));
        self.0
            .store(prev | Flags::SHRINKING.bits(), Ordering::Release);
    }

    /// Clears `SHRINKING` and bumps the counter, publishing the structural
    /// change. Callers must already hold this node's lock.
    pub fn end_shrink(&self) {
        let prev = self.0.load(Ordering::Relaxed);
        let flags = Flags::from_bits_truncate(prev) & !Flags::SHRINKING;
        let counter = (prev >> FLAG_BITS) + 1;
        self.0
            .store((counter << FLAG_BITS) | flags.bits(), Ordering::Release);
    }

    /// Marks the node permanently unlinked and bumps the counter. Once set,
    /// never cleared.
    pub fn mark_unlinked(&self) {
        let prev = self.0.load(Ordering::Relaxed);
        let counter = (prev >> FLAG_BITS) + 1;
        self.0
            .store((counter << FLAG_BITS) | Flags::UNLINKED.bits(), Ordering::Release);
    }

    #[cfg(test)]
    pub fn raw(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for VersionCell {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
const _: () = assert!(FLAG_MASK == 0b111);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_version_has_no_flags() {
        let v = VersionCell::new();
        let snap = v.load();
        assert!(!snap.is_shrinking());
        assert!(!snap.is_unlinked());
        assert_eq!(snap.counter(), 0);
    }

    #[test]
    fn shrink_cycle_bumps_counter_and_clears_flag() {
        let v = VersionCell::new();
        v.begin_shrink();
        assert!(v.load().is_shrinking());
        v.end_shrink();
        let snap = v.load();
        assert!(!snap.is_shrinking());
        assert!(!snap.is_unlinked());
        assert_eq!(snap.counter(), 1);
    }

    #[test]
    fn unlink_is_sticky_and_bumps_counter() {
        let v = VersionCell::new();
        v.begin_shrink();
        v.end_shrink();
        v.mark_unlinked();
        let snap = v.load();
        assert!(snap.is_unlinked());
        assert_eq!(snap.counter(), 2);
    }
}
