//! A vector clock keyed by [`PeerId`], used as a document's version vector.
//!
//! Adapted from a generic actor-keyed vector clock: each peer has a
//! monotonically increasing counter, and two clocks compare as
//! greater/less/equal/concurrent exactly as a vector clock should.
//!
//! ```
//! use syncrepo_crdt::{PeerId, VersionVector};
//!
//! let a = PeerId::new("a");
//! let mut v1 = VersionVector::default();
//! let mut v2 = VersionVector::default();
//! v1.increment(&a);
//! v1.increment(&a);
//! v2.increment(&a);
//! assert!(v1 > v2);
//! ```

use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct VersionVector {
    counters: BTreeMap<PeerId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter this vector has observed for `peer`, or 0 if never seen.
    pub fn get(&self, peer: &PeerId) -> u64 {
        self.counters.get(peer).copied().unwrap_or(0)
    }

    /// Bumps `peer`'s counter by one and returns the new value.
    pub fn increment(&mut self, peer: &PeerId) -> u64 {
        let counter = self.counters.entry(peer.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Sets `peer`'s counter to at least `counter` (never regresses it).
    pub fn observe(&mut self, peer: &PeerId, counter: u64) {
        let entry = self.counters.entry(peer.clone()).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    /// Merges another vector in, taking the pointwise maximum of every
    /// peer's counter. Idempotent, associative, commutative.
    pub fn merge(&mut self, other: &VersionVector) {
        for (peer, counter) in &other.counters {
            self.observe(peer, *counter);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counters.values().all(|c| *c == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, u64)> {
        self.counters.iter().map(|(p, c)| (p, *c))
    }
}

impl PartialOrd for VersionVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        let self_ahead = self
            .counters
            .iter()
            .any(|(peer, counter)| *counter > other.get(peer));
        let other_ahead = other
            .counters
            .iter()
            .any(|(peer, counter)| *counter > self.get(peer));
        match (self_ahead, other_ahead) {
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => Some(Ordering::Equal),
            (true, true) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_vectors_are_incomparable() {
        let a = PeerId::new("a");
        let b = PeerId::new("b");
        let mut v1 = VersionVector::default();
        let mut v2 = VersionVector::default();
        v1.increment(&a);
        v2.increment(&b);
        assert_eq!(v1.partial_cmp(&v2), None);
    }

    #[test]
    fn merge_is_pointwise_max() {
        let a = PeerId::new("a");
        let mut v1 = VersionVector::default();
        let mut v2 = VersionVector::default();
        v1.increment(&a);
        v2.increment(&a);
        v2.increment(&a);
        v1.merge(&v2);
        assert_eq!(v1.get(&a), 2);
    }
}

#[cfg(test)]
mod laws {
    use super::*;
    use proptest::prelude::*;

    fn arb_vector(peers: &[&'static str]) -> impl Strategy<Value = VersionVector> {
        let peers: Vec<PeerId> = peers.iter().map(|p| PeerId::new(*p)).collect();
        proptest::collection::vec(0u64..20, peers.len()).prop_map(move |counts| {
            let mut v = VersionVector::new();
            for (peer, count) in peers.iter().zip(counts) {
                v.observe(peer, count);
            }
            v
        })
    }

    const PEERS: [&str; 3] = ["a", "b", "c"];

    proptest! {
        #[test]
        fn merge_is_idempotent(v in arb_vector(&PEERS)) {
            let mut merged = v.clone();
            merged.merge(&v);
            prop_assert_eq!(merged, v);
        }

        #[test]
        fn merge_is_commutative(v1 in arb_vector(&PEERS), v2 in arb_vector(&PEERS)) {
            let mut a = v1.clone();
            a.merge(&v2);
            let mut b = v2;
            b.merge(&v1);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn merge_is_associative(
            v1 in arb_vector(&PEERS),
            v2 in arb_vector(&PEERS),
            v3 in arb_vector(&PEERS),
        ) {
            let mut left = v1.clone();
            left.merge(&v2);
            left.merge(&v3);

            let mut right_inner = v2;
            right_inner.merge(&v3);
            let mut right = v1;
            right.merge(&right_inner);

            prop_assert_eq!(left, right);
        }

        #[test]
        fn merge_result_dominates_both_inputs(v1 in arb_vector(&PEERS), v2 in arb_vector(&PEERS)) {
            let mut merged = v1.clone();
            merged.merge(&v2);
            prop_assert!(merged >= v1);
            prop_assert!(merged >= v2);
        }
    }
}
