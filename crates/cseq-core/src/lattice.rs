//! Join-semilattice view of replica state.
//!
//! Server states and cookies only ever move forward: merging keeps the
//! newest CSN per replica. That merge is commutative, associative and
//! idempotent, so states folded in any delivery order converge.

use std::cmp::Ordering;

pub trait Lattice: Clone + PartialEq {
    /// The empty state.
    fn bottom() -> Self;

    /// Newest-per-replica merge of two states.
    fn join(&self, other: &Self) -> Self;

    fn join_assign(&mut self, other: &Self) {
        *self = self.join(other);
    }

    /// Joining `self` into `other` adds nothing.
    fn leq(&self, other: &Self) -> bool {
        self.join(other) == *other
    }

    /// Order in the lattice. `None` when each side holds a replica
    /// position the other lacks.
    fn lattice_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.leq(other), other.leq(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    /// Join of every state in `states`; the bottom element when empty.
    fn join_all<'a, I>(states: I) -> Self
    where
        Self: 'a,
        I: IntoIterator<Item = &'a Self>,
    {
        states
            .into_iter()
            .fold(Self::bottom(), |acc, state| acc.join(state))
    }
}
