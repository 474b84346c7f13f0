//! Server state: the newest known CSN per replica.
//!
//! A server state summarises how far a node has seen each replica's
//! changes. It is shared between the inbound replication path (merging
//! CSNs received from peers) and the local write path (recording locally
//! generated CSNs), so every method takes `&self` and synchronises
//! internally. Per-replica entries only ever move forward; the only ways
//! to drop an entry are `remove_exact` and `clear`.

use crate::csn::Csn;
use crate::error::DecodeError;
use crate::ids::ReplicaId;
use crate::lattice::Lattice;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Newest known CSN per replica.
#[derive(Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerState {
    entries: RwLock<BTreeMap<ReplicaId, Csn>>,
}

impl ServerState {
    /// Create an empty server state.
    pub fn new() -> Self {
        ServerState {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build a state holding the newest of the given CSNs per replica.
    pub fn from_csns(csns: impl IntoIterator<Item = Csn>) -> Self {
        let state = ServerState::new();
        for csn in csns {
            state.update(csn);
        }
        state
    }

    /// Install `csn` for its replica if the replica is unknown or its
    /// stored CSN is strictly older. Returns whether the state changed.
    pub fn update(&self, csn: Csn) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&csn.replica_id()) {
            Some(current) if *current >= csn => false,
            _ => {
                entries.insert(csn.replica_id(), csn);
                true
            }
        }
    }

    /// Fold every CSN of `other` into this state. Returns whether any entry
    /// changed.
    pub fn update_state(&self, other: &ServerState) -> bool {
        let incoming = other.snapshot();
        let mut entries = self.entries.write();
        let mut changed = false;
        for (replica, csn) in incoming {
            match entries.get(&replica) {
                Some(current) if *current >= csn => {}
                _ => {
                    entries.insert(replica, csn);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Remove the entry for `csn`'s replica only if it is exactly `csn`.
    pub fn remove_exact(&self, csn: &Csn) -> bool {
        let mut entries = self.entries.write();
        if entries.get(&csn.replica_id()) == Some(csn) {
            entries.remove(&csn.replica_id());
            true
        } else {
            false
        }
    }

    /// The stored CSN for a replica, or `None` if it was never observed.
    pub fn csn(&self, replica_id: ReplicaId) -> Option<Csn> {
        self.entries.read().get(&replica_id).copied()
    }

    /// True iff a CSN is stored for `csn`'s replica and it is not older.
    pub fn cover(&self, csn: &Csn) -> bool {
        self.entries
            .read()
            .get(&csn.replica_id())
            .is_some_and(|stored| stored >= csn)
    }

    /// True iff this state covers every CSN of `other`.
    pub fn cover_state(&self, other: &ServerState) -> bool {
        let theirs = other.snapshot();
        let ours = self.entries.read();
        theirs
            .values()
            .all(|csn| ours.get(&csn.replica_id()).is_some_and(|stored| stored >= csn))
    }

    /// Deep, independent copy.
    pub fn duplicate(&self) -> ServerState {
        ServerState {
            entries: RwLock::new(self.snapshot()),
        }
    }

    /// Copy of the current entries.
    pub fn snapshot(&self) -> BTreeMap<ReplicaId, Csn> {
        self.entries.read().clone()
    }

    /// All stored CSNs, ordered by replica id.
    pub fn csns(&self) -> Vec<Csn> {
        self.entries.read().values().copied().collect()
    }

    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        self.entries.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Forget every replica.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Newest CSN across all replicas.
    pub fn max_csn(&self) -> Option<Csn> {
        self.entries.read().values().max().copied()
    }

    /// Oldest CSN across all replicas.
    pub fn oldest_csn(&self) -> Option<Csn> {
        self.entries.read().values().min().copied()
    }

    /// Estimated number of changes present in this state but not in `other`.
    pub fn diff_changes(&self, other: &ServerState) -> u64 {
        let theirs = other.snapshot();
        self.entries
            .read()
            .iter()
            .map(|(replica, csn)| Csn::sequence_distance(csn, theirs.get(replica)))
            .sum()
    }
}

impl Clone for ServerState {
    fn clone(&self) -> Self {
        self.duplicate()
    }
}

impl PartialEq for ServerState {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl Eq for ServerState {}

impl Lattice for ServerState {
    fn bottom() -> Self {
        ServerState::new()
    }

    fn join(&self, other: &Self) -> Self {
        let joined = self.duplicate();
        joined.update_state(other);
        joined
    }

    fn join_assign(&mut self, other: &Self) {
        self.update_state(other);
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        for (i, csn) in entries.values().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", csn)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerState[{}]", self)
    }
}

impl FromStr for ServerState {
    type Err = DecodeError;

    /// Parse space separated CSNs. The empty string is the empty state.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = BTreeMap::new();
        for token in s.split_whitespace() {
            let csn: Csn = token
                .parse()
                .map_err(|e: DecodeError| DecodeError::server_state(s, e.to_string()))?;
            if entries.insert(csn.replica_id(), csn).is_some() {
                return Err(DecodeError::server_state(
                    s,
                    format!("replica {} appears more than once", csn.replica_id()),
                ));
            }
        }
        Ok(ServerState {
            entries: RwLock::new(entries),
        })
    }
}

impl TryFrom<String> for ServerState {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerState> for String {
    fn from(state: ServerState) -> Self {
        state.to_string()
    }
}
