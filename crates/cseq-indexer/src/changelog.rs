//! Interfaces to the changelog storage collaborators.
//!
//! The indexer reads per-(domain, replica) CSN streams through
//! [`ReplicaDb`] and is the single writer of the global index behind
//! [`ChangeNumberIndexDb`]. [`ChangelogState`] is the startup snapshot of
//! which replicas belong to which domain.

use crate::error::Result;
use crate::record::ChangeNumberIndexRecord;
use cseq_core::{Csn, DomainId, MultiDomainServerState, ReplicaId, ServerState};
use std::collections::{BTreeMap, BTreeSet};

/// Read position over one replica's ordered CSN stream in one domain.
pub trait ReplicaCursor: Send {
    /// The next stored CSN, or `None` if nothing is available right now.
    /// Never blocks; a cursor that returned `None` may yield later once the
    /// stream grows.
    fn next(&mut self) -> Result<Option<Csn>>;
}

/// Durable per-(domain, replica) CSN streams.
pub trait ReplicaDb: Send + Sync {
    /// Open a cursor positioned after `after` (or at the start when `None`).
    fn cursor_from(
        &self,
        domain: &DomainId,
        replica_id: ReplicaId,
        after: Option<Csn>,
    ) -> Result<Box<dyn ReplicaCursor>>;

    /// Newest stored CSN of every replica of `domain`.
    fn domain_newest_csns(&self, domain: &DomainId) -> Result<ServerState>;
}

/// Durable global change number index. Append-only, single writer.
pub trait ChangeNumberIndexDb: Send + Sync {
    /// Append a record. Change numbers must strictly increase.
    fn add_record(&self, record: ChangeNumberIndexRecord) -> Result<()>;

    fn newest_record(&self) -> Result<Option<ChangeNumberIndexRecord>>;

    fn oldest_record(&self) -> Result<Option<ChangeNumberIndexRecord>>;

    /// Up to `limit` records starting at `change_number`, in append order.
    fn read_from(&self, change_number: u64, limit: usize) -> Result<Vec<ChangeNumberIndexRecord>>;

    /// Remove records older than `csn`, always keeping the newest record.
    /// Returns the CSN of the oldest remaining record.
    fn purge_up_to(&self, csn: &Csn) -> Result<Option<Csn>>;

    fn clear(&self) -> Result<()>;
}

/// Startup snapshot of the changelog: registered replicas per domain,
/// replicas known to be offline and domains excluded from indexing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangelogState {
    replicas: BTreeMap<DomainId, BTreeSet<ReplicaId>>,
    offline: MultiDomainServerState,
    excluded: BTreeSet<DomainId>,
}

impl ChangelogState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_replica(&mut self, domain: DomainId, replica_id: ReplicaId) {
        self.replicas.entry(domain).or_default().insert(replica_id);
    }

    /// Builder-style `register_replica`.
    pub fn with_replica(mut self, domain: DomainId, replica_id: ReplicaId) -> Self {
        self.register_replica(domain, replica_id);
        self
    }

    /// Record that a replica went offline at `offline_csn`.
    pub fn mark_offline(&mut self, domain: DomainId, offline_csn: Csn) {
        self.register_replica(domain.clone(), offline_csn.replica_id());
        self.offline.update(&domain, offline_csn);
    }

    /// Keep `domain` out of global sequencing.
    pub fn exclude_domain(&mut self, domain: DomainId) {
        self.excluded.insert(domain);
    }

    pub fn domains(&self) -> Vec<DomainId> {
        self.replicas.keys().cloned().collect()
    }

    pub fn replicas(&self, domain: &DomainId) -> Vec<ReplicaId> {
        self.replicas
            .get(domain)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn offline_replicas(&self) -> &MultiDomainServerState {
        &self.offline
    }

    pub fn is_excluded(&self, domain: &DomainId) -> bool {
        self.excluded.contains(domain)
    }

    pub fn excluded_domains(&self) -> Vec<DomainId> {
        self.excluded.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(name: &str) -> DomainId {
        DomainId::new(name).unwrap()
    }

    #[test]
    fn test_changelog_state() {
        let mut state = ChangelogState::new()
            .with_replica(dn("o=a"), ReplicaId(1))
            .with_replica(dn("o=a"), ReplicaId(2))
            .with_replica(dn("o=b"), ReplicaId(3));
        state.mark_offline(dn("o=b"), Csn::new(9, 0, ReplicaId(4)));
        state.exclude_domain(dn("cn=admin data"));

        assert_eq!(state.domains(), vec![dn("o=a"), dn("o=b")]);
        assert_eq!(state.replicas(&dn("o=a")), vec![ReplicaId(1), ReplicaId(2)]);
        assert_eq!(state.replicas(&dn("o=b")), vec![ReplicaId(3), ReplicaId(4)]);
        assert!(state.replicas(&dn("o=c")).is_empty());
        assert_eq!(
            state.offline_replicas().csn(&dn("o=b"), ReplicaId(4)),
            Some(Csn::new(9, 0, ReplicaId(4)))
        );
        assert!(state.is_excluded(&dn("cn=admin data")));
        assert!(!state.is_excluded(&dn("o=a")));
    }
}
