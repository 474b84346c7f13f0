//! Liveness accounting and the medium consistency point.
//!
//! The tracker knows which replicas belong to which domain, the newest CSN
//! each replica has been heard at (update or heartbeat) and which replicas
//! are offline. From that it derives the medium consistency point: the
//! newest CSN such that every active replica of every tracked domain has
//! been heard from at or after it. A change at or before that point can
//! no longer be preceded by anything still in flight.
//!
//! A domain is tracked once one of its replicas has been heard from. Until
//! then it holds nothing back, so idle domains never stall the others.

use cseq_core::{Csn, DomainId, MultiDomainServerState, ReplicaId};
use std::collections::{BTreeMap, BTreeSet};

/// Where the consistency frontier currently stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsistencyPoint {
    /// No active replica constrains the frontier.
    Unbounded,
    /// The frontier is the oldest liveness CSN, held by `replica`.
    At {
        csn: Csn,
        domain: DomainId,
        replica: ReplicaId,
    },
    /// An active replica of a tracked domain has never been heard from.
    Unheard { domain: DomainId, replica: ReplicaId },
}

/// Whether a candidate change may be indexed now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Eligible,
    Blocked { domain: DomainId, replica: ReplicaId },
}

/// Registry of replicas plus their liveness and offline state.
#[derive(Debug, Default)]
pub struct ConsistencyTracker {
    replicas: BTreeMap<DomainId, BTreeSet<ReplicaId>>,
    last_alive: MultiDomainServerState,
    offline: MultiDomainServerState,
}

impl ConsistencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a replica. Returns true if it was not known yet.
    pub fn register(&mut self, domain: &DomainId, replica: ReplicaId) -> bool {
        self.replicas.entry(domain.clone()).or_default().insert(replica)
    }

    pub fn is_registered(&self, domain: &DomainId, replica: ReplicaId) -> bool {
        self.replicas
            .get(domain)
            .is_some_and(|set| set.contains(&replica))
    }

    pub fn has_domain(&self, domain: &DomainId) -> bool {
        self.replicas.contains_key(domain)
    }

    /// Every registered (domain, replica) pair.
    pub fn pairs(&self) -> Vec<(DomainId, ReplicaId)> {
        self.replicas
            .iter()
            .flat_map(|(d, set)| set.iter().map(move |r| (d.clone(), *r)))
            .collect()
    }

    /// Record that `csn`'s replica was heard from in `domain`.
    ///
    /// A replica that was offline and speaks again past its offline CSN is
    /// reactivated. Returns true if the replica was newly registered.
    pub fn observe(&mut self, domain: &DomainId, csn: Csn) -> bool {
        let replica = csn.replica_id();
        let added = self.register(domain, replica);
        self.last_alive.update(domain, csn);
        if let Some(offline_csn) = self.offline.csn(domain, replica) {
            if csn > offline_csn && self.offline.remove_exact(domain, &offline_csn) {
                tracing::info!(%domain, %replica, %csn, "replica back online");
            }
        }
        added
    }

    /// Record that a replica went offline at `csn`. Its liveness advances
    /// to `csn` and it no longer holds the frontier back.
    pub fn mark_offline(&mut self, domain: &DomainId, csn: Csn) -> bool {
        let added = self.register(domain, csn.replica_id());
        self.offline.update(domain, csn);
        self.last_alive.update(domain, csn);
        added
    }

    pub fn is_offline(&self, domain: &DomainId, replica: ReplicaId) -> bool {
        self.offline.csn(domain, replica).is_some()
    }

    pub fn last_alive(&self, domain: &DomainId, replica: ReplicaId) -> Option<Csn> {
        self.last_alive.csn(domain, replica)
    }

    /// Forget a domain entirely.
    pub fn remove_domain(&mut self, domain: &DomainId) {
        self.replicas.remove(domain);
        self.last_alive.remove_domain(domain);
        self.offline.remove_domain(domain);
    }

    fn is_tracked(&self, domain: &DomainId, replicas: &BTreeSet<ReplicaId>) -> bool {
        replicas
            .iter()
            .any(|r| self.last_alive.csn(domain, *r).is_some())
    }

    /// Consistency point over all tracked domains, treating `also_track` as
    /// tracked even if none of its replicas has been heard from.
    fn point_with(&self, also_track: Option<&DomainId>) -> ConsistencyPoint {
        let mut point = ConsistencyPoint::Unbounded;
        for (domain, replicas) in &self.replicas {
            if also_track != Some(domain) && !self.is_tracked(domain, replicas) {
                continue;
            }
            for replica in replicas {
                if self.is_offline(domain, *replica) {
                    continue;
                }
                match self.last_alive.csn(domain, *replica) {
                    None => {
                        return ConsistencyPoint::Unheard {
                            domain: domain.clone(),
                            replica: *replica,
                        }
                    }
                    Some(csn) => {
                        let older = match &point {
                            ConsistencyPoint::At { csn: current, .. } => csn < *current,
                            _ => true,
                        };
                        if older {
                            point = ConsistencyPoint::At {
                                csn,
                                domain: domain.clone(),
                                replica: *replica,
                            };
                        }
                    }
                }
            }
        }
        point
    }

    /// The medium consistency point over all tracked domains.
    pub fn medium_consistency_point(&self) -> ConsistencyPoint {
        self.point_with(None)
    }

    /// Can the change `csn` from `domain` be indexed now?
    pub fn check(&self, domain: &DomainId, csn: &Csn) -> Verdict {
        if !self.has_domain(domain) {
            return Verdict::Blocked {
                domain: domain.clone(),
                replica: csn.replica_id(),
            };
        }
        match self.point_with(Some(domain)) {
            ConsistencyPoint::Unbounded => Verdict::Eligible,
            ConsistencyPoint::At { csn: point, .. } if *csn <= point => Verdict::Eligible,
            ConsistencyPoint::At { domain, replica, .. }
            | ConsistencyPoint::Unheard { domain, replica } => Verdict::Blocked { domain, replica },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(name: &str) -> DomainId {
        DomainId::new(name).unwrap()
    }

    fn csn(ts: u64, rid: u32) -> Csn {
        Csn::new(ts, 0, ReplicaId(rid))
    }

    #[test]
    fn test_unheard_replica_blocks_its_domain() {
        let mut tracker = ConsistencyTracker::new();
        tracker.register(&dn("o=a"), ReplicaId(101));
        tracker.register(&dn("o=a"), ReplicaId(102));
        tracker.observe(&dn("o=a"), csn(2, 102));

        assert_eq!(
            tracker.check(&dn("o=a"), &csn(2, 102)),
            Verdict::Blocked {
                domain: dn("o=a"),
                replica: ReplicaId(101)
            }
        );

        tracker.observe(&dn("o=a"), csn(1, 101));
        assert_eq!(tracker.check(&dn("o=a"), &csn(1, 101)), Verdict::Eligible);
        assert!(matches!(
            tracker.check(&dn("o=a"), &csn(2, 102)),
            Verdict::Blocked { replica: ReplicaId(101), .. }
        ));
    }

    #[test]
    fn test_untracked_domain_does_not_block() {
        let mut tracker = ConsistencyTracker::new();
        tracker.register(&dn("o=a"), ReplicaId(1));
        tracker.register(&dn("o=b"), ReplicaId(2));
        tracker.observe(&dn("o=a"), csn(5, 1));
        assert_eq!(tracker.check(&dn("o=a"), &csn(5, 1)), Verdict::Eligible);

        // once o=b is heard from, the cross-domain minimum applies
        tracker.observe(&dn("o=b"), csn(3, 2));
        assert!(matches!(
            tracker.check(&dn("o=a"), &csn(5, 1)),
            Verdict::Blocked { replica: ReplicaId(2), .. }
        ));
        assert_eq!(tracker.check(&dn("o=b"), &csn(3, 2)), Verdict::Eligible);
    }

    #[test]
    fn test_offline_replica_is_excluded_until_it_returns() {
        let mut tracker = ConsistencyTracker::new();
        tracker.observe(&dn("o=a"), csn(10, 1));
        tracker.observe(&dn("o=a"), csn(2, 2));
        assert!(matches!(
            tracker.check(&dn("o=a"), &csn(10, 1)),
            Verdict::Blocked { replica: ReplicaId(2), .. }
        ));

        tracker.mark_offline(&dn("o=a"), csn(3, 2));
        assert!(tracker.is_offline(&dn("o=a"), ReplicaId(2)));
        assert_eq!(tracker.check(&dn("o=a"), &csn(10, 1)), Verdict::Eligible);

        // an update older than the offline CSN does not reactivate
        tracker.observe(&dn("o=a"), csn(3, 2));
        assert!(tracker.is_offline(&dn("o=a"), ReplicaId(2)));

        tracker.observe(&dn("o=a"), csn(11, 2));
        assert!(!tracker.is_offline(&dn("o=a"), ReplicaId(2)));
        assert!(matches!(
            tracker.check(&dn("o=a"), &csn(12, 2)),
            Verdict::Blocked { replica: ReplicaId(1), .. }
        ));
    }

    #[test]
    fn test_medium_consistency_point() {
        let mut tracker = ConsistencyTracker::new();
        assert_eq!(tracker.medium_consistency_point(), ConsistencyPoint::Unbounded);
        tracker.observe(&dn("o=a"), csn(7, 1));
        tracker.observe(&dn("o=b"), csn(4, 2));
        assert_eq!(
            tracker.medium_consistency_point(),
            ConsistencyPoint::At {
                csn: csn(4, 2),
                domain: dn("o=b"),
                replica: ReplicaId(2)
            }
        );
        tracker.register(&dn("o=b"), ReplicaId(3));
        assert_eq!(
            tracker.medium_consistency_point(),
            ConsistencyPoint::Unheard {
                domain: dn("o=b"),
                replica: ReplicaId(3)
            }
        );
    }

    #[test]
    fn test_remove_domain() {
        let mut tracker = ConsistencyTracker::new();
        tracker.observe(&dn("o=a"), csn(1, 1));
        tracker.remove_domain(&dn("o=a"));
        assert!(!tracker.has_domain(&dn("o=a")));
        assert_eq!(tracker.last_alive(&dn("o=a"), ReplicaId(1)), None);
        assert!(matches!(
            tracker.check(&dn("o=a"), &csn(1, 1)),
            Verdict::Blocked { .. }
        ));
    }
}
