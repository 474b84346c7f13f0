//! Multi-domain server state: one server state per replicated domain.
//!
//! Besides being accounting state for the change number indexer, the
//! textual form of this type is the cookie handed to external changelog
//! readers: it records exactly which (domain, replica) progress has been
//! delivered so a reader can resume after it.
//!
//! Cookie format: `domain1:csn csn csn;domain2:csn;` with domains in sorted
//! order. Decoding accepts a missing trailing `;` and ignores empty
//! segments.

use crate::csn::Csn;
use crate::error::DecodeError;
use crate::ids::{DomainId, ReplicaId};
use crate::lattice::Lattice;
use crate::server_state::ServerState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Newest known CSN per replica per domain.
#[derive(Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MultiDomainServerState {
    domains: RwLock<BTreeMap<DomainId, ServerState>>,
}

impl MultiDomainServerState {
    pub fn new() -> Self {
        MultiDomainServerState {
            domains: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record `csn` for `domain`, creating the domain's state if needed.
    /// Returns whether anything changed.
    pub fn update(&self, domain: &DomainId, csn: Csn) -> bool {
        {
            let domains = self.domains.read();
            if let Some(state) = domains.get(domain) {
                return state.update(csn);
            }
        }
        self.domains
            .write()
            .entry(domain.clone())
            .or_default()
            .update(csn)
    }

    /// Fold a whole server state into `domain`, keeping the newest CSN per
    /// replica. Progress already recorded is never regressed.
    pub fn merge(&self, domain: &DomainId, state: &ServerState) -> bool {
        {
            let domains = self.domains.read();
            if let Some(current) = domains.get(domain) {
                return current.update_state(state);
            }
        }
        self.domains
            .write()
            .entry(domain.clone())
            .or_default()
            .update_state(state)
    }

    /// Overwrite the state of `domain`. Unlike `merge` this can move entries
    /// backward; use it only when the caller owns the domain's history.
    pub fn replace(&self, domain: &DomainId, state: ServerState) {
        self.domains.write().insert(domain.clone(), state);
    }

    /// Remove `csn` from `domain` only if it is exactly the stored value.
    pub fn remove_exact(&self, domain: &DomainId, csn: &Csn) -> bool {
        self.domains
            .read()
            .get(domain)
            .is_some_and(|state| state.remove_exact(csn))
    }

    pub fn remove_domain(&self, domain: &DomainId) -> Option<ServerState> {
        self.domains.write().remove(domain)
    }

    /// Copy of a domain's server state.
    pub fn get(&self, domain: &DomainId) -> Option<ServerState> {
        self.domains.read().get(domain).map(ServerState::duplicate)
    }

    pub fn csn(&self, domain: &DomainId, replica_id: ReplicaId) -> Option<Csn> {
        self.domains
            .read()
            .get(domain)
            .and_then(|state| state.csn(replica_id))
    }

    pub fn domains(&self) -> Vec<DomainId> {
        self.domains.read().keys().cloned().collect()
    }

    /// True when no CSN is recorded for any domain.
    pub fn is_empty(&self) -> bool {
        self.domains.read().values().all(ServerState::is_empty)
    }

    pub fn clear(&self) {
        self.domains.write().clear();
    }

    /// Every (domain, CSN) entry, in domain then replica order.
    pub fn entries(&self) -> Vec<(DomainId, Csn)> {
        self.domains
            .read()
            .iter()
            .flat_map(|(domain, state)| {
                state
                    .csns()
                    .into_iter()
                    .map(move |csn| (domain.clone(), csn))
            })
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<DomainId, BTreeMap<ReplicaId, Csn>> {
        self.domains
            .read()
            .iter()
            .map(|(domain, state)| (domain.clone(), state.snapshot()))
            .collect()
    }

    /// True iff `domain`'s state covers `csn`.
    pub fn cover_csn(&self, domain: &DomainId, csn: &Csn) -> bool {
        self.domains
            .read()
            .get(domain)
            .is_some_and(|state| state.cover(csn))
    }

    /// True iff every domain of `other` is present here with a state that
    /// covers `other`'s state for that domain. A domain `other` lists with
    /// an empty state still has to be present here.
    pub fn cover(&self, other: &MultiDomainServerState) -> bool {
        let theirs = other.snapshot();
        let ours = self.domains.read();
        theirs.iter().all(|(domain, their_state)| match ours.get(domain) {
            Some(our_state) => their_state.values().all(|csn| our_state.cover(csn)),
            None => false,
        })
    }

    /// Oldest CSN over every (domain, replica) entry that is not present in
    /// `excluded`.
    pub fn oldest_csn_excluding(&self, excluded: &MultiDomainServerState) -> Option<(DomainId, Csn)> {
        let skip = excluded.snapshot();
        self.entries()
            .into_iter()
            .filter(|(domain, csn)| {
                !skip
                    .get(domain)
                    .is_some_and(|replicas| replicas.contains_key(&csn.replica_id()))
            })
            .min_by(|a, b| a.1.cmp(&b.1))
    }

    /// Entries of `self` that `older` does not cover: what a reader holding
    /// the `older` cookie has not yet seen.
    pub fn diff(&self, older: &MultiDomainServerState) -> Vec<(DomainId, Csn)> {
        self.entries()
            .into_iter()
            .filter(|(domain, csn)| !older.cover_csn(domain, csn))
            .collect()
    }
}

impl Clone for MultiDomainServerState {
    fn clone(&self) -> Self {
        let domains = self
            .domains
            .read()
            .iter()
            .map(|(domain, state)| (domain.clone(), state.duplicate()))
            .collect();
        MultiDomainServerState {
            domains: RwLock::new(domains),
        }
    }
}

impl PartialEq for MultiDomainServerState {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl Eq for MultiDomainServerState {}

impl Lattice for MultiDomainServerState {
    fn bottom() -> Self {
        MultiDomainServerState::new()
    }

    fn join(&self, other: &Self) -> Self {
        let joined = self.clone();
        for (domain, csn) in other.entries() {
            joined.update(&domain, csn);
        }
        for domain in other.domains() {
            joined.domains.write().entry(domain).or_default();
        }
        joined
    }
}

impl fmt::Display for MultiDomainServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (domain, state) in self.domains.read().iter() {
            write!(f, "{}:{};", domain, state)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MultiDomainServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultiDomainServerState[{}]", self)
    }
}

impl FromStr for MultiDomainServerState {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut domains = BTreeMap::new();
        for segment in s.split(';') {
            if segment.trim().is_empty() {
                continue;
            }
            let (name, csns) = segment
                .split_once(':')
                .ok_or_else(|| DecodeError::cookie(s, format!("segment '{}' has no ':'", segment)))?;
            let domain = DomainId::new(name).map_err(|e| DecodeError::cookie(s, e.to_string()))?;
            let state: ServerState = csns
                .parse()
                .map_err(|e: DecodeError| DecodeError::cookie(s, e.to_string()))?;
            if domains.contains_key(&domain) {
                return Err(DecodeError::cookie(
                    s,
                    format!("domain '{}' appears more than once", domain),
                ));
            }
            domains.insert(domain, state);
        }
        Ok(MultiDomainServerState {
            domains: RwLock::new(domains),
        })
    }
}

impl TryFrom<String> for MultiDomainServerState {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MultiDomainServerState> for String {
    fn from(state: MultiDomainServerState) -> Self {
        state.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csn(ts: u64, seq: u32, rid: u32) -> Csn {
        Csn::new(ts, seq, ReplicaId(rid))
    }

    fn dn(name: &str) -> DomainId {
        DomainId::new(name).unwrap()
    }

    #[test]
    fn test_update_creates_domain() {
        let state = MultiDomainServerState::new();
        assert!(state.is_empty());
        assert!(state.update(&dn("o=a"), csn(1, 0, 1)));
        assert!(!state.update(&dn("o=a"), csn(1, 0, 1)));
        assert_eq!(state.csn(&dn("o=a"), ReplicaId(1)), Some(csn(1, 0, 1)));
        assert_eq!(state.csn(&dn("o=b"), ReplicaId(1)), None);
        assert_eq!(state.domains(), vec![dn("o=a")]);
    }

    #[test]
    fn test_merge_does_not_regress() {
        let state = MultiDomainServerState::new();
        state.update(&dn("o=a"), csn(10, 0, 1));
        let older = ServerState::from_csns([csn(5, 0, 1), csn(3, 0, 2)]);
        assert!(state.merge(&dn("o=a"), &older));
        assert_eq!(state.csn(&dn("o=a"), ReplicaId(1)), Some(csn(10, 0, 1)));
        assert_eq!(state.csn(&dn("o=a"), ReplicaId(2)), Some(csn(3, 0, 2)));

        state.replace(&dn("o=a"), older);
        assert_eq!(state.csn(&dn("o=a"), ReplicaId(1)), Some(csn(5, 0, 1)));
    }

    #[test]
    fn test_cookie_format() {
        let state = MultiDomainServerState::new();
        state.update(&dn("o=b"), csn(2, 0, 2));
        state.update(&dn("o=a"), csn(1, 0, 1));
        state.update(&dn("o=a"), csn(1, 0, 3));
        let text = state.to_string();
        assert_eq!(
            text,
            format!("o=a:{} {};o=b:{};", csn(1, 0, 1), csn(1, 0, 3), csn(2, 0, 2))
        );
        assert_eq!(text.parse::<MultiDomainServerState>().unwrap(), state);
    }

    #[test]
    fn test_cookie_decoding_edge_cases() {
        assert!("".parse::<MultiDomainServerState>().unwrap().is_empty());
        let no_trailing = format!("o=a:{}", csn(1, 0, 1));
        let parsed: MultiDomainServerState = no_trailing.parse().unwrap();
        assert_eq!(parsed.csn(&dn("o=a"), ReplicaId(1)), Some(csn(1, 0, 1)));

        let empty_domain: MultiDomainServerState = "o=a:;".parse().unwrap();
        assert_eq!(empty_domain.domains(), vec![dn("o=a")]);
        assert_eq!(empty_domain.to_string(), "o=a:;");
    }

    #[test]
    fn test_cookie_rejects_malformed() {
        for bad in ["o=a", "o=a:xyz;", ":0000;", "o=a:;o=a:;"] {
            match bad.parse::<MultiDomainServerState>() {
                Err(DecodeError::InvalidCookie { input, .. }) => assert_eq!(input, bad),
                other => panic!("expected InvalidCookie for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_cover() {
        let a = MultiDomainServerState::new();
        a.update(&dn("o=a"), csn(10, 0, 1));
        a.update(&dn("o=b"), csn(10, 0, 2));
        let b = MultiDomainServerState::new();
        b.update(&dn("o=a"), csn(5, 0, 1));
        assert!(a.cover(&b));
        assert!(!b.cover(&a));
        b.update(&dn("o=c"), csn(1, 0, 3));
        assert!(!a.cover(&b));
        assert!(a.cover_csn(&dn("o=b"), &csn(10, 0, 2)));
        assert!(!a.cover_csn(&dn("o=b"), &csn(11, 0, 2)));
    }

    #[test]
    fn test_cover_requires_listed_empty_domain() {
        let listed: MultiDomainServerState = "o=c:;".parse().unwrap();
        assert!(!MultiDomainServerState::new().cover(&listed));

        let with_domain: MultiDomainServerState = format!("o=c:{};", csn(1, 0, 1)).parse().unwrap();
        assert!(with_domain.cover(&listed));
        assert!(listed.cover(&listed));
    }

    #[test]
    fn test_oldest_excluding() {
        let alive = MultiDomainServerState::new();
        alive.update(&dn("o=a"), csn(5, 0, 1));
        alive.update(&dn("o=a"), csn(3, 0, 2));
        alive.update(&dn("o=b"), csn(4, 0, 3));
        let offline = MultiDomainServerState::new();
        assert_eq!(
            alive.oldest_csn_excluding(&offline),
            Some((dn("o=a"), csn(3, 0, 2)))
        );
        offline.update(&dn("o=a"), csn(3, 0, 2));
        assert_eq!(
            alive.oldest_csn_excluding(&offline),
            Some((dn("o=b"), csn(4, 0, 3)))
        );
    }

    #[test]
    fn test_diff() {
        let older = MultiDomainServerState::new();
        older.update(&dn("o=a"), csn(5, 0, 1));
        let newer = older.clone();
        newer.update(&dn("o=a"), csn(6, 0, 1));
        newer.update(&dn("o=b"), csn(1, 0, 2));
        assert_eq!(
            newer.diff(&older),
            vec![(dn("o=a"), csn(6, 0, 1)), (dn("o=b"), csn(1, 0, 2))]
        );
        assert!(older.diff(&newer).is_empty());
    }

    #[test]
    fn test_remove() {
        let state = MultiDomainServerState::new();
        state.update(&dn("o=a"), csn(5, 0, 1));
        assert!(!state.remove_exact(&dn("o=a"), &csn(4, 0, 1)));
        assert!(state.remove_exact(&dn("o=a"), &csn(5, 0, 1)));
        assert!(state.is_empty());
        assert!(state.remove_domain(&dn("o=a")).is_some());
        assert!(state.domains().is_empty());
    }

    #[test]
    fn test_serde_as_cookie() {
        let state = MultiDomainServerState::new();
        state.update(&dn("o=a"), csn(5, 0, 1));
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, format!("\"{}\"", state));
        let back: MultiDomainServerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
