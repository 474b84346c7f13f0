//! Composite cursor over every (domain, replica) stream.
//!
//! Each slot buffers the head of its stream. Empty slots are polled again
//! on every refill, so a stream that had nothing to offer is picked up as
//! soon as its replica DB receives more changes.

use crate::changelog::ReplicaCursor;
use crate::error::ChangelogError;
use cseq_core::{Csn, DomainId, ReplicaId};
use std::collections::BTreeMap;

struct Slot {
    cursor: Box<dyn ReplicaCursor>,
    head: Option<Csn>,
}

/// Merges per-replica cursors into one stream ordered by CSN.
#[derive(Default)]
pub struct CompositeCursor {
    slots: BTreeMap<(DomainId, ReplicaId), Slot>,
}

impl CompositeCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, domain: &DomainId, replica_id: ReplicaId) -> bool {
        self.slots.contains_key(&(domain.clone(), replica_id))
    }

    /// Add a cursor. A pair that already has a cursor keeps its original one.
    pub fn add(&mut self, domain: DomainId, replica_id: ReplicaId, cursor: Box<dyn ReplicaCursor>) -> bool {
        let key = (domain, replica_id);
        if self.slots.contains_key(&key) {
            return false;
        }
        self.slots.insert(key, Slot { cursor, head: None });
        true
    }

    /// Drop every cursor of a domain.
    pub fn remove_domain(&mut self, domain: &DomainId) -> usize {
        let before = self.slots.len();
        self.slots.retain(|(d, _), _| d != domain);
        before - self.slots.len()
    }

    /// Poll every slot without a buffered head. A failing cursor takes its
    /// whole domain out of the composite; the failures are returned.
    pub fn refill(&mut self) -> Vec<(DomainId, ChangelogError)> {
        let mut failures: Vec<(DomainId, ChangelogError)> = Vec::new();
        for ((domain, _), slot) in self.slots.iter_mut() {
            if slot.head.is_some() || failures.iter().any(|(d, _)| d == domain) {
                continue;
            }
            match slot.cursor.next() {
                Ok(head) => slot.head = head,
                Err(err) => failures.push((domain.clone(), err)),
            }
        }
        for (domain, _) in &failures {
            self.remove_domain(domain);
        }
        failures
    }

    /// The buffered head with the smallest CSN.
    pub fn peek_min(&self) -> Option<(DomainId, Csn)> {
        self.slots
            .iter()
            .filter_map(|((domain, _), slot)| slot.head.map(|csn| (csn, domain)))
            .min()
            .map(|(csn, domain)| (domain.clone(), csn))
    }

    /// Mark the head of a slot as consumed.
    pub fn consume(&mut self, domain: &DomainId, replica_id: ReplicaId) -> Option<Csn> {
        self.slots
            .get_mut(&(domain.clone(), replica_id))
            .and_then(|slot| slot.head.take())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
