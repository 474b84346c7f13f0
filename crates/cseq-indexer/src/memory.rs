//! In-memory changelog storage for testing and simulation.
//!
//! [`MemoryReplicaDb`] keeps one append-only CSN stream per
//! (domain, replica); cursors share the stream so they see later appends.
//! [`MemoryChangeNumberIndexDb`] stores each record as its encoded line,
//! the way a file-backed index would, so corrupt lines surface as decode
//! errors on read.

use crate::changelog::{ChangeNumberIndexDb, ReplicaCursor, ReplicaDb};
use crate::error::{ChangelogError, Result};
use crate::record::ChangeNumberIndexRecord;
use cseq_core::{Csn, DomainId, ReplicaId, ServerState};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

type Stream = Arc<RwLock<Vec<Csn>>>;

/// In-memory per-(domain, replica) CSN streams.
#[derive(Default)]
pub struct MemoryReplicaDb {
    streams: RwLock<BTreeMap<(DomainId, ReplicaId), Stream>>,
    unreadable: RwLock<HashSet<DomainId>>,
}

impl MemoryReplicaDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, domain: &DomainId, replica_id: ReplicaId) -> Stream {
        let key = (domain.clone(), replica_id);
        if let Some(stream) = self.streams.read().get(&key) {
            return stream.clone();
        }
        self.streams.write().entry(key).or_default().clone()
    }

    /// Store a change. CSNs must arrive in increasing order per replica.
    pub fn append(&self, domain: &DomainId, csn: Csn) -> Result<()> {
        let stream = self.stream(domain, csn.replica_id());
        let mut stream = stream.write();
        if let Some(last) = stream.last() {
            if *last >= csn {
                return Err(ChangelogError::OutOfOrderCsn {
                    last: last.to_string(),
                    attempted: csn.to_string(),
                });
            }
        }
        stream.push(csn);
        Ok(())
    }

    /// Number of CSNs stored for a replica in a domain.
    pub fn len(&self, domain: &DomainId, replica_id: ReplicaId) -> usize {
        self.streams
            .read()
            .get(&(domain.clone(), replica_id))
            .map_or(0, |s| s.read().len())
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().values().all(|s| s.read().is_empty())
    }

    /// Make every read of `domain` fail, as if its files were damaged.
    pub fn mark_unreadable(&self, domain: &DomainId) {
        self.unreadable.write().insert(domain.clone());
    }

    fn check_readable(&self, domain: &DomainId) -> Result<()> {
        if self.unreadable.read().contains(domain) {
            return Err(ChangelogError::UnreadableDomain {
                domain: domain.clone(),
                reason: "replica DB marked unreadable".to_string(),
            });
        }
        Ok(())
    }
}

impl ReplicaDb for MemoryReplicaDb {
    fn cursor_from(
        &self,
        domain: &DomainId,
        replica_id: ReplicaId,
        after: Option<Csn>,
    ) -> Result<Box<dyn ReplicaCursor>> {
        self.check_readable(domain)?;
        Ok(Box::new(MemoryReplicaCursor {
            stream: self.stream(domain, replica_id),
            after,
        }))
    }

    fn domain_newest_csns(&self, domain: &DomainId) -> Result<ServerState> {
        self.check_readable(domain)?;
        let state = ServerState::new();
        for ((d, _), stream) in self.streams.read().iter() {
            if d == domain {
                if let Some(last) = stream.read().last() {
                    state.update(*last);
                }
            }
        }
        Ok(state)
    }
}

/// Cursor over a [`MemoryReplicaDb`] stream.
pub struct MemoryReplicaCursor {
    stream: Stream,
    after: Option<Csn>,
}

impl ReplicaCursor for MemoryReplicaCursor {
    fn next(&mut self) -> Result<Option<Csn>> {
        let stream = self.stream.read();
        let position = match self.after {
            Some(after) => stream.partition_point(|csn| *csn <= after),
            None => 0,
        };
        let next = stream.get(position).copied();
        if next.is_some() {
            self.after = next;
        }
        Ok(next)
    }
}

/// In-memory global change number index holding encoded records.
#[derive(Default)]
pub struct MemoryChangeNumberIndexDb {
    lines: RwLock<Vec<String>>,
}

impl MemoryChangeNumberIndexDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load previously persisted lines without validating them.
    pub fn from_lines(lines: impl IntoIterator<Item = String>) -> Self {
        Self {
            lines: RwLock::new(lines.into_iter().collect()),
        }
    }

    /// Append a raw line, bypassing validation. Used to simulate damage.
    pub fn push_raw(&self, line: impl Into<String>) {
        self.lines.write().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.read().clone()
    }

    pub fn len(&self) -> usize {
        self.lines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.read().is_empty()
    }

    /// Every record, decoded.
    pub fn records(&self) -> Result<Vec<ChangeNumberIndexRecord>> {
        self.lines
            .read()
            .iter()
            .map(|line| ChangeNumberIndexRecord::decode(line))
            .collect()
    }
}

impl ChangeNumberIndexDb for MemoryChangeNumberIndexDb {
    fn add_record(&self, record: ChangeNumberIndexRecord) -> Result<()> {
        let line = record.encode()?;
        let mut lines = self.lines.write();
        if let Some(last) = lines.last() {
            let last = ChangeNumberIndexRecord::decode(last)?;
            if record.change_number <= last.change_number {
                return Err(ChangelogError::NonIncreasingChangeNumber {
                    last: last.change_number,
                    attempted: record.change_number,
                });
            }
        }
        lines.push(line);
        Ok(())
    }

    fn newest_record(&self) -> Result<Option<ChangeNumberIndexRecord>> {
        self.lines
            .read()
            .last()
            .map(|line| ChangeNumberIndexRecord::decode(line))
            .transpose()
    }

    fn oldest_record(&self) -> Result<Option<ChangeNumberIndexRecord>> {
        self.lines
            .read()
            .first()
            .map(|line| ChangeNumberIndexRecord::decode(line))
            .transpose()
    }

    fn read_from(&self, change_number: u64, limit: usize) -> Result<Vec<ChangeNumberIndexRecord>> {
        let mut out = Vec::new();
        for line in self.lines.read().iter() {
            if out.len() >= limit {
                break;
            }
            let record = ChangeNumberIndexRecord::decode(line)?;
            if record.change_number >= change_number {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn purge_up_to(&self, csn: &Csn) -> Result<Option<Csn>> {
        let mut lines = self.lines.write();
        let mut purge = 0;
        while purge + 1 < lines.len() {
            let record = ChangeNumberIndexRecord::decode(&lines[purge])?;
            if record.csn >= *csn {
                break;
            }
            purge += 1;
        }
        lines.drain(..purge);
        lines
            .first()
            .map(|line| ChangeNumberIndexRecord::decode(line).map(|r| r.csn))
            .transpose()
    }

    fn clear(&self) -> Result<()> {
        self.lines.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cseq_core::MultiDomainServerState;

    fn dn(name: &str) -> DomainId {
        DomainId::new(name).unwrap()
    }

    fn csn(ts: u64, rid: u32) -> Csn {
        Csn::new(ts, 0, ReplicaId(rid))
    }

    fn record(cn: u64, ts: u64) -> ChangeNumberIndexRecord {
        ChangeNumberIndexRecord::new(cn, csn(ts, 1), dn("o=a"), MultiDomainServerState::new())
    }

    #[test]
    fn test_cursor_sees_later_appends() {
        let db = MemoryReplicaDb::new();
        let mut cursor = db.cursor_from(&dn("o=a"), ReplicaId(1), None).unwrap();
        assert_eq!(cursor.next().unwrap(), None);

        db.append(&dn("o=a"), csn(1, 1)).unwrap();
        db.append(&dn("o=a"), csn(2, 1)).unwrap();
        assert_eq!(cursor.next().unwrap(), Some(csn(1, 1)));
        assert_eq!(cursor.next().unwrap(), Some(csn(2, 1)));
        assert_eq!(cursor.next().unwrap(), None);

        db.append(&dn("o=a"), csn(3, 1)).unwrap();
        assert_eq!(cursor.next().unwrap(), Some(csn(3, 1)));
    }

    #[test]
    fn test_cursor_from_position() {
        let db = MemoryReplicaDb::new();
        for ts in 1..=5 {
            db.append(&dn("o=a"), csn(ts, 1)).unwrap();
        }
        let mut cursor = db
            .cursor_from(&dn("o=a"), ReplicaId(1), Some(csn(3, 1)))
            .unwrap();
        assert_eq!(cursor.next().unwrap(), Some(csn(4, 1)));
    }

    #[test]
    fn test_append_rejects_out_of_order() {
        let db = MemoryReplicaDb::new();
        db.append(&dn("o=a"), csn(2, 1)).unwrap();
        assert!(matches!(
            db.append(&dn("o=a"), csn(2, 1)),
            Err(ChangelogError::OutOfOrderCsn { .. })
        ));
        db.append(&dn("o=a"), csn(1, 2)).unwrap();
        assert_eq!(db.len(&dn("o=a"), ReplicaId(1)), 1);
    }

    #[test]
    fn test_domain_newest_csns() {
        let db = MemoryReplicaDb::new();
        db.append(&dn("o=a"), csn(1, 1)).unwrap();
        db.append(&dn("o=a"), csn(5, 1)).unwrap();
        db.append(&dn("o=a"), csn(3, 2)).unwrap();
        db.append(&dn("o=b"), csn(9, 3)).unwrap();
        let newest = db.domain_newest_csns(&dn("o=a")).unwrap();
        assert_eq!(newest.csns(), vec![csn(5, 1), csn(3, 2)]);

        db.mark_unreadable(&dn("o=b"));
        assert!(matches!(
            db.domain_newest_csns(&dn("o=b")),
            Err(ChangelogError::UnreadableDomain { .. })
        ));
        assert!(db.cursor_from(&dn("o=b"), ReplicaId(3), None).is_err());
    }

    #[test]
    fn test_index_db_append_and_read() {
        let db = MemoryChangeNumberIndexDb::new();
        assert_eq!(db.newest_record().unwrap(), None);
        db.add_record(record(1, 10)).unwrap();
        db.add_record(record(2, 20)).unwrap();
        assert!(matches!(
            db.add_record(record(2, 30)),
            Err(ChangelogError::NonIncreasingChangeNumber { last: 2, attempted: 2 })
        ));
        assert_eq!(db.newest_record().unwrap().unwrap().change_number, 2);
        assert_eq!(db.oldest_record().unwrap().unwrap().change_number, 1);
        let from_two = db.read_from(2, 10).unwrap();
        assert_eq!(from_two.len(), 1);
        assert_eq!(from_two[0].csn, csn(20, 1));
        assert_eq!(db.read_from(1, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_index_db_purge_keeps_newest() {
        let db = MemoryChangeNumberIndexDb::new();
        for cn in 1..=4 {
            db.add_record(record(cn, cn * 10)).unwrap();
        }
        assert_eq!(db.purge_up_to(&csn(25, 1)).unwrap(), Some(csn(30, 1)));
        assert_eq!(db.len(), 2);
        assert_eq!(db.purge_up_to(&csn(1000, 1)).unwrap(), Some(csn(40, 1)));
        assert_eq!(db.len(), 1);
        db.clear().unwrap();
        assert!(db.is_empty());
        assert_eq!(db.purge_up_to(&csn(1, 1)).unwrap(), None);
    }

    #[test]
    fn test_index_db_surfaces_corruption() {
        let db = MemoryChangeNumberIndexDb::new();
        db.add_record(record(1, 10)).unwrap();
        db.push_raw("{not json");
        assert!(matches!(
            db.newest_record(),
            Err(ChangelogError::CorruptRecord { .. })
        ));
        assert!(db.records().is_err());
    }
}
