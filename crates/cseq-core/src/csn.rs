//! Change sequence numbers.
//!
//! A CSN identifies one mutation made on one replica. CSNs are totally
//! ordered by `(timestamp, sequence, replica)`; the replica id only breaks
//! ties so that the order is total.
//!
//! The textual form is 32 lowercase hex digits: 16 for the timestamp, 8 for
//! the sequence number and 8 for the replica id. Because every field is
//! fixed width and written most-significant first, comparing two encoded
//! strings gives the same answer as comparing the CSNs themselves. The
//! 16-byte binary form has the same property.

use crate::error::DecodeError;
use crate::ids::ReplicaId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest sequence number a CSN can carry.
pub const MAX_SEQ: u32 = u32::MAX;

/// Length of the textual encoding.
pub const CSN_STRING_LEN: usize = 32;

/// Length of the binary encoding.
pub const CSN_BYTES_LEN: usize = 16;

/// A change sequence number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Csn {
    timestamp: u64,
    seq: u32,
    replica_id: ReplicaId,
}

impl Csn {
    pub const fn new(timestamp: u64, seq: u32, replica_id: ReplicaId) -> Self {
        Csn {
            timestamp,
            seq,
            replica_id,
        }
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn time_seconds(&self) -> u64 {
        self.timestamp / 1000
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn is_older_than(&self, other: &Csn) -> bool {
        self < other
    }

    pub fn is_older_than_or_equal_to(&self, other: &Csn) -> bool {
        self <= other
    }

    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }

    pub fn is_newer_than_or_equal_to(&self, other: &Csn) -> bool {
        self >= other
    }

    /// The CSN immediately preceding this one for the same replica.
    ///
    /// Decrements the sequence number, or borrows one millisecond from the
    /// timestamp when the sequence number is already zero. `None` for the
    /// zero CSN, which has no predecessor.
    pub fn preceding(&self) -> Option<Csn> {
        if self.seq > 0 {
            Some(Csn::new(self.timestamp, self.seq - 1, self.replica_id))
        } else if self.timestamp > 0 {
            Some(Csn::new(self.timestamp - 1, MAX_SEQ, self.replica_id))
        } else {
            None
        }
    }

    /// `preceding` lifted over an optional CSN.
    pub fn preceding_of(csn: Option<&Csn>) -> Option<Csn> {
        csn.and_then(Csn::preceding)
    }

    /// Number of changes made by a replica between `older` and `newer`,
    /// estimated from their sequence numbers.
    ///
    /// Returns `newer.seq` when `older` is absent and 0 when `older` is not
    /// older than `newer`. Handles one wrap-around of the sequence counter.
    pub fn sequence_distance(newer: &Csn, older: Option<&Csn>) -> u64 {
        let Some(older) = older else {
            return u64::from(newer.seq);
        };
        if older >= newer {
            return 0;
        }
        if older.seq <= newer.seq {
            u64::from(newer.seq - older.seq)
        } else {
            u64::from(MAX_SEQ - (older.seq - newer.seq)) + 1
        }
    }

    /// Big-endian binary form; byte order equals CSN order.
    pub fn to_bytes(&self) -> [u8; CSN_BYTES_LEN] {
        let mut bytes = [0u8; CSN_BYTES_LEN];
        bytes[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.seq.to_be_bytes());
        bytes[12..].copy_from_slice(&self.replica_id.get().to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != CSN_BYTES_LEN {
            return Err(DecodeError::InvalidCsnBytes {
                length: bytes.len(),
                expected: CSN_BYTES_LEN,
            });
        }
        let mut ts = [0u8; 8];
        let mut seq = [0u8; 4];
        let mut rid = [0u8; 4];
        ts.copy_from_slice(&bytes[..8]);
        seq.copy_from_slice(&bytes[8..12]);
        rid.copy_from_slice(&bytes[12..]);
        Ok(Csn::new(
            u64::from_be_bytes(ts),
            u32::from_be_bytes(seq),
            ReplicaId(u32::from_be_bytes(rid)),
        ))
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:08x}{:08x}",
            self.timestamp,
            self.seq,
            self.replica_id.get()
        )
    }
}

impl fmt::Debug for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Csn({}, ts={}, seq={}, rid={})",
            self, self.timestamp, self.seq, self.replica_id
        )
    }
}

impl FromStr for Csn {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != CSN_STRING_LEN {
            return Err(DecodeError::csn(
                s,
                format!("expected {} hex digits, found {}", CSN_STRING_LEN, s.len()),
            ));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DecodeError::csn(s, "contains non-hex characters"));
        }
        let timestamp =
            u64::from_str_radix(&s[..16], 16).map_err(|e| DecodeError::csn(s, e.to_string()))?;
        let seq =
            u32::from_str_radix(&s[16..24], 16).map_err(|e| DecodeError::csn(s, e.to_string()))?;
        let rid =
            u32::from_str_radix(&s[24..], 16).map_err(|e| DecodeError::csn(s, e.to_string()))?;
        Ok(Csn::new(timestamp, seq, ReplicaId(rid)))
    }
}

impl TryFrom<String> for Csn {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Csn> for String {
    fn from(csn: Csn) -> Self {
        csn.to_string()
    }
}
