//! Records of the global change number index.

use crate::error::ChangelogError;
use cseq_core::{Csn, DomainId, MultiDomainServerState};
use serde::{Deserialize, Serialize};

/// One entry of the global change number index.
///
/// `preceding_cookie` is the cookie as of just before this record: a
/// changelog reader resuming from it sees this record next.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNumberIndexRecord {
    pub change_number: u64,
    pub csn: Csn,
    pub domain: DomainId,
    pub preceding_cookie: MultiDomainServerState,
}

impl ChangeNumberIndexRecord {
    pub fn new(
        change_number: u64,
        csn: Csn,
        domain: DomainId,
        preceding_cookie: MultiDomainServerState,
    ) -> Self {
        Self {
            change_number,
            csn,
            domain,
            preceding_cookie,
        }
    }

    /// The cookie including this record.
    pub fn cookie_after(&self) -> MultiDomainServerState {
        let cookie = self.preceding_cookie.clone();
        cookie.update(&self.domain, self.csn);
        cookie
    }

    /// Encode as a single JSON line.
    pub fn encode(&self) -> Result<String, ChangelogError> {
        serde_json::to_string(self).map_err(|e| ChangelogError::Storage(e.to_string()))
    }

    /// Decode a stored line. Anything unreadable is a corrupt record.
    pub fn decode(raw: &str) -> Result<Self, ChangelogError> {
        serde_json::from_str(raw).map_err(|e| ChangelogError::CorruptRecord {
            raw: raw.to_string(),
            reason: e.to_string(),
        })
    }
}
