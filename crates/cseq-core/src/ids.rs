//! Identifiers for replicas and replicated domains.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a writable replica (a "server id").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub u32);

impl ReplicaId {
    pub const fn new(id: u32) -> Self {
        ReplicaId(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for ReplicaId {
    fn from(id: u32) -> Self {
        ReplicaId(id)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an independently replicated domain (a partition of the
/// data, usually named by its base DN).
///
/// Domain ids appear verbatim in cookies, so `:` and `;` are rejected.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DomainId(String);

impl DomainId {
    pub fn new(id: impl Into<String>) -> Result<Self, DecodeError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DecodeError::InvalidDomainId {
                input: id,
                reason: "domain id must not be empty".to_string(),
            });
        }
        if id.contains(':') || id.contains(';') {
            return Err(DecodeError::InvalidDomainId {
                input: id,
                reason: "domain id must not contain ':' or ';'".to_string(),
            });
        }
        Ok(DomainId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DomainId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DomainId::new(s)
    }
}

impl TryFrom<String> for DomainId {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DomainId::new(value)
    }
}

impl From<DomainId> for String {
    fn from(id: DomainId) -> Self {
        id.0
    }
}

impl AsRef<str> for DomainId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
