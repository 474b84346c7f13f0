//! Error types for the changelog collaborators and the indexer.

use cseq_core::{DecodeError, DomainId};
use thiserror::Error;

/// Errors reported by the replica DB and the change number index DB.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangelogError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt index record '{raw}': {reason}")]
    CorruptRecord { raw: String, reason: String },

    #[error("Domain {domain} is unreadable: {reason}")]
    UnreadableDomain { domain: DomainId, reason: String },

    #[error("Change number {attempted} does not follow {last}")]
    NonIncreasingChangeNumber { last: u64, attempted: u64 },

    #[error("CSN {attempted} is not newer than {last} in its replica stream")]
    OutOfOrderCsn { last: String, attempted: String },

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Errors surfaced by the change number indexer handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexerError {
    #[error("Indexer failed to initialize: {0}")]
    Initialization(#[source] ChangelogError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Indexer worker failed: {0}")]
    WorkerFailed(String),
}

impl From<serde_json::Error> for IndexerError {
    fn from(err: serde_json::Error) -> Self {
        IndexerError::InvalidConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChangelogError>;
