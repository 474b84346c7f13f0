//! Error types for decoding CSNs, server states and cookies.

use thiserror::Error;

/// A malformed textual or binary encoding.
///
/// Every variant carries the raw input that was rejected so callers can
/// report it verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid CSN '{input}': {reason}")]
    InvalidCsn { input: String, reason: String },

    #[error("Invalid CSN bytes (length {length}): expected {expected} bytes")]
    InvalidCsnBytes { length: usize, expected: usize },

    #[error("Invalid server state '{input}': {reason}")]
    InvalidServerState { input: String, reason: String },

    #[error("Invalid cookie '{input}': {reason}")]
    InvalidCookie { input: String, reason: String },

    #[error("Invalid domain id '{input}': {reason}")]
    InvalidDomainId { input: String, reason: String },
}

impl DecodeError {
    pub(crate) fn csn(input: &str, reason: impl Into<String>) -> Self {
        DecodeError::InvalidCsn {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn server_state(input: &str, reason: impl Into<String>) -> Self {
        DecodeError::InvalidServerState {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn cookie(input: &str, reason: impl Into<String>) -> Self {
        DecodeError::InvalidCookie {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;
