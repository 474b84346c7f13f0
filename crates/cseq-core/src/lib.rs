//! # cseq-core
//!
//! Causal ordering primitives for multi-master replication.
//!
//! This crate provides:
//! - [`Csn`]: change sequence numbers, totally ordered and string-sortable
//! - [`CsnGenerator`]: the per-replica logical clock stamping local changes
//! - [`ServerState`]: newest known CSN per replica
//! - [`MultiDomainServerState`]: newest known CSN per replica per domain,
//!   also used as the changelog cookie
//!
//! ## Example
//!
//! ```rust
//! use cseq_core::{CsnGenerator, DomainId, MultiDomainServerState, ReplicaId, ServerState};
//!
//! let generator = CsnGenerator::new(ReplicaId(101));
//! let first = generator.new_csn();
//! let second = generator.new_csn();
//! assert!(second > first);
//!
//! let state = ServerState::new();
//! state.update(second);
//! assert!(state.cover(&first));
//!
//! let cookie = MultiDomainServerState::new();
//! cookie.update(&DomainId::new("dc=example,dc=com").unwrap(), second);
//! let text = cookie.to_string();
//! assert_eq!(text.parse::<MultiDomainServerState>().unwrap(), cookie);
//! ```

pub mod csn;
pub mod error;
pub mod generator;
pub mod ids;
pub mod lattice;
pub mod multi_domain;
pub mod server_state;
pub mod time;

pub use csn::{Csn, CSN_BYTES_LEN, CSN_STRING_LEN, MAX_SEQ};
pub use error::DecodeError;
pub use generator::CsnGenerator;
pub use ids::{DomainId, ReplicaId};
pub use lattice::Lattice;
pub use multi_domain::MultiDomainServerState;
pub use server_state::ServerState;
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
