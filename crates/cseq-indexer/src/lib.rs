//! # cseq-indexer
//!
//! Global sequencing of multi-domain replication changes.
//!
//! The [`ChangeNumberIndexer`] merges the per-(domain, replica) CSN streams
//! of a changelog into a single, gap-free sequence of change numbers. A
//! change is only indexed once every live replica of every tracked domain
//! has been heard from at or past its CSN, so no older change can show up
//! after it has been numbered.
//!
//! ## Architecture
//!
//! - [`changelog`]: storage collaborator traits and the startup snapshot
//! - [`memory`]: in-memory storage for tests and simulation
//! - [`composite`]: cursor merging every replica stream by CSN
//! - [`consistency`]: liveness tracking and the medium consistency point
//! - [`indexer`]: the worker task and its handle
//!
//! ## Example
//!
//! ```rust
//! use cseq_core::{Csn, DomainId, ReplicaId};
//! use cseq_indexer::{
//!     ChangeNumberIndexer, ChangelogState, IndexerConfig, MemoryChangeNumberIndexDb,
//!     MemoryReplicaDb,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let domain = DomainId::new("dc=example,dc=com").unwrap();
//! let replica_db = Arc::new(MemoryReplicaDb::new());
//! let index_db = Arc::new(MemoryChangeNumberIndexDb::new());
//! let state = ChangelogState::new().with_replica(domain.clone(), ReplicaId(1));
//!
//! let indexer = ChangeNumberIndexer::start(
//!     IndexerConfig::default(),
//!     replica_db.clone(),
//!     index_db.clone(),
//!     state,
//! )
//! .unwrap();
//!
//! let csn = Csn::new(1, 0, ReplicaId(1));
//! replica_db.append(&domain, csn).unwrap();
//! indexer.publish_update_msg(&domain, csn);
//! indexer.wait_until_idle().await;
//!
//! assert_eq!(indexer.last_change_number(), 1);
//! indexer.shutdown().await.unwrap();
//! # });
//! ```

pub mod changelog;
pub mod composite;
pub mod config;
pub mod consistency;
pub mod error;
pub mod indexer;
pub mod memory;
pub mod record;

pub use changelog::{ChangeNumberIndexDb, ChangelogState, ReplicaCursor, ReplicaDb};
pub use composite::CompositeCursor;
pub use config::{IndexerConfig, IndexerConfigBuilder};
pub use consistency::{ConsistencyPoint, ConsistencyTracker, Verdict};
pub use error::{ChangelogError, IndexerError, Result};
pub use indexer::{ChangeNumberIndexer, IndexerStatus};
pub use memory::{MemoryChangeNumberIndexDb, MemoryReplicaCursor, MemoryReplicaDb};
pub use record::ChangeNumberIndexRecord;
