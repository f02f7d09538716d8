//! Commit core of a sharded document store: the retryable-write session
//! table, the per-shard oplog, chunk migration, metadata consistency
//! checking and connection pool accounting.

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod consistency;
pub mod document;
pub mod error;
pub mod migration;
pub mod offline;
pub mod oplog;
pub mod pool;
pub mod router;
pub mod session;
pub mod settings;
pub mod shard;
pub mod storage;
pub mod wal;

pub use catalog::{Catalog, ChunkVersion, ShardId};
pub use cluster::Cluster;
pub use config::{ClusterConfig, DurabilityMode};
pub use consistency::{CheckOptions, CheckScope, Inconsistency, InconsistencyType, Severity};
pub use document::{Document, KeyRange, KeyValue, to_document};
pub use error::{ErrorCode, ShardError};
pub use migration::{MigrationCoordinator, MigrationHooks, MigrationPhase};
pub use oplog::{Oplog, OplogEntry, Timestamp};
pub use pool::{ConnPoolStats, ConnectionLease, PoolAccountant};
pub use router::{Router, WriteCommand};
pub use session::{SessionId, SessionStore, TxnNumber, WriteReply};
pub use settings::{QuerySettings, QuerySettingsStore, QueryShape};
pub use shard::{Shard, WriteOp};
