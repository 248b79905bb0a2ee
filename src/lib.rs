//! Mirrorlog: the durable-replication and recovery core of a distributed
//! in-memory log-structured store. Masters keep their data in volatile
//! memory as an append-only log of fixed-size segments; durability comes
//! from asynchronously mirroring every segment to several backups, which
//! persist replicas in segment-sized frames. When a master crashes,
//! surviving backups stream its replicas in parallel to substitute masters
//! that reconstruct the lost tablets.
//!
//! Three subsystems make up the crate:
//! - the backup replica store ([`backup`]): frame pool, replica index,
//!   request handlers, restart-from-storage, and garbage collection;
//! - the master-side replication engine ([`master`]): a per-segment state
//!   machine driving replica opens, appends, closes, and frees under the
//!   log's head-chain ordering constraints, with a blocking `sync`
//!   contract for the log writer;
//! - the recovery coordinator ([`coordinator`]): replica inventory fan-out,
//!   log-digest verification, and partition dispatch to substitutes.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
pub mod utils;

pub mod backup;
pub mod common;
pub mod coordinator;
pub mod master;
pub mod rpc;
pub mod tasks;
pub mod tracker;
pub mod transport;

pub use backup::{BackupConfig, BackupService};
pub use common::{
    Certificate, LogDigest, LogEntry, Partition, ReplicaKey, ServerId,
    Tablet,
};
pub use coordinator::{EpochRegistry, RecoveryCoordinator, RecoveryError};
pub use master::{
    LogSegment, ReplicaManager, ReplicationConfig, SegmentHandle,
};
pub use tracker::ServerTracker;
pub use transport::LoopbackNet;
pub use utils::MirrorlogError;
