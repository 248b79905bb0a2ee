//! Backup-side subsystems: the frame pool, the replica index, the request
//! handler service, per-crashed-master recovery state, and replica garbage
//! collection.

mod gc;
mod index;
mod recovery;
mod service;
mod storage;

pub use recovery::MasterRecovery;
pub use service::{BackupConfig, BackupService, UNNAMED_CLUSTER};
pub use storage::{
    Frame, FrameError, FrameRef, FrameStore, ReplicaMetadata,
    METADATA_BLOCK_LEN,
};
