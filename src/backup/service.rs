//! The backup's request handler: replica writes and frees, replication
//! group assignment, recovery kick-off and data serving, restart from
//! storage, and the wiring of garbage-collection tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use crate::backup::gc::{
    GarbageCollectDownServerTask, GarbageCollectReplicasFoundOnStorageTask,
};
use crate::backup::index::{ReplicaEntry, ReplicaIndex};
use crate::backup::recovery::{FilterTask, MasterRecovery, RecoveryReplica};
use crate::backup::storage::{FrameError, FrameStore, ReplicaMetadata};
use crate::common::{
    Partition, PartitionId, RecoveryId, ReplicaKey, SegmentId, ServerId,
};
use crate::rpc::{
    GetRecoveryDataResponse, RpcFailure, StartReadingDataResponse,
    WriteSegmentRequest, WriteSegmentResponse,
};
use crate::tasks::TaskQueue;
use crate::tracker::{ServerChange, ServerTracker};
use crate::transport::MasterClient;
use crate::utils::MirrorlogError;

use serde::Deserialize;

/// Cluster name that never adopts replicas across restarts.
pub const UNNAMED_CLUSTER: &str = "__unnamed__";

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Fixed size of every segment and frame in bytes.
    pub segment_size: u32,

    /// Size of the frame pool.
    pub num_segment_frames: usize,

    /// Use the volatile frame pool instead of single-file storage.
    pub in_memory: bool,

    /// Gate for replica reuse across restarts; `__unnamed__` never reuses.
    pub cluster_name: String,

    /// Storage file path; empty means an auto-generated temp file.
    pub backup_file_path: String,

    /// Enable the restart and down-server garbage collectors.
    pub gc: bool,

    /// Persist appends before acknowledging them.
    pub sync_writes: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            segment_size: 8 << 20,
            num_segment_frames: 512,
            in_memory: false,
            cluster_name: UNNAMED_CLUSTER.into(),
            backup_file_path: "".into(),
            gc: false,
            sync_writes: false,
        }
    }
}

impl BackupConfig {
    /// Parses a config from defaults overlaid with the given TOML string.
    pub fn parse(config_str: Option<&str>) -> Result<Self, MirrorlogError> {
        parsed_config!(config_str => BackupConfig;
                       segment_size, num_segment_frames, in_memory,
                       cluster_name, backup_file_path, gc, sync_writes)
    }
}

/// Mutable state of one backup, guarded by the service-wide mutex. RPC
/// worker threads and garbage-collection tasks take turns on it; every
/// critical section is short.
pub(crate) struct BackupInner {
    pub(crate) store: FrameStore,
    pub(crate) index: ReplicaIndex,
    pub(crate) replication_id: u64,
    pub(crate) replication_group: Vec<ServerId>,
    pub(crate) recoveries: HashMap<ServerId, Arc<MasterRecovery>>,
    pub(crate) former_server_id: ServerId,
}

impl BackupInner {
    /// Drops the index entry under `key` (if live) and returns its frame to
    /// the pool. Loaded recovery views of the data stay valid.
    pub(crate) fn free_replica(&mut self, key: ReplicaKey) {
        if let Some(entry) = self.index.remove(key) {
            self.store.free(&entry.frame);
        }
    }
}

/// One backup server's replica store service.
pub struct BackupService {
    me: ServerId,
    config: BackupConfig,
    inner: Arc<Mutex<BackupInner>>,
    task_queue: Arc<TaskQueue>,
    tracker: ServerTracker,
    master_client: Arc<dyn MasterClient>,
}

impl BackupService {
    /// Creates the service, restoring replicas from storage when the stored
    /// cluster name matches, and subscribes to cluster membership changes
    /// for garbage collection. Must be called within a tokio runtime.
    pub fn new(
        me: ServerId,
        config: BackupConfig,
        tracker: ServerTracker,
        master_client: Arc<dyn MasterClient>,
    ) -> Result<Arc<Self>, MirrorlogError> {
        let store = if config.in_memory {
            FrameStore::new_memory(
                config.segment_size,
                config.num_segment_frames,
            )
        } else {
            let path = if config.backup_file_path.is_empty() {
                std::env::temp_dir().join(format!(
                    "mirrorlog-backup-{}-{}.frames",
                    std::process::id(),
                    me
                ))
            } else {
                PathBuf::from(&config.backup_file_path)
            };
            pf_info!(me; "backup storage file '{}'", path.display());
            FrameStore::new_file(
                config.segment_size,
                config.num_segment_frames,
                &path,
            )?
        };

        let service = Arc::new(BackupService {
            me,
            config,
            inner: Arc::new(Mutex::new(BackupInner {
                store,
                index: ReplicaIndex::new(),
                replication_id: 0,
                replication_group: vec![],
                recoveries: HashMap::new(),
                former_server_id: ServerId::INVALID,
            })),
            task_queue: TaskQueue::new(),
            tracker,
            master_client,
        });
        service.restart_from_storage()?;

        // watch membership changes; replicas of fully-recovered (removed)
        // servers are garbage
        let weak = Arc::downgrade(&service);
        let mut changes = service.tracker.subscribe();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let service = match Weak::upgrade(&weak) {
                    Some(service) => service,
                    None => return,
                };
                if let ServerChange::Removed(id) = change {
                    service.note_server_removed(id);
                }
            }
        });

        Ok(service)
    }

    /// This backup's server id.
    pub fn server_id(&self) -> ServerId {
        self.me
    }

    /// The maintenance task queue; tests step it deterministically.
    pub fn task_queue(&self) -> &Arc<TaskQueue> {
        &self.task_queue
    }

    /// Spawns the production worker loop for the maintenance queue.
    pub fn spawn_task_worker(&self) {
        self.task_queue.spawn_worker();
    }

    /// Master id recorded by the most recently durable open replica adopted
    /// at restart; lets this process enlist as a crashed predecessor's
    /// replacement. Invalid when no open replica was adopted.
    pub fn former_server_id(&self) -> ServerId {
        self.inner.lock().unwrap().former_server_id
    }

    /// Number of free frames in the pool (test observability).
    pub fn free_frames(&self) -> usize {
        self.inner.lock().unwrap().store.free_frames()
    }

    /// True if a live replica exists for `(master, segment_id)`.
    pub fn has_replica(&self, master: ServerId, segment_id: SegmentId) -> bool {
        self.inner.lock().unwrap().index.contains(ReplicaKey {
            master_id: master,
            segment_id,
        })
    }

    /// Scans storage and adopts replicas whose metadata validates, gated on
    /// the stored cluster name matching the configured one.
    fn restart_from_storage(&self) -> Result<(), MirrorlogError> {
        if self.config.in_memory {
            return Ok(());
        }

        let mut inner = self.inner.lock().unwrap();
        let stored = inner.store.stored_cluster_name();
        let adopt = self.config.cluster_name != UNNAMED_CLUSTER
            && stored.as_deref() == Some(self.config.cluster_name.as_str());

        if !adopt {
            if let Some(stored) = stored {
                pf_info!(self.me;
                    "stored cluster name '{}' does not match configured \
                     '{}'; scribbling storage",
                    stored, self.config.cluster_name);
                inner.store.scribble();
            }
            inner.store.write_cluster_name(&self.config.cluster_name)?;
            return Ok(());
        }

        // most-recently-durable open replica determines formerServerId
        let mut best_open: Option<(u64, SegmentId, ServerId)> = None;
        let mut by_master: HashMap<ServerId, Vec<SegmentId>> = HashMap::new();

        for (slot, metadata) in inner.store.scan() {
            let metadata = match metadata {
                Some(metadata) => metadata,
                None => continue,
            };
            if metadata.segment_capacity != self.config.segment_size {
                pf_warn!(self.me;
                    "stored replica <{},{}> has segment size {} but {} is \
                     configured; freeing frame",
                    metadata.master_id, metadata.segment_id,
                    metadata.segment_capacity, self.config.segment_size);
                continue;
            }
            pf_info!(self.me;
                "found stored replica <{},{}> on backup storage in frame \
                 which was {}",
                metadata.master_id, metadata.segment_id,
                if metadata.closed { "closed" } else { "open" });

            if !metadata.closed {
                let rank =
                    (metadata.segment_epoch, metadata.segment_id, metadata.master_id);
                if best_open
                    .map(|(e, s, _)| (e, s) < (rank.0, rank.1))
                    .unwrap_or(true)
                {
                    best_open = Some(rank);
                }
            }

            let key = ReplicaKey {
                master_id: metadata.master_id,
                segment_id: metadata.segment_id,
            };
            by_master
                .entry(key.master_id)
                .or_default()
                .push(key.segment_id);
            let frame = inner.store.adopt(slot, metadata.clone());
            inner.index.insert(
                key,
                ReplicaEntry {
                    frame,
                    closed: metadata.closed,
                    primary: metadata.primary,
                    last_write_epoch: metadata.segment_epoch,
                    found_on_storage: true,
                },
            );
        }

        if let Some((_, _, master_id)) = best_open {
            inner.former_server_id = master_id;
        }

        // one restart garbage collector per surviving master
        for (master_id, mut segment_ids) in by_master {
            segment_ids.sort_unstable();
            self.task_queue.schedule(Box::new(
                GarbageCollectReplicasFoundOnStorageTask::new(
                    self.me,
                    master_id,
                    segment_ids,
                    self.inner.clone(),
                    self.tracker.clone(),
                    self.master_client.clone(),
                    self.config.gc,
                    self.task_queue.work_notify(),
                ),
            ));
        }
        Ok(())
    }

    /// writeSegment: opens, appends to, and/or closes one replica. Returns
    /// the backup's current replication group on success.
    pub fn write_segment(
        &self,
        req: WriteSegmentRequest,
    ) -> Result<WriteSegmentResponse, RpcFailure> {
        let segment_size = self.config.segment_size as u64;
        if req.data.len() as u64 > segment_size
            || req.offset as u64 + req.data.len() as u64 > segment_size
        {
            return Err(RpcFailure::SegmentOverflow);
        }

        let key = ReplicaKey {
            master_id: req.master_id,
            segment_id: req.segment_id,
        };
        let mut inner = self.inner.lock().unwrap();
        let response = WriteSegmentResponse {
            group_id: inner.replication_id,
            group: inner.replication_group.clone(),
        };

        match inner.index.lookup(key) {
            Some(entry) if entry.closed => {
                // a closing retry either already got its response or is
                // stale after a crash; raising beats faking idempotence
                return if req.open {
                    Err(RpcFailure::BackupOpenRejected)
                } else {
                    Err(RpcFailure::BadSegmentId)
                };
            }
            Some(entry) if req.open && entry.found_on_storage => {
                // opens must not collide with replicas restored from disk
                return Err(RpcFailure::BackupOpenRejected);
            }
            Some(_) => {}
            None if !req.open => return Err(RpcFailure::BadSegmentId),
            None => {
                let frame = match inner.store.open(self.config.sync_writes) {
                    Ok(frame) => frame,
                    Err(FrameError::OutOfStorage) => {
                        pf_warn!(self.me;
                            "no free frames for new replica {}", key);
                        return Err(RpcFailure::OutOfStorage);
                    }
                    Err(FrameError::Overflow) => {
                        return Err(RpcFailure::SegmentOverflow)
                    }
                };
                pf_debug!(self.me;
                    "opening replica {} in frame {} (primary: {})",
                    key, frame.slot(), req.primary);
                inner.index.insert(
                    key,
                    ReplicaEntry {
                        frame,
                        closed: false,
                        primary: req.primary,
                        last_write_epoch: req.epoch,
                        found_on_storage: false,
                    },
                );
            }
        }

        let segment_size = self.config.segment_size;
        let entry = match inner.index.lookup_mut(key) {
            Some(entry) => entry,
            None => unreachable!("replica installed above"),
        };

        // a write without a certificate leaves the previously durable
        // metadata in place; recovery then exposes only the older prefix
        let metadata = req.certificate.map(|certificate| ReplicaMetadata {
            certificate,
            master_id: req.master_id,
            segment_id: req.segment_id,
            segment_capacity: segment_size,
            segment_epoch: req.epoch,
            closed: req.close,
            primary: entry.primary,
        });

        match entry.frame.append(
            &req.data,
            0,
            req.data.len() as u32,
            req.offset,
            metadata.as_ref(),
        ) {
            Ok(()) => {}
            Err(FrameError::Overflow) => {
                return Err(RpcFailure::SegmentOverflow)
            }
            Err(FrameError::OutOfStorage) => {
                unreachable!("append does not allocate")
            }
        }
        entry.last_write_epoch = req.epoch;
        if req.close {
            entry.closed = true;
            pf_debug!(self.me; "replica {} closed", key);
        }
        Ok(response)
    }

    /// freeSegment: releases the replica's frame if the replica is live.
    /// Idempotent; an active recovery keeps its loaded view of the data.
    pub fn free_segment(&self, master: ServerId, segment_id: SegmentId) {
        let key = ReplicaKey {
            master_id: master,
            segment_id,
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.index.contains(key) {
            pf_debug!(self.me; "freeing replica for {}", key);
            inner.free_replica(key);
        }
    }

    /// assignReplicationGroup: replaces the group returned by subsequent
    /// opens; already-open replicas are unaffected.
    pub fn assign_replication_group(
        &self,
        group_id: u64,
        members: Vec<ServerId>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        pf_info!(self.me;
            "assigned to replication group {} with {} members",
            group_id, members.len());
        inner.replication_id = group_id;
        inner.replication_group = members;
    }

    /// startReadingData: kicks off (or re-serves) the recovery of a crashed
    /// master, returning the replica inventory and any log digest found.
    pub fn start_reading_data(
        &self,
        recovery_id: RecoveryId,
        crashed_master: ServerId,
        partitions: Vec<Partition>,
    ) -> StartReadingDataResponse {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.recoveries.get(&crashed_master) {
            if existing.recovery_id() == recovery_id {
                return existing.cached_response();
            }
            pf_info!(self.me;
                "got startReadingData for recovery {} for crashed master \
                 {}; abandoning existing recovery {} for that master and \
                 starting anew",
                recovery_id, crashed_master, existing.recovery_id());
            existing.mark_freed();
        }

        let replicas: Vec<RecoveryReplica> = inner
            .index
            .segments_of_master(crashed_master)
            .into_iter()
            .map(|segment_id| {
                let key = ReplicaKey {
                    master_id: crashed_master,
                    segment_id,
                };
                let entry = match inner.index.lookup(key) {
                    Some(entry) => entry,
                    None => unreachable!("enumerated key is live"),
                };
                let metadata = entry.frame.metadata();
                RecoveryReplica {
                    segment_id,
                    primary: entry.primary,
                    closed: entry.closed,
                    epoch: metadata
                        .as_ref()
                        .map(|m| m.segment_epoch)
                        .unwrap_or(entry.last_write_epoch),
                    data: entry.frame.load(),
                    certified_len: metadata
                        .map(|m| m.certificate.segment_length)
                        .unwrap_or(0),
                    built: None,
                }
            })
            .collect();

        let recovery = MasterRecovery::new(
            self.me,
            recovery_id,
            crashed_master,
            partitions,
            replicas,
        );
        inner
            .recoveries
            .insert(crashed_master, recovery.clone());
        drop(inner);

        self.task_queue
            .schedule(Box::new(FilterTask::new(recovery.clone())));
        recovery.cached_response()
    }

    /// getRecoveryData: serves one partition of one recovered segment,
    /// blocking until the filter has produced it. Idempotent.
    pub async fn get_recovery_data(
        &self,
        recovery_id: RecoveryId,
        crashed_master: ServerId,
        segment_id: SegmentId,
        partition_id: PartitionId,
    ) -> Result<GetRecoveryDataResponse, RpcFailure> {
        let recovery = {
            let inner = self.inner.lock().unwrap();
            match inner.recoveries.get(&crashed_master) {
                Some(recovery)
                    if recovery.recovery_id() == recovery_id =>
                {
                    recovery.clone()
                }
                _ => return Err(RpcFailure::BadSegmentId),
            }
        };
        recovery.get_recovery_data(segment_id, partition_id).await
    }

    /// Reacts to a server leaving the cluster for good: all of its replicas
    /// and any recovery state for it are garbage.
    pub fn note_server_removed(&self, master_id: ServerId) {
        self.task_queue
            .schedule(Box::new(GarbageCollectDownServerTask::new(
                self.me,
                master_id,
                self.inner.clone(),
                self.config.gc,
            )));
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Mutex<BackupInner>> {
        &self.inner
    }
}
