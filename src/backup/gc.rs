//! Replica garbage collection on a backup. Two task kinds reclaim frames
//! whose masters are gone: one probes masters about replicas found on
//! storage at restart, the other sweeps replicas of servers the cluster has
//! fully recovered from.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::backup::service::BackupInner;
use crate::common::{ReplicaKey, SegmentId, ServerId};
use crate::tasks::{Task, TaskOutcome};
use crate::tracker::{ServerState, ServerTracker};
use crate::transport::{MasterClient, RpcHandle};

use tokio::sync::Notify;

/// Periodically asks a master whether replicas of its segments found on
/// storage at restart are still needed, freeing the ones it has moved past.
/// At most one probe is in flight at a time; replicas are probed one by one.
pub struct GarbageCollectReplicasFoundOnStorageTask {
    me: ServerId,
    master_id: ServerId,
    segment_ids: VecDeque<SegmentId>,
    inner: Arc<Mutex<BackupInner>>,
    tracker: ServerTracker,
    master_client: Arc<dyn MasterClient>,
    gc_enabled: bool,
    wake: Arc<Notify>,

    /// Outstanding probe and the segment it asks about.
    probe: Option<(SegmentId, RpcHandle<bool>)>,
}

impl GarbageCollectReplicasFoundOnStorageTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        me: ServerId,
        master_id: ServerId,
        segment_ids: Vec<SegmentId>,
        inner: Arc<Mutex<BackupInner>>,
        tracker: ServerTracker,
        master_client: Arc<dyn MasterClient>,
        gc_enabled: bool,
        wake: Arc<Notify>,
    ) -> Self {
        GarbageCollectReplicasFoundOnStorageTask {
            me,
            master_id,
            segment_ids: segment_ids.into(),
            inner,
            tracker,
            master_client,
            gc_enabled,
            wake,
            probe: None,
        }
    }

    fn free_replica(&self, segment_id: SegmentId) {
        let key = ReplicaKey {
            master_id: self.master_id,
            segment_id,
        };
        pf_info!(self.me;
            "master has recovered from lost replica; freeing replica for {}",
            key);
        self.inner.lock().unwrap().free_replica(key);
    }

    /// Handles the result of a completed probe. Returns true if the probed
    /// segment should be retained and retried later.
    fn finish_probe(
        &mut self,
        segment_id: SegmentId,
        result: Result<bool, crate::rpc::RpcFailure>,
    ) -> bool {
        match result {
            Ok(false) => {
                self.free_replica(segment_id);
                false
            }
            Ok(true) => {
                pf_info!(self.me;
                    "master has not recovered from lost replica; retaining \
                     replica for <{},{}>; will probe replica status again \
                     later",
                    self.master_id, segment_id);
                true
            }
            Err(e) => {
                // tracker state decides what to do on the next pass
                pf_debug!(self.me;
                    "replica-needed probe to master {} failed: {}; will \
                     re-examine server state",
                    self.master_id, e);
                true
            }
        }
    }
}

impl Task for GarbageCollectReplicasFoundOnStorageTask {
    fn name(&self) -> &'static str {
        "gc-replicas-found-on-storage"
    }

    fn perform_task(&mut self) -> TaskOutcome {
        if !self.gc_enabled {
            return TaskOutcome::Done;
        }

        if let Some((segment_id, mut probe)) = self.probe.take() {
            if !probe.is_ready() {
                self.probe = Some((segment_id, probe));
                return TaskOutcome::Reschedule;
            }
            let result = probe.take_result();
            if self.finish_probe(segment_id, result) {
                self.segment_ids.push_back(segment_id);
            }
            return TaskOutcome::Reschedule;
        }

        // drop segments that were freed through other paths meanwhile
        while let Some(&segment_id) = self.segment_ids.front() {
            let key = ReplicaKey {
                master_id: self.master_id,
                segment_id,
            };
            if self.inner.lock().unwrap().index.contains(key) {
                break;
            }
            self.segment_ids.pop_front();
        }

        let segment_id = match self.segment_ids.pop_front() {
            Some(segment_id) => segment_id,
            None => return TaskOutcome::Done,
        };

        match self.tracker.state_of(self.master_id) {
            Some(ServerState::Crashed) => {
                pf_info!(self.me;
                    "master {} marked crashed; waiting for cluster to \
                     recover from its failure before freeing <{},{}>",
                    self.master_id, self.master_id, segment_id);
                self.segment_ids.push_front(segment_id);
                TaskOutcome::Reschedule
            }
            Some(ServerState::Removed) => {
                pf_info!(self.me;
                    "master {} marked down; cluster has recovered from its \
                     failure", self.master_id);
                self.free_replica(segment_id);
                TaskOutcome::Reschedule
            }
            Some(ServerState::Up) | None => {
                let client = self.master_client.clone();
                let master = self.master_id;
                self.probe = Some((
                    segment_id,
                    RpcHandle::spawn(
                        async move {
                            // confirm the remote's identity first; the
                            // server list may lag an id reassignment
                            if client.get_server_id(master).await? != master
                            {
                                return Err(
                                    crate::rpc::RpcFailure::ServerNotUp,
                                );
                            }
                            client.is_replica_needed(master, segment_id).await
                        },
                        self.wake.clone(),
                    ),
                ));
                TaskOutcome::Reschedule
            }
        }
    }
}

/// Sweeps all replicas of a server the cluster tracker has reported both
/// added and later removed, and cancels any recovery state held for it.
pub struct GarbageCollectDownServerTask {
    me: ServerId,
    master_id: ServerId,
    inner: Arc<Mutex<BackupInner>>,
    gc_enabled: bool,

    /// Recovery cancellation happens once, on the first invocation.
    canceled_recovery: bool,
}

impl GarbageCollectDownServerTask {
    pub fn new(
        me: ServerId,
        master_id: ServerId,
        inner: Arc<Mutex<BackupInner>>,
        gc_enabled: bool,
    ) -> Self {
        GarbageCollectDownServerTask {
            me,
            master_id,
            inner,
            gc_enabled,
            canceled_recovery: false,
        }
    }
}

impl Task for GarbageCollectDownServerTask {
    fn name(&self) -> &'static str {
        "gc-down-server"
    }

    fn perform_task(&mut self) -> TaskOutcome {
        if !self.gc_enabled {
            return TaskOutcome::Done;
        }

        let mut inner = self.inner.lock().unwrap();
        if !self.canceled_recovery {
            self.canceled_recovery = true;
            if let Some(recovery) = inner.recoveries.remove(&self.master_id) {
                recovery.mark_freed();
            }
        }

        // free one replica per invocation, staying cooperative
        match inner.index.segments_of_master(self.master_id).first() {
            Some(&segment_id) => {
                let key = ReplicaKey {
                    master_id: self.master_id,
                    segment_id,
                };
                pf_info!(self.me;
                    "freeing replica {} of down server", key);
                inner.free_replica(key);
                TaskOutcome::Reschedule
            }
            None => TaskOutcome::Done,
        }
    }
}
