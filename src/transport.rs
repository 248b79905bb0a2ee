//! Client-side traits through which the three roles reach each other, plus
//! the pollable RPC handle the master's replication state machine drives.
//!
//! NOTE: Real network transport is a collaborator outside this crate. The
//! `LoopbackNet` here wires services of one process together so integration
//! tests (and single-process clusters) exercise the full request paths; its
//! method bodies are exactly what a TCP transport would do after decoding.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::backup::BackupService;
use crate::common::{
    Partition, PartitionId, RecoveryId, SegmentEpoch, SegmentId, ServerId,
};
use crate::coordinator::EpochRegistry;
use crate::master::ReplicaManager;
use crate::rpc::{
    GetRecoveryDataResponse, ReplicaSource, RpcFailure,
    StartReadingDataResponse, WriteSegmentRequest, WriteSegmentResponse,
};
use crate::tracker::ServerTracker;

use async_trait::async_trait;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::Notify;

/// Calls a master makes against backup services.
#[async_trait]
pub trait BackupClient: Send + Sync {
    async fn write_segment(
        &self,
        backup: ServerId,
        req: WriteSegmentRequest,
    ) -> Result<WriteSegmentResponse, RpcFailure>;

    async fn free_segment(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: SegmentId,
    ) -> Result<(), RpcFailure>;

    async fn assign_replication_group(
        &self,
        backup: ServerId,
        group_id: u64,
        members: Vec<ServerId>,
    ) -> Result<(), RpcFailure>;

    async fn start_reading_data(
        &self,
        backup: ServerId,
        recovery_id: RecoveryId,
        crashed_master: ServerId,
        partitions: Vec<Partition>,
    ) -> Result<StartReadingDataResponse, RpcFailure>;

    async fn get_recovery_data(
        &self,
        backup: ServerId,
        recovery_id: RecoveryId,
        crashed_master: ServerId,
        segment_id: SegmentId,
        partition_id: PartitionId,
    ) -> Result<GetRecoveryDataResponse, RpcFailure>;
}

/// Calls backups and the coordinator make against master services.
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Garbage-collection probe: does the master still need this replica?
    async fn is_replica_needed(
        &self,
        master: ServerId,
        segment_id: SegmentId,
    ) -> Result<bool, RpcFailure>;

    /// Identity check used by garbage collection before trusting a probe.
    async fn get_server_id(
        &self,
        server: ServerId,
    ) -> Result<ServerId, RpcFailure>;

    /// Dispatches one recovery partition to a substitute master.
    async fn recover(
        &self,
        master: ServerId,
        recovery_id: RecoveryId,
        crashed_master: ServerId,
        partition_id: PartitionId,
        sources: Vec<ReplicaSource>,
    ) -> Result<(), RpcFailure>;
}

/// Calls a master makes against the coordinator.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Raises the replication epoch recorded for `(master, segment_id)` so
    /// that stale open replicas with older epochs are discarded at recovery.
    async fn update_replication_epoch(
        &self,
        master: ServerId,
        segment_id: SegmentId,
        epoch: SegmentEpoch,
    ) -> Result<(), RpcFailure>;
}

/// Pollable handle on one in-flight RPC. The replication state machine never
/// awaits these; it polls `is_ready` on each scheduling tick and consumes
/// the result with `take_result` once ready. Dropping the handle abandons
/// the call (advisory cancellation).
pub struct RpcHandle<T> {
    rx: oneshot::Receiver<Result<T, RpcFailure>>,
    result: Option<Result<T, RpcFailure>>,
}

impl<T: Send + 'static> RpcHandle<T> {
    /// Spawns the given call onto the runtime. `wake` is notified when the
    /// result lands so the owning task queue gets driven again.
    pub fn spawn(
        fut: impl Future<Output = Result<T, RpcFailure>> + Send + 'static,
        wake: Arc<Notify>,
    ) -> Self {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = fut.await;
            let _ = tx.send(result);
            wake.notify_one();
        });
        RpcHandle { rx, result: None }
    }

    /// True once the call has completed (successfully or not). Never blocks.
    pub fn is_ready(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.result = Some(result);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Closed) => {
                // sender dropped without a response; treat like a dead peer
                self.result = Some(Err(RpcFailure::ServerNotUp));
                true
            }
        }
    }

    /// Consumes the completed result. Must only be called after `is_ready`
    /// returned true; anything else is a programming error.
    pub fn take_result(&mut self) -> Result<T, RpcFailure> {
        match self.result.take() {
            Some(result) => result,
            None => panic!("take_result called on unfinished rpc"),
        }
    }
}

/// Write RPC handle type used by replica slots.
pub type WriteRpc = RpcHandle<WriteSegmentResponse>;

/// Free RPC handle type used by replica slots.
pub type FreeRpc = RpcHandle<()>;

/// Record of one recovery partition dispatched to a substitute master,
/// retained by the loopback net for inspection.
#[derive(Debug, Clone)]
pub struct RecoverDispatch {
    pub master: ServerId,
    pub recovery_id: RecoveryId,
    pub crashed_master: ServerId,
    pub partition_id: PartitionId,
    pub sources: Vec<ReplicaSource>,
}

#[derive(Default)]
struct LoopbackInner {
    backups: HashMap<ServerId, Arc<BackupService>>,
    masters: HashMap<ServerId, Arc<ReplicaManager>>,
    recover_dispatches: Vec<RecoverDispatch>,
}

/// In-process wiring of backup/master/coordinator services.
pub struct LoopbackNet {
    inner: Mutex<LoopbackInner>,
    tracker: ServerTracker,
    epochs: Arc<EpochRegistry>,
}

impl LoopbackNet {
    /// Creates an empty net over the given cluster view.
    pub fn new(tracker: ServerTracker, epochs: Arc<EpochRegistry>) -> Self {
        LoopbackNet {
            inner: Mutex::new(LoopbackInner::default()),
            tracker,
            epochs,
        }
    }

    /// Registers a backup service as reachable.
    pub fn add_backup(&self, id: ServerId, service: Arc<BackupService>) {
        self.inner.lock().unwrap().backups.insert(id, service);
    }

    /// Registers a master's replica manager as reachable.
    pub fn add_master(&self, id: ServerId, manager: Arc<ReplicaManager>) {
        self.inner.lock().unwrap().masters.insert(id, manager);
    }

    /// Recovery partitions dispatched so far, in order.
    pub fn recover_dispatches(&self) -> Vec<RecoverDispatch> {
        self.inner.lock().unwrap().recover_dispatches.clone()
    }

    fn backup(&self, id: ServerId) -> Result<Arc<BackupService>, RpcFailure> {
        if !self.tracker.is_up(id) {
            return Err(RpcFailure::ServerNotUp);
        }
        self.inner
            .lock()
            .unwrap()
            .backups
            .get(&id)
            .cloned()
            .ok_or(RpcFailure::ServerNotUp)
    }

    fn master(&self, id: ServerId) -> Result<Arc<ReplicaManager>, RpcFailure> {
        if !self.tracker.is_up(id) {
            return Err(RpcFailure::ServerNotUp);
        }
        self.inner
            .lock()
            .unwrap()
            .masters
            .get(&id)
            .cloned()
            .ok_or(RpcFailure::ServerNotUp)
    }
}

#[async_trait]
impl BackupClient for LoopbackNet {
    async fn write_segment(
        &self,
        backup: ServerId,
        req: WriteSegmentRequest,
    ) -> Result<WriteSegmentResponse, RpcFailure> {
        self.backup(backup)?.write_segment(req)
    }

    async fn free_segment(
        &self,
        backup: ServerId,
        master: ServerId,
        segment_id: SegmentId,
    ) -> Result<(), RpcFailure> {
        self.backup(backup)?.free_segment(master, segment_id);
        Ok(())
    }

    async fn assign_replication_group(
        &self,
        backup: ServerId,
        group_id: u64,
        members: Vec<ServerId>,
    ) -> Result<(), RpcFailure> {
        self.backup(backup)?
            .assign_replication_group(group_id, members);
        Ok(())
    }

    async fn start_reading_data(
        &self,
        backup: ServerId,
        recovery_id: RecoveryId,
        crashed_master: ServerId,
        partitions: Vec<Partition>,
    ) -> Result<StartReadingDataResponse, RpcFailure> {
        Ok(self.backup(backup)?.start_reading_data(
            recovery_id,
            crashed_master,
            partitions,
        ))
    }

    async fn get_recovery_data(
        &self,
        backup: ServerId,
        recovery_id: RecoveryId,
        crashed_master: ServerId,
        segment_id: SegmentId,
        partition_id: PartitionId,
    ) -> Result<GetRecoveryDataResponse, RpcFailure> {
        let service = self.backup(backup)?;
        service
            .get_recovery_data(
                recovery_id,
                crashed_master,
                segment_id,
                partition_id,
            )
            .await
    }
}

#[async_trait]
impl MasterClient for LoopbackNet {
    async fn is_replica_needed(
        &self,
        master: ServerId,
        segment_id: SegmentId,
    ) -> Result<bool, RpcFailure> {
        Ok(self.master(master)?.is_replica_needed(segment_id))
    }

    async fn get_server_id(
        &self,
        server: ServerId,
    ) -> Result<ServerId, RpcFailure> {
        self.master(server)?;
        Ok(server)
    }

    async fn recover(
        &self,
        master: ServerId,
        recovery_id: RecoveryId,
        crashed_master: ServerId,
        partition_id: PartitionId,
        sources: Vec<ReplicaSource>,
    ) -> Result<(), RpcFailure> {
        self.master(master)?;
        self.inner
            .lock()
            .unwrap()
            .recover_dispatches
            .push(RecoverDispatch {
                master,
                recovery_id,
                crashed_master,
                partition_id,
                sources,
            });
        Ok(())
    }
}

#[async_trait]
impl CoordinatorClient for LoopbackNet {
    async fn update_replication_epoch(
        &self,
        master: ServerId,
        segment_id: SegmentId,
        epoch: SegmentEpoch,
    ) -> Result<(), RpcFailure> {
        self.epochs.update_to_at_least(master, segment_id, epoch);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable backup/coordinator stand-ins for driving the replication
    //! state machine deterministically from tests.

    use super::*;

    use std::collections::{HashSet, VecDeque};

    use tokio::sync::watch;

    #[derive(Default)]
    struct MockState {
        /// Every write request observed, in issue order.
        writes: Vec<(ServerId, WriteSegmentRequest)>,

        /// Every free observed.
        frees: Vec<(ServerId, SegmentId)>,

        /// Backups whose calls currently park until released.
        held: HashSet<ServerId>,

        /// Scripted failures, consumed front-first per backup.
        failures: HashMap<ServerId, VecDeque<RpcFailure>>,

        /// Number of calls currently inside the mock.
        in_flight: usize,

        /// High-water mark of `in_flight`.
        max_in_flight: usize,
    }

    /// Mock implementation of `BackupClient` that records requests, can park
    /// calls, and can fail them with scripted errors.
    pub(crate) struct MockBackups {
        state: Mutex<MockState>,
        released_tx: watch::Sender<u64>,
        released_rx: watch::Receiver<u64>,
    }

    impl MockBackups {
        pub(crate) fn new() -> Arc<Self> {
            let (released_tx, released_rx) = watch::channel(0);
            Arc::new(MockBackups {
                state: Mutex::new(MockState::default()),
                released_tx,
                released_rx,
            })
        }

        /// Parks subsequent calls to `backup` until `release` is called.
        pub(crate) fn hold(&self, backup: ServerId) {
            self.state.lock().unwrap().held.insert(backup);
        }

        /// Releases parked calls to `backup`.
        pub(crate) fn release(&self, backup: ServerId) {
            self.state.lock().unwrap().held.remove(&backup);
            self.released_tx.send_modify(|v| *v += 1);
        }

        /// Scripts the next call to `backup` to fail with `failure`.
        pub(crate) fn fail_next(&self, backup: ServerId, failure: RpcFailure) {
            self.state
                .lock()
                .unwrap()
                .failures
                .entry(backup)
                .or_default()
                .push_back(failure);
        }

        pub(crate) fn writes(&self) -> Vec<(ServerId, WriteSegmentRequest)> {
            self.state.lock().unwrap().writes.clone()
        }

        pub(crate) fn frees(&self) -> Vec<(ServerId, SegmentId)> {
            self.state.lock().unwrap().frees.clone()
        }

        pub(crate) fn max_in_flight(&self) -> usize {
            self.state.lock().unwrap().max_in_flight
        }

        async fn enter(&self, backup: ServerId) -> Result<(), RpcFailure> {
            {
                let mut state = self.state.lock().unwrap();
                state.in_flight += 1;
                state.max_in_flight = state.max_in_flight.max(state.in_flight);
            }
            let mut released = self.released_rx.clone();
            loop {
                if !self.state.lock().unwrap().held.contains(&backup) {
                    break;
                }
                if released.changed().await.is_err() {
                    break;
                }
            }
            let mut state = self.state.lock().unwrap();
            state.in_flight -= 1;
            if let Some(queue) = state.failures.get_mut(&backup) {
                if let Some(failure) = queue.pop_front() {
                    return Err(failure);
                }
            }
            Ok(())
        }
    }

    /// Mock implementation of `CoordinatorClient` recording every epoch
    /// update it accepts.
    #[derive(Default)]
    pub(crate) struct MockCoordinator {
        updates: Mutex<Vec<(ServerId, SegmentId, SegmentEpoch)>>,
    }

    impl MockCoordinator {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(MockCoordinator::default())
        }

        pub(crate) fn updates(
            &self,
        ) -> Vec<(ServerId, SegmentId, SegmentEpoch)> {
            self.updates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CoordinatorClient for MockCoordinator {
        async fn update_replication_epoch(
            &self,
            master: ServerId,
            segment_id: SegmentId,
            epoch: SegmentEpoch,
        ) -> Result<(), RpcFailure> {
            self.updates.lock().unwrap().push((master, segment_id, epoch));
            Ok(())
        }
    }

    #[async_trait]
    impl BackupClient for MockBackups {
        async fn write_segment(
            &self,
            backup: ServerId,
            req: WriteSegmentRequest,
        ) -> Result<WriteSegmentResponse, RpcFailure> {
            self.state
                .lock()
                .unwrap()
                .writes
                .push((backup, req.clone()));
            self.enter(backup).await?;
            Ok(WriteSegmentResponse::default())
        }

        async fn free_segment(
            &self,
            backup: ServerId,
            _master: ServerId,
            segment_id: SegmentId,
        ) -> Result<(), RpcFailure> {
            self.state.lock().unwrap().frees.push((backup, segment_id));
            self.enter(backup).await?;
            Ok(())
        }

        async fn assign_replication_group(
            &self,
            _backup: ServerId,
            _group_id: u64,
            _members: Vec<ServerId>,
        ) -> Result<(), RpcFailure> {
            Ok(())
        }

        async fn start_reading_data(
            &self,
            _backup: ServerId,
            _recovery_id: RecoveryId,
            _crashed_master: ServerId,
            _partitions: Vec<Partition>,
        ) -> Result<StartReadingDataResponse, RpcFailure> {
            Ok(StartReadingDataResponse::default())
        }

        async fn get_recovery_data(
            &self,
            _backup: ServerId,
            _recovery_id: RecoveryId,
            _crashed_master: ServerId,
            _segment_id: SegmentId,
            _partition_id: PartitionId,
        ) -> Result<GetRecoveryDataResponse, RpcFailure> {
            Err(RpcFailure::BadSegmentId)
        }
    }
}


#[cfg(test)]
mod transport_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rpc_handle_completion() {
        let wake = Arc::new(Notify::new());
        let waiter = wake.notified();
        let mut handle: RpcHandle<u32> =
            RpcHandle::spawn(async { Ok(42) }, wake.clone());
        waiter.await;
        assert!(handle.is_ready());
        assert_eq!(handle.take_result(), Ok(42));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rpc_handle_pending_then_failure() {
        let wake = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let gate_clone = gate.clone();
        let waiter = wake.notified();
        let mut handle: RpcHandle<u32> = RpcHandle::spawn(
            async move {
                gate_clone.notified().await;
                Err(RpcFailure::ServerNotUp)
            },
            wake.clone(),
        );
        assert!(!handle.is_ready());
        gate.notify_one();
        waiter.await;
        assert!(handle.is_ready());
        assert_eq!(handle.take_result(), Err(RpcFailure::ServerNotUp));
    }
}
