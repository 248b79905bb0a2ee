//! Task keeping the coordinator's replication-epoch registry at least as
//! fresh as this master's segments require. Segments recovering from lost
//! open replicas are not durable again until the registry covers their
//! bumped epoch, so stale replicas can never resurface as the log head.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{SegmentEpoch, SegmentId, ServerId};
use crate::transport::{CoordinatorClient, RpcHandle};

use tokio::sync::Notify;

pub(crate) struct UpdateReplicationEpochTask {
    master_id: ServerId,
    coordinator: Arc<dyn CoordinatorClient>,
    wake: Arc<Notify>,

    /// Epochs confirmed recorded at the coordinator.
    current: HashMap<SegmentId, SegmentEpoch>,

    /// Epochs segments asked for but not yet confirmed.
    requested: HashMap<SegmentId, SegmentEpoch>,

    /// Outstanding update rpc, with the pair it advertises.
    rpc: Option<(SegmentId, SegmentEpoch, RpcHandle<()>)>,
}

impl UpdateReplicationEpochTask {
    pub(crate) fn new(
        master_id: ServerId,
        coordinator: Arc<dyn CoordinatorClient>,
        wake: Arc<Notify>,
    ) -> Self {
        UpdateReplicationEpochTask {
            master_id,
            coordinator,
            wake,
            current: HashMap::new(),
            requested: HashMap::new(),
            rpc: None,
        }
    }

    /// True if the coordinator is known to have recorded at least `epoch`
    /// for `segment_id`.
    pub(crate) fn is_at_least(
        &self,
        segment_id: SegmentId,
        epoch: SegmentEpoch,
    ) -> bool {
        self.current
            .get(&segment_id)
            .map(|&e| e >= epoch)
            .unwrap_or(false)
    }

    /// Requests that the coordinator record at least `epoch` for
    /// `segment_id`. Returns true if the task has new work (the caller
    /// schedules it).
    pub(crate) fn update_to_at_least(
        &mut self,
        segment_id: SegmentId,
        epoch: SegmentEpoch,
    ) -> bool {
        if self.is_at_least(segment_id, epoch) {
            return false;
        }
        let requested = self.requested.entry(segment_id).or_insert(epoch);
        if *requested < epoch {
            *requested = epoch;
        }
        true
    }

    /// Polls the outstanding rpc and issues the next one. Returns true if
    /// the task still has work and must stay scheduled.
    pub(crate) fn perform_task(&mut self) -> bool {
        if let Some((segment_id, epoch, mut rpc)) = self.rpc.take() {
            if !rpc.is_ready() {
                self.rpc = Some((segment_id, epoch, rpc));
                return true;
            }
            match rpc.take_result() {
                Ok(()) => {
                    pf_debug!(self.master_id;
                        "coordinator now records epoch {} for segment {}",
                        epoch, segment_id);
                    let current =
                        self.current.entry(segment_id).or_insert(epoch);
                    if *current < epoch {
                        *current = epoch;
                    }
                    // drop satisfied requests
                    if self
                        .requested
                        .get(&segment_id)
                        .map(|&e| e <= epoch)
                        .unwrap_or(false)
                    {
                        self.requested.remove(&segment_id);
                    }
                }
                Err(e) => {
                    // leave the request pending; retried next invocation
                    pf_warn!(self.master_id;
                        "updating replication epoch {} for segment {} \
                         failed: {}; will retry",
                        epoch, segment_id, e);
                }
            }
        }

        match self.requested.iter().next() {
            Some((&segment_id, &epoch)) => {
                let coordinator = self.coordinator.clone();
                let master_id = self.master_id;
                self.rpc = Some((
                    segment_id,
                    epoch,
                    RpcHandle::spawn(
                        async move {
                            coordinator
                                .update_replication_epoch(
                                    master_id, segment_id, epoch,
                                )
                                .await
                        },
                        self.wake.clone(),
                    ),
                ));
                true
            }
            None => false,
        }
    }
}
