//! Owner of a master's replicated segments: the shared write-rpc cap,
//! the backup selector, the replication-epoch task, the scheduling queue
//! that drives per-segment state machines, and the failure monitor feeding
//! cluster membership changes into them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use crate::common::{SegmentId, ServerId};
use crate::master::epoch::UpdateReplicationEpochTask;
use crate::master::logseg::LogSegment;
use crate::master::segment::{ReplicatedSegment, SegmentCtx};

#[cfg(test)]
use crate::master::segment::Progress;
use crate::master::selector::BackupSelector;
use crate::tracker::{ServerChange, ServerTracker};
use crate::transport::{BackupClient, CoordinatorClient};
use crate::utils::MirrorlogError;

use serde::Deserialize;

use tokio::sync::Notify;
use tokio::time::{self, Duration, Instant};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    /// Number of replicas maintained per segment.
    pub num_replicas: usize,

    /// Chunking bound for large segment writes.
    pub max_bytes_per_write_rpc: u32,

    /// Cap on concurrent write rpcs across all of this master's segments.
    pub max_write_rpcs_in_flight: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            num_replicas: 3,
            max_bytes_per_write_rpc: 1 << 20,
            max_write_rpcs_in_flight: 4,
        }
    }
}

impl ReplicationConfig {
    /// Parses a config from defaults overlaid with the given TOML string.
    pub fn parse(config_str: Option<&str>) -> Result<Self, MirrorlogError> {
        parsed_config!(config_str => ReplicationConfig;
                       num_replicas, max_bytes_per_write_rpc,
                       max_write_rpcs_in_flight)
    }
}

/// Work item on the manager's scheduling queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ManagerTask {
    Segment(SegmentId),
    Epoch,
}

struct ManagerInner {
    segments: HashMap<SegmentId, ReplicatedSegment>,
    queue: VecDeque<ManagerTask>,
    write_rpcs_in_flight: u32,
    selector: BackupSelector,
    epoch: UpdateReplicationEpochTask,
    epoch_scheduled: bool,
    head_segment_id: Option<SegmentId>,
}

/// Replication engine of one master. All mutable state lives behind one
/// mutex; rpc completions and schedule requests wake a driver task that
/// makes queue progress, and `sync()` callers drive it directly as well.
pub struct ReplicaManager {
    me: ServerId,
    config: ReplicationConfig,
    client: Arc<dyn BackupClient>,
    inner: Mutex<ManagerInner>,
    wake: Arc<Notify>,
}

impl ReplicaManager {
    /// Creates the manager and spawns its driver and failure-monitor tasks.
    /// Must be called within a tokio runtime.
    pub fn new(
        me: ServerId,
        config: ReplicationConfig,
        client: Arc<dyn BackupClient>,
        coordinator: Arc<dyn CoordinatorClient>,
        tracker: ServerTracker,
    ) -> Arc<Self> {
        let wake = Arc::new(Notify::new());
        let manager = Arc::new(ReplicaManager {
            me,
            config,
            client,
            inner: Mutex::new(ManagerInner {
                segments: HashMap::new(),
                queue: VecDeque::new(),
                write_rpcs_in_flight: 0,
                selector: BackupSelector::new(me, tracker.clone()),
                epoch: UpdateReplicationEpochTask::new(
                    me,
                    coordinator,
                    wake.clone(),
                ),
                epoch_scheduled: false,
                head_segment_id: None,
            }),
            wake,
        });

        // failure monitor: membership changes translate into per-segment
        // re-replication work
        let weak = Arc::downgrade(&manager);
        let mut changes = tracker.subscribe();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let manager = match Weak::upgrade(&weak) {
                    Some(manager) => manager,
                    None => return,
                };
                match change {
                    ServerChange::Crashed(id)
                    | ServerChange::Removed(id) => {
                        manager.handle_backup_failure(id);
                    }
                    ServerChange::Added(_) => {}
                }
            }
        });

        // driver: drains the scheduling queue whenever woken, polling at a
        // short cadence while segments still have in-flight work
        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            loop {
                let manager = match Weak::upgrade(&weak) {
                    Some(manager) => manager,
                    None => return,
                };
                let idle = {
                    let mut inner = manager.inner.lock().unwrap();
                    manager.perform_pass(&mut inner);
                    inner.queue.is_empty()
                };
                let wake = manager.wake.clone();
                drop(manager);
                if idle {
                    wake.notified().await;
                } else {
                    time::sleep(Duration::from_millis(1)).await;
                }
            }
        });

        manager
    }

    /// This master's server id.
    pub fn server_id(&self) -> ServerId {
        self.me
    }

    /// Opens replication for a new head segment, chaining it behind the
    /// previous head so open/close commit events propagate in order.
    pub fn allocate_head(
        self: &Arc<Self>,
        segment_id: SegmentId,
        segment: Arc<LogSegment>,
    ) -> SegmentHandle {
        let mut inner = self.inner.lock().unwrap();
        let mut replicated = ReplicatedSegment::new(
            self.me,
            segment_id,
            segment,
            self.config.num_replicas,
        );

        if let Some(prev_id) = inner.head_segment_id {
            if let Some(prev) = inner.segments.get_mut(&prev_id) {
                prev.following_segment = Some(segment_id);
                let prev_committed = prev.get_committed();
                replicated.preceding_segment_open_committed =
                    prev_committed.open;
                replicated.preceding_segment_close_committed =
                    prev_committed.close;
            }
        }
        inner.head_segment_id = Some(segment_id);
        inner.segments.insert(segment_id, replicated);
        Self::schedule_segment(&mut inner, segment_id);
        drop(inner);

        pf_debug!(self.me; "replicating new head segment {}", segment_id);
        self.wake.notify_one();
        SegmentHandle {
            manager: self.clone(),
            segment_id,
        }
    }

    /// Garbage-collection probe answer: true while this master still keeps
    /// replication state for the segment.
    pub fn is_replica_needed(&self, segment_id: SegmentId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .segments
            .contains_key(&segment_id)
    }

    /// Resets replicas hosted on a failed backup across all segments,
    /// starting re-replication where open replicas were lost.
    pub fn handle_backup_failure(&self, failed_id: ServerId) {
        let mut inner = self.inner.lock().unwrap();
        let mut need_schedule = vec![];
        {
            let ManagerInner {
                segments,
                write_rpcs_in_flight,
                ..
            } = &mut *inner;
            for (id, segment) in segments.iter_mut() {
                if segment
                    .handle_backup_failure(failed_id, write_rpcs_in_flight)
                {
                    need_schedule.push(*id);
                }
            }
        }
        for id in need_schedule {
            Self::schedule_segment(&mut inner, id);
        }
        drop(inner);
        self.wake.notify_one();
    }

    fn schedule_segment(inner: &mut ManagerInner, segment_id: SegmentId) {
        if let Some(segment) = inner.segments.get_mut(&segment_id) {
            if !segment.scheduled {
                segment.scheduled = true;
                inner.queue.push_back(ManagerTask::Segment(segment_id));
            }
        }
    }

    fn schedule_epoch(inner: &mut ManagerInner) {
        if !inner.epoch_scheduled {
            inner.epoch_scheduled = true;
            inner.queue.push_back(ManagerTask::Epoch);
        }
    }

    /// Runs one scheduled work item. Returns true if one ran.
    fn perform_one(&self, inner: &mut ManagerInner) -> bool {
        let task = match inner.queue.pop_front() {
            Some(task) => task,
            None => return false,
        };
        match task {
            ManagerTask::Epoch => {
                inner.epoch_scheduled = false;
                if inner.epoch.perform_task() {
                    Self::schedule_epoch(inner);
                }
            }
            ManagerTask::Segment(segment_id) => {
                let mut segment = match inner.segments.remove(&segment_id) {
                    Some(segment) => segment,
                    None => return true,
                };
                segment.scheduled = false;

                let ManagerInner {
                    segments,
                    write_rpcs_in_flight,
                    selector,
                    epoch,
                    ..
                } = &mut *inner;
                let mut ctx = SegmentCtx {
                    client: &self.client,
                    wake: &self.wake,
                    write_rpcs_in_flight,
                    max_write_rpcs_in_flight: self
                        .config
                        .max_write_rpcs_in_flight,
                    max_bytes_per_write_rpc: self
                        .config
                        .max_bytes_per_write_rpc,
                    selector,
                    epoch,
                    segments,
                    schedule_self: false,
                    schedule_epoch: false,
                };
                let destroy = segment.perform_task(&mut ctx);
                let schedule_self = ctx.schedule_self;
                let schedule_epoch = ctx.schedule_epoch;

                if destroy {
                    pf_debug!(self.me;
                        "segment {} fully freed, destroying replication \
                         state", segment_id);
                    if inner.head_segment_id == Some(segment_id) {
                        inner.head_segment_id = None;
                    }
                } else {
                    inner.segments.insert(segment_id, segment);
                    if schedule_self {
                        Self::schedule_segment(inner, segment_id);
                    }
                }
                if schedule_epoch {
                    Self::schedule_epoch(inner);
                }
            }
        }
        true
    }

    /// Runs one pass over the currently scheduled work items.
    fn perform_pass(&self, inner: &mut ManagerInner) {
        for _ in 0..inner.queue.len() {
            if !self.perform_one(inner) {
                break;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(
        &self,
        segment_id: SegmentId,
    ) -> Option<(Progress, Vec<(Progress, Progress, Progress)>)> {
        let inner = self.inner.lock().unwrap();
        inner.segments.get(&segment_id).map(|segment| {
            (
                segment.queued,
                segment
                    .replicas
                    .iter()
                    .map(|r| (r.sent, r.acked, r.committed))
                    .collect(),
            )
        })
    }
}

/// Caller-facing handle on one replicated segment; the log module holds one
/// per in-memory segment.
pub struct SegmentHandle {
    manager: Arc<ReplicaManager>,
    segment_id: SegmentId,
}

impl SegmentHandle {
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// True if no further replication work is pending for this segment.
    pub fn is_synced(&self) -> bool {
        let inner = self.manager.inner.lock().unwrap();
        inner
            .segments
            .get(&self.segment_id)
            .map(|segment| segment.is_synced())
            .unwrap_or(true)
    }

    /// Snapshots the appended length and requests the eventual close of the
    /// replicas. After close() the only legal further call is free().
    pub fn close(&self) {
        let mut inner = self.manager.inner.lock().unwrap();
        if let Some(segment) = inner.segments.get_mut(&self.segment_id) {
            segment.close();
            ReplicaManager::schedule_segment(&mut inner, self.segment_id);
        }
        drop(inner);
        self.manager.wake.notify_one();
    }

    fn check_synced(
        inner: &ManagerInner,
        segment_id: SegmentId,
        offset: Option<u32>,
    ) -> bool {
        let segment = match inner.segments.get(&segment_id) {
            Some(segment) => segment,
            // destroyed: nothing left to wait for
            None => return true,
        };
        if segment.recovering_from_lost_open_replicas {
            return false;
        }
        match offset {
            Some(offset) => segment.get_committed().bytes >= offset,
            None => segment.get_committed().close,
        }
    }

    /// Blocks until a certificate has durably committed for at least
    /// `offset` bytes on all replicas; with `None`, until the queued close
    /// has committed as well. During re-replication of lost open replicas,
    /// additionally waits until the coordinator records the bumped epoch.
    /// Never returns an error; a one-second watchdog dumps progress while
    /// stuck.
    pub async fn sync(&self, offset: Option<u32>) {
        // serialize syncers so one thread at a time advances queued.bytes;
        // back-to-back certificate-free chunks must not starve
        // certificate-bearing ones
        let sync_lock = {
            let inner = self.manager.inner.lock().unwrap();
            match inner.segments.get(&self.segment_id) {
                Some(segment) => segment.sync_lock.clone(),
                None => return,
            }
        };
        let _sync_guard = sync_lock.lock().await;

        {
            let mut inner = self.manager.inner.lock().unwrap();
            if Self::check_synced(&inner, self.segment_id, offset) {
                return;
            }
            if let Some(segment) = inner.segments.get_mut(&self.segment_id)
            {
                if segment.update_queued_bytes() {
                    ReplicaManager::schedule_segment(
                        &mut inner,
                        self.segment_id,
                    );
                }
            }
        }

        let mut last_report = Instant::now();
        loop {
            {
                let mut inner = self.manager.inner.lock().unwrap();
                self.manager.perform_pass(&mut inner);
                if Self::check_synced(&inner, self.segment_id, offset) {
                    return;
                }
            }
            if last_report.elapsed() >= Duration::from_secs(1) {
                pf_warn!(self.manager.me;
                    "log write sync has taken over 1s; seems to be stuck");
                let inner = self.manager.inner.lock().unwrap();
                if let Some(segment) = inner.segments.get(&self.segment_id)
                {
                    segment.dump_progress();
                }
                drop(inner);
                last_report = Instant::now();
            }
            time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Quiesces outstanding work, then frees all replicas and tears down
    /// the segment's replication state. Returns once every replica is
    /// freed, so the segment's log memory is reusable.
    pub async fn free(self) {
        self.sync(None).await;

        {
            let mut inner = self.manager.inner.lock().unwrap();
            let ManagerInner {
                segments,
                write_rpcs_in_flight,
                ..
            } = &mut *inner;
            match segments.get_mut(&self.segment_id) {
                Some(segment) => {
                    pf_debug!(self.manager.me;
                        "freeing replicas of segment {}", self.segment_id);
                    segment.prepare_free(write_rpcs_in_flight)
                }
                None => return,
            }
            ReplicaManager::schedule_segment(&mut inner, self.segment_id);
        }

        loop {
            {
                let mut inner = self.manager.inner.lock().unwrap();
                self.manager.perform_pass(&mut inner);
                if !inner.segments.contains_key(&self.segment_id) {
                    return;
                }
            }
            time::sleep(Duration::from_millis(1)).await;
        }
    }
}
