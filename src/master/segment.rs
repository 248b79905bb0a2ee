//! Per-segment master-side replication state machine: drives asynchronous
//! opening, appending, closing, and freeing of a segment's replicas while
//! honoring the log's head-chain ordering constraints.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{Certificate, SegmentEpoch, SegmentId, ServerId};
use crate::master::epoch::UpdateReplicationEpochTask;
use crate::master::logseg::LogSegment;
use crate::master::selector::BackupSelector;
use crate::rpc::{RpcFailure, WriteSegmentRequest};
use crate::transport::{BackupClient, FreeRpc, RpcHandle, WriteRpc};

use tokio::sync::Notify;

/// Replication progress of one replica (or of the whole segment). The
/// derived ordering is lexicographic over (open, bytes, epoch, close):
/// progress on earlier fields dominates, and a bumped epoch makes otherwise
/// caught-up replicas stale again.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
)]
pub struct Progress {
    pub open: bool,
    pub bytes: u32,
    pub epoch: SegmentEpoch,
    pub close: bool,
}

impl Progress {
    /// Component-wise minimum, used to fold per-replica progress into the
    /// progress the whole segment can count on.
    fn min_with(&mut self, other: &Progress) {
        self.open &= other.open;
        self.bytes = self.bytes.min(other.bytes);
        self.epoch = self.epoch.min(other.epoch);
        self.close &= other.close;
    }
}

/// One replica slot of a replicated segment. Slot 0 is the primary.
#[derive(Default)]
pub(crate) struct Replica {
    pub(crate) is_active: bool,
    pub(crate) backup_id: ServerId,

    /// Progress sent in rpcs (not necessarily delivered).
    pub(crate) sent: Progress,

    /// Progress acknowledged by the backup.
    pub(crate) acked: Progress,

    /// Progress durably buffered on the backup: advances only when an
    /// acknowledged rpc carried a certificate.
    pub(crate) committed: Progress,

    /// The replica replaces one lost while open: its opening write carries
    /// no certificate, so the backup cannot expose it until catch-up
    /// completes atomically.
    pub(crate) replicate_atomically: bool,

    pub(crate) write_rpc: Option<WriteRpc>,
    pub(crate) free_rpc: Option<FreeRpc>,
}

impl Replica {
    /// Associates the slot with a backup; progress starts from scratch.
    fn start(&mut self, backup_id: ServerId) {
        self.is_active = true;
        self.backup_id = backup_id;
    }

    /// Clears the slot entirely (e.g. after a rejected open).
    fn reset(&mut self) {
        *self = Replica::default();
    }

    /// Clears the slot after its backup failed; the replacement replica
    /// must catch up atomically.
    fn failed(&mut self) {
        *self = Replica::default();
        self.replicate_atomically = true;
    }
}

/// Shared manager state a segment needs while performing its task. Borrowed
/// field-wise from the manager's inner state for one invocation.
pub(crate) struct SegmentCtx<'a> {
    pub(crate) client: &'a Arc<dyn BackupClient>,
    pub(crate) wake: &'a Arc<Notify>,
    pub(crate) write_rpcs_in_flight: &'a mut u32,
    pub(crate) max_write_rpcs_in_flight: u32,
    pub(crate) max_bytes_per_write_rpc: u32,
    pub(crate) selector: &'a mut BackupSelector,
    pub(crate) epoch: &'a mut UpdateReplicationEpochTask,

    /// All other segments of this master (the performing one is removed
    /// from the map for the duration of its task).
    pub(crate) segments: &'a mut HashMap<SegmentId, ReplicatedSegment>,

    /// The performing segment asks to run again.
    pub(crate) schedule_self: bool,

    /// The epoch task gained work and must be scheduled.
    pub(crate) schedule_epoch: bool,
}

/// Master-side replication state of one in-memory segment.
pub struct ReplicatedSegment {
    pub(crate) segment_id: SegmentId,
    pub(crate) master_id: ServerId,
    segment: Arc<LogSegment>,

    /// Progress enqueued for replication; what sync() drives toward.
    pub(crate) queued: Progress,
    queued_certificate: Certificate,

    /// Appended length at creation; the opening write covers [0, open_len).
    open_len: u32,
    opening_write_certificate: Certificate,

    /// Once set, no new write rpc may be issued; replicas are being freed.
    pub(crate) free_queued: bool,

    /// Successor in the log's head chain, while open/close-commit events
    /// still need to propagate to it.
    pub(crate) following_segment: Option<SegmentId>,

    /// This segment's non-opening writes must wait for the predecessor's
    /// close to commit; its own open must wait for the predecessor's open.
    pub(crate) preceding_segment_open_committed: bool,
    pub(crate) preceding_segment_close_committed: bool,

    /// An open replica was lost; cleared only when all replicas are
    /// committed and the coordinator records at least `queued.epoch`.
    pub(crate) recovering_from_lost_open_replicas: bool,

    pub(crate) replicas: Vec<Replica>,

    /// Deduplication flag for the manager's scheduling queue.
    pub(crate) scheduled: bool,

    /// Serializes concurrent sync() callers so only one advances
    /// queued.bytes and drives the queue at a time.
    pub(crate) sync_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ReplicatedSegment {
    /// Creates the replication state for `segment`, queueing its current
    /// appended length as the opening write.
    pub(crate) fn new(
        master_id: ServerId,
        segment_id: SegmentId,
        segment: Arc<LogSegment>,
        num_replicas: usize,
    ) -> Self {
        let (open_len, opening_write_certificate) = segment.appended();
        let mut replicas = Vec::with_capacity(num_replicas);
        replicas.resize_with(num_replicas, Replica::default);
        ReplicatedSegment {
            segment_id,
            master_id,
            segment,
            queued: Progress {
                open: true,
                bytes: open_len,
                epoch: 0,
                close: false,
            },
            queued_certificate: opening_write_certificate,
            open_len,
            opening_write_certificate,
            free_queued: false,
            following_segment: None,
            preceding_segment_open_committed: true,
            preceding_segment_close_committed: true,
            recovering_from_lost_open_replicas: false,
            replicas,
            scheduled: false,
            sync_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// True if the replica's durable state satisfies `queued`. A replica
    /// whose close has committed is exempt from epoch staleness: a closed
    /// replica can never be mistaken for the log head, so re-writing it
    /// just to refresh its epoch would only earn a BadSegmentId rejection.
    fn replica_synced(committed: &Progress, queued: &Progress) -> bool {
        if committed == queued {
            return true;
        }
        queued.close
            && committed.close
            && committed.open == queued.open
            && committed.bytes == queued.bytes
    }

    /// Progress the whole segment can count on: the fold of every replica's
    /// committed progress. Closed replicas count as epoch-current.
    pub(crate) fn get_committed(&self) -> Progress {
        let mut committed = self.queued;
        for replica in &self.replicas {
            let mut c = replica.committed;
            if c.close {
                c.epoch = c.epoch.max(self.queued.epoch);
            }
            committed.min_with(&c);
        }
        committed
    }

    /// True if no further actions are needed to durably replicate this
    /// segment; can flip back to false when backups fail.
    pub(crate) fn is_synced(&self) -> bool {
        let (appended, _) = self.segment.appended();
        if self.queued.bytes != appended {
            return false;
        }
        !self.recovering_from_lost_open_replicas
            && self.get_committed() == self.queued
    }

    /// Snapshots the appended length into `queued`, returning true if the
    /// segment gained bytes and needs scheduling.
    pub(crate) fn update_queued_bytes(&mut self) -> bool {
        let (appended, certificate) = self.segment.appended();
        if appended > self.queued.bytes {
            self.queued.bytes = appended;
            self.queued_certificate = certificate;
            true
        } else {
            false
        }
    }

    /// Requests the eventual close of the replicas. After close() the only
    /// legal further call is free(); the closed flag becomes durable
    /// asynchronously.
    pub(crate) fn close(&mut self) {
        assert!(!self.queued.close, "segment closed twice");
        self.queued.close = true;
        let (appended, certificate) = self.segment.appended();
        self.queued.bytes = appended;
        self.queued_certificate = certificate;
        pf_debug!(self.master_id;
            "segment {} closed (length {})", self.segment_id,
            self.queued.bytes);
    }

    /// Queues the freeing of all replicas. The caller must have driven
    /// sync() to completion first; outstanding writes are only canceled,
    /// and the metadata checksum guards against a concurrently transmitted
    /// write resurrecting as a valid replica.
    pub(crate) fn prepare_free(&mut self, write_rpcs_in_flight: &mut u32) {
        assert!(self.queued.close, "freeing a segment that was never closed");
        assert!(
            self.following_segment.is_none(),
            "freeing a segment still linked to a follower"
        );
        assert!(
            self.get_committed().close,
            "freeing a segment whose close has not committed"
        );
        for replica in &mut self.replicas {
            if replica.write_rpc.take().is_some() {
                *write_rpcs_in_flight -= 1;
            }
        }
        self.free_queued = true;
    }

    /// Reacts to a backup failure: resets replicas hosted on it, and if an
    /// open replica was lost, bumps the epoch and enters re-replication.
    /// Returns true if this segment now needs scheduling.
    pub(crate) fn handle_backup_failure(
        &mut self,
        failed_id: ServerId,
        write_rpcs_in_flight: &mut u32,
    ) -> bool {
        let mut any = false;
        let mut some_open_replica_lost = false;
        for replica in &mut self.replicas {
            if !replica.is_active || replica.backup_id != failed_id {
                continue;
            }
            pf_debug!(self.master_id;
                "segment {} recovering from lost replica which was on \
                 backup {}", self.segment_id, failed_id);
            if !replica.committed.close && !replica.replicate_atomically {
                some_open_replica_lost = true;
            }
            if replica.write_rpc.take().is_some() {
                *write_rpcs_in_flight -= 1;
            }
            replica.free_rpc = None;
            replica.failed();
            any = true;
        }
        if some_open_replica_lost {
            pf_debug!(self.master_id;
                "lost replica(s) for segment {} while open due to crash of \
                 backup {}", self.segment_id, failed_id);
            self.queued.epoch += 1;
            self.recovering_from_lost_open_replicas = true;
        }
        any
    }

    /// Checks replication state and makes progress restoring invariants.
    /// Issues at most one rpc per replica per invocation. Returns true when
    /// the segment has fully freed itself and should be destroyed.
    pub(crate) fn perform_task(&mut self, ctx: &mut SegmentCtx) -> bool {
        if self.free_queued && !self.recovering_from_lost_open_replicas {
            for idx in 0..self.replicas.len() {
                self.perform_free(idx, ctx);
            }
            if self.replicas.iter().all(|r| !r.is_active) {
                return true;
            }
        } else if !self.free_queued {
            for idx in 0..self.replicas.len() {
                self.perform_write(idx, ctx);
            }
        }

        // must run even with a free enqueued, otherwise lost open replicas
        // could still be detected as the head of the log during a recovery
        if self.recovering_from_lost_open_replicas {
            if self.get_committed() == self.queued {
                if ctx.epoch.is_at_least(self.segment_id, self.queued.epoch) {
                    pf_debug!(self.master_id;
                        "replication epoch ok, lost open replica recovery \
                         complete on segment {}", self.segment_id);
                    self.recovering_from_lost_open_replicas = false;
                } else {
                    // the re-replicated state is durable; now make sure
                    // replicas with old epochs can never reappear as an
                    // open segment in the log
                    pf_debug!(self.master_id;
                        "updating replication epoch to {},{} on coordinator \
                         to ensure lost replicas will not be reused",
                        self.segment_id, self.queued.epoch);
                    if ctx
                        .epoch
                        .update_to_at_least(self.segment_id, self.queued.epoch)
                    {
                        ctx.schedule_epoch = true;
                    }
                    ctx.schedule_self = true;
                }
            } else {
                ctx.schedule_self = true;
            }
        }
        false
    }

    /// Makes progress freeing one replica, regardless of its local and
    /// remote state. Reschedules the segment while work remains.
    fn perform_free(&mut self, idx: usize, ctx: &mut SegmentCtx) {
        if !self.replicas[idx].is_active {
            // no replica, nothing to free
            return;
        }

        if self.replicas[idx].free_rpc.is_some() {
            let ready = self.replicas[idx]
                .free_rpc
                .as_mut()
                .map(|rpc| rpc.is_ready())
                .unwrap_or(false);
            if !ready {
                ctx.schedule_self = true;
                return;
            }
            let result = match self.replicas[idx].free_rpc.as_mut() {
                Some(rpc) => rpc.take_result(),
                None => unreachable!("free rpc checked above"),
            };
            self.replicas[idx].free_rpc = None;
            match result {
                Ok(()) => {}
                Err(RpcFailure::ServerNotUp) => {
                    // the backup left the cluster; if the replica is found
                    // on storage after a restart its garbage collector
                    // frees it
                    pf_debug!(self.master_id;
                        "backup {} gone before freeing replica of segment \
                         {}", self.replicas[idx].backup_id, self.segment_id);
                }
                Err(e) => {
                    pf_warn!(self.master_id;
                        "freeing replica of segment {} on backup {} \
                         failed: {}",
                        self.segment_id, self.replicas[idx].backup_id, e);
                }
            }
            self.replicas[idx].reset();
            return;
        }

        assert!(
            self.replicas[idx].write_rpc.is_none(),
            "write rpc outstanding while freeing"
        );
        let backup_id = self.replicas[idx].backup_id;
        let master_id = self.master_id;
        let segment_id = self.segment_id;
        let client = ctx.client.clone();
        self.replicas[idx].free_rpc = Some(RpcHandle::spawn(
            async move {
                client.free_segment(backup_id, master_id, segment_id).await
            },
            ctx.wake.clone(),
        ));
        ctx.schedule_self = true;
    }

    /// Makes progress durably writing segment data to one replica.
    /// Reschedules the segment while work remains.
    fn perform_write(&mut self, idx: usize, ctx: &mut SegmentCtx) {
        assert!(self.replicas[idx].free_rpc.is_none());
        let queued = self.queued;

        if self.replicas[idx].is_active
            && Self::replica_synced(&self.replicas[idx].committed, &queued)
        {
            // replica is synced, no further work for now
            return;
        }

        if !self.replicas[idx].is_active {
            // choose a backup. Selection is separate from the open rpc
            // send: open failures retry on the same backup unless that
            // backup is discovered failed, else a lost open replica might
            // not be recovered from properly.
            let constraints: Vec<ServerId> = self
                .replicas
                .iter()
                .filter(|r| r.is_active)
                .map(|r| r.backup_id)
                .collect();
            let backup_id = if idx == 0 {
                ctx.selector.select_primary(&constraints)
            } else {
                ctx.selector.select_secondary(&constraints)
            };
            let backup_id = match backup_id {
                Some(backup_id) => backup_id,
                None => {
                    ctx.schedule_self = true;
                    return;
                }
            };
            pf_debug!(self.master_id;
                "starting replication of segment {} replica slot {} on \
                 backup {}", self.segment_id, idx, backup_id);
            self.replicas[idx].start(backup_id);
        }

        if self.replicas[idx].write_rpc.is_some() {
            let ready = self.replicas[idx]
                .write_rpc
                .as_mut()
                .map(|rpc| rpc.is_ready())
                .unwrap_or(false);
            if !ready {
                ctx.schedule_self = true;
                return;
            }
            let result = match self.replicas[idx].write_rpc.as_mut() {
                Some(rpc) => rpc.take_result(),
                None => unreachable!("write rpc checked above"),
            };
            self.replicas[idx].write_rpc = None;
            *ctx.write_rpcs_in_flight -= 1;

            match result {
                Ok(_response) => {
                    let open_len = self.open_len;
                    let replica = &mut self.replicas[idx];
                    replica.acked = replica.sent;
                    // committed advances in two cases: all queued data was
                    // acked, or the opening write was acked
                    if replica.acked == queued
                        || replica.acked.bytes == open_len
                    {
                        replica.committed = replica.acked;
                    }
                    let committed = self.get_committed();
                    if let Some(following) = self.following_segment {
                        if committed.open {
                            if let Some(follower) =
                                ctx.segments.get_mut(&following)
                            {
                                follower.preceding_segment_open_committed =
                                    true;
                            }
                        }
                        if committed.close {
                            if let Some(follower) =
                                ctx.segments.get_mut(&following)
                            {
                                follower.preceding_segment_close_committed =
                                    true;
                            }
                            // don't poke at the follower once it no longer
                            // needs this segment
                            self.following_segment = None;
                        }
                    }
                }
                Err(RpcFailure::ServerNotUp) => {
                    // retry; the failure monitor resets the replica once
                    // the cluster view reflects the crash
                    pf_warn!(self.master_id;
                        "couldn't write to backup {}; server is down",
                        self.replicas[idx].backup_id);
                    let replica = &mut self.replicas[idx];
                    replica.sent = replica.acked;
                }
                Err(RpcFailure::BackupOpenRejected)
                | Err(RpcFailure::OutOfStorage) => {
                    pf_info!(self.master_id;
                        "couldn't open replica on backup {}; server may be \
                         overloaded or may already have a replica for this \
                         segment which was found on disk after a crash; \
                         will choose another backup",
                        self.replicas[idx].backup_id);
                    self.replicas[idx].reset();
                }
                Err(e) => {
                    pf_warn!(self.master_id;
                        "write to backup {} for segment {} failed: {}; \
                         retrying", self.replicas[idx].backup_id,
                        self.segment_id, e);
                    let replica = &mut self.replicas[idx];
                    replica.sent = replica.acked;
                }
            }
            if !Self::replica_synced(&self.replicas[idx].committed, &queued)
                || self.recovering_from_lost_open_replicas
            {
                ctx.schedule_self = true;
            }
            return;
        }

        if !self.replicas[idx].committed.open {
            if !self.preceding_segment_open_committed {
                pf_trace!(self.master_id;
                    "cannot open segment {} until preceding segment is \
                     durably open", self.segment_id);
                ctx.schedule_self = true;
                return;
            }
            if *ctx.write_rpcs_in_flight == ctx.max_write_rpcs_in_flight {
                ctx.schedule_self = true;
                return;
            }

            // a replica being re-replicated gets no certificate with its
            // opening write; the backup exposes it only once caught up
            let certificate = if self.replicas[idx].replicate_atomically {
                None
            } else {
                Some(self.opening_write_certificate)
            };
            let request = WriteSegmentRequest {
                master_id: self.master_id,
                segment_id: self.segment_id,
                epoch: queued.epoch,
                offset: 0,
                data: self.segment.read(0, self.open_len),
                certificate,
                open: true,
                close: false,
                primary: idx == 0,
            };
            self.issue_write(idx, request, ctx);
            let open_len = self.open_len;
            let replica = &mut self.replicas[idx];
            replica.sent.open = true;
            replica.sent.bytes = open_len;
            replica.sent.epoch = queued.epoch;
            ctx.schedule_self = true;
            return;
        }

        if self.replicas[idx].sent < queued {
            if !self.preceding_segment_close_committed {
                // data in this segment must not be acknowledged durable
                // while an earlier segment could still be dropped from the
                // log's head-finding phase
                pf_trace!(self.master_id;
                    "cannot write segment {} until preceding segment is \
                     durably closed", self.segment_id);
                ctx.schedule_self = true;
                return;
            }

            let offset = self.replicas[idx].sent.bytes;
            let mut length = queued.bytes - offset;
            let mut certificate = Some(self.queued_certificate);
            // breaks atomicity of log entries, but that can happen anyway
            // when a segment is partially written to storage
            if length > ctx.max_bytes_per_write_rpc {
                length = ctx.max_bytes_per_write_rpc;
                certificate = None;
            }

            let send_close =
                queued.close && offset + length == queued.bytes;
            if send_close {
                if let Some(following) = self.following_segment {
                    let follower_open = ctx
                        .segments
                        .get(&following)
                        .map(|f| f.get_committed().open)
                        .unwrap_or(true);
                    if !follower_open {
                        // recovery must always find an open segment, or the
                        // coordinator cannot know it has the whole log
                        pf_trace!(self.master_id;
                            "cannot close segment {} until following \
                             segment is durably open", self.segment_id);
                        ctx.schedule_self = true;
                        return;
                    }
                }
            }

            if *ctx.write_rpcs_in_flight == ctx.max_write_rpcs_in_flight {
                pf_trace!(self.master_id;
                    "cannot write segment {}, too many writes in flight",
                    self.segment_id);
                ctx.schedule_self = true;
                return;
            }

            let request = WriteSegmentRequest {
                master_id: self.master_id,
                segment_id: self.segment_id,
                epoch: queued.epoch,
                offset,
                data: self.segment.read(offset, length),
                certificate,
                open: false,
                close: send_close,
                primary: idx == 0,
            };
            self.issue_write(idx, request, ctx);
            let replica = &mut self.replicas[idx];
            replica.sent.bytes += length;
            replica.sent.epoch = queued.epoch;
            replica.sent.close = send_close;
            ctx.schedule_self = true;
            return;
        }

        unreachable!(
            "replica not synced, no rpc outstanding, but all data sent"
        );
    }

    fn issue_write(
        &mut self,
        idx: usize,
        request: WriteSegmentRequest,
        ctx: &mut SegmentCtx,
    ) {
        let backup_id = self.replicas[idx].backup_id;
        pf_trace!(self.master_id;
            "sending write to backup {} for segment {} [{}..+{}] \
             (open: {}, close: {})",
            backup_id, self.segment_id, request.offset, request.data.len(),
            request.open, request.close);
        let client = ctx.client.clone();
        self.replicas[idx].write_rpc = Some(RpcHandle::spawn(
            async move { client.write_segment(backup_id, request).await },
            ctx.wake.clone(),
        ));
        *ctx.write_rpcs_in_flight += 1;
    }

    /// Logs queued/committed progress plus every replica's state. Used when
    /// a sync() has been stuck for a while.
    pub(crate) fn dump_progress(&self) {
        let committed = self.get_committed();
        pf_warn!(self.master_id;
            "segment {}: queued (open {}, bytes {}, epoch {}, close {}), \
             committed (open {}, bytes {}, epoch {}, close {})",
            self.segment_id,
            self.queued.open, self.queued.bytes, self.queued.epoch,
            self.queued.close,
            committed.open, committed.bytes, committed.epoch,
            committed.close);
        for (idx, replica) in self.replicas.iter().enumerate() {
            pf_warn!(self.master_id;
                "  replica {} on backup {}: sent {:?}, acked {:?}, \
                 committed {:?}, write rpc outstanding: {}",
                idx, replica.backup_id, replica.sent, replica.acked,
                replica.committed, replica.write_rpc.is_some());
        }
    }
}

#[cfg(test)]
mod progress_tests {
    use super::*;

    fn progress(
        open: bool,
        bytes: u32,
        epoch: u64,
        close: bool,
    ) -> Progress {
        Progress {
            open,
            bytes,
            epoch,
            close,
        }
    }

    #[test]
    fn ordering() {
        assert!(progress(false, 0, 0, false) < progress(true, 0, 0, false));
        assert!(progress(true, 10, 0, false) < progress(true, 20, 0, false));
        assert!(progress(true, 20, 0, false) < progress(true, 20, 1, false));
        assert!(progress(true, 20, 1, false) < progress(true, 20, 1, true));
        // a stale epoch makes an otherwise caught-up replica lag
        let sent = progress(true, 20, 0, false);
        let queued = progress(true, 20, 1, false);
        assert!(sent < queued);
    }

    #[test]
    fn min_fold() {
        let mut committed = progress(true, 30, 1, true);
        committed.min_with(&progress(true, 20, 1, false));
        assert_eq!(committed, progress(true, 20, 1, false));
        committed.min_with(&Progress::default());
        assert_eq!(committed, Progress::default());
    }
}
