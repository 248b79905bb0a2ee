//! Per-crashed-master recovery state on a backup: pinned replica data,
//! cooperative filtering of log entries into per-partition recovery
//! segments, and the blocking serve path of `getRecoveryData`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::common::{
    read_entries, Certificate, LogEntry, Partition, PartitionId, RecoveryId,
    SegmentId, ServerId,
};
use crate::rpc::{
    DigestInfo, GetRecoveryDataResponse, ReplicaInfo, RpcFailure,
    StartReadingDataResponse,
};
use crate::tasks::{Task, TaskOutcome};
use crate::utils::MirrorlogError;

use bytes::Bytes;

use tokio::sync::watch;

/// Snapshot of one replica participating in a recovery. The `data` view is
/// taken when the recovery starts, so a concurrent `freeSegment` cannot pull
/// the bytes out from under the filter.
pub struct RecoveryReplica {
    pub segment_id: SegmentId,
    pub primary: bool,
    pub closed: bool,
    pub epoch: u64,
    pub data: Bytes,

    /// Bytes covered by the latest durable certificate; zero when the
    /// replica never received one.
    pub certified_len: u32,

    /// Filter output: per-partition recovery segment, once built.
    pub(crate) built: Option<HashMap<PartitionId, (Vec<u8>, Certificate)>>,
}

struct RecoveryState {
    replicas: Vec<RecoveryReplica>,

    /// Index of the next replica the filter task will process.
    next_to_filter: usize,

    /// Recovery was abandoned; the filter task retires at its next chance.
    freed: bool,
}

/// All state a backup holds for the recovery of one crashed master.
pub struct MasterRecovery {
    me: ServerId,
    recovery_id: RecoveryId,
    crashed_master: ServerId,
    partitions: Vec<Partition>,

    /// Cached response returned for repeated startReadingData calls with
    /// the same recovery id.
    response: StartReadingDataResponse,

    state: Mutex<RecoveryState>,

    /// Bumped whenever one more replica finishes filtering.
    built_tx: watch::Sender<u64>,
    built_rx: watch::Receiver<u64>,
}

impl MasterRecovery {
    /// Builds the recovery over snapshots of the crashed master's replicas.
    /// Primaries sort (and therefore filter and report) before secondaries:
    /// they are the common case and the recovery master needs them fastest.
    pub fn new(
        me: ServerId,
        recovery_id: RecoveryId,
        crashed_master: ServerId,
        partitions: Vec<Partition>,
        mut replicas: Vec<RecoveryReplica>,
    ) -> Arc<Self> {
        replicas.sort_by_key(|r| (!r.primary, r.segment_id));

        let response = StartReadingDataResponse {
            replicas: replicas
                .iter()
                .map(|r| ReplicaInfo {
                    segment_id: r.segment_id,
                    length: r.certified_len,
                    primary: r.primary,
                    closed: r.closed,
                    epoch: r.epoch,
                })
                .collect(),
            digest: Self::find_newest_digest(me, &replicas),
        };

        let num_primaries =
            replicas.iter().filter(|r| r.primary).count();
        pf_info!(me;
            "recovery {} for crashed master {}: {} replicas ({} primary), \
             {} partitions",
            recovery_id, crashed_master, replicas.len(), num_primaries,
            partitions.len());

        let (built_tx, built_rx) = watch::channel(0);
        Arc::new(MasterRecovery {
            me,
            recovery_id,
            crashed_master,
            partitions,
            response,
            state: Mutex::new(RecoveryState {
                replicas,
                next_to_filter: 0,
                freed: false,
            }),
            built_tx,
            built_rx,
        })
    }

    /// Scans all certified replica bytes for log digests and picks the one
    /// from the newest segment, breaking ties by greatest certified length.
    fn find_newest_digest(
        me: ServerId,
        replicas: &[RecoveryReplica],
    ) -> Option<DigestInfo> {
        let mut best: Option<DigestInfo> = None;
        for replica in replicas {
            if replica.certified_len == 0 {
                continue;
            }
            let entries =
                match read_entries(&replica.data, replica.certified_len) {
                    Ok(entries) => entries,
                    Err(e) => {
                        pf_warn!(me;
                            "skipping digest scan of segment {}: {}",
                            replica.segment_id, e);
                        continue;
                    }
                };
            for entry in entries {
                if let LogEntry::Digest(digest) = entry {
                    let better = match &best {
                        None => true,
                        Some(b) => {
                            (replica.segment_id, replica.certified_len)
                                > (b.segment_id, b.length)
                        }
                    };
                    if better {
                        best = Some(DigestInfo {
                            segment_id: replica.segment_id,
                            length: replica.certified_len,
                            digest,
                        });
                    }
                }
            }
        }
        best
    }

    pub fn recovery_id(&self) -> RecoveryId {
        self.recovery_id
    }

    pub fn crashed_master(&self) -> ServerId {
        self.crashed_master
    }

    /// The response served for this recovery's startReadingData calls.
    pub fn cached_response(&self) -> StartReadingDataResponse {
        self.response.clone()
    }

    /// Abandons this recovery: the filter task retires and waiters see
    /// `BadSegmentId`. Pinned replica data is released when the task drops.
    pub fn mark_freed(&self) {
        pf_info!(self.me;
            "recovery {} for crashed master {} is no longer needed; \
             will clean up at next chance",
            self.recovery_id, self.crashed_master);
        self.state.lock().unwrap().freed = true;
        // wake any getRecoveryData waiters so they observe the abandonment
        self.built_tx.send_modify(|v| *v += 1);
    }

    pub fn is_freed(&self) -> bool {
        self.state.lock().unwrap().freed
    }

    /// Filters the next unprocessed replica into its per-partition recovery
    /// segments. Returns false once no replicas remain (or the recovery was
    /// abandoned).
    fn filter_one(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.freed {
            pf_info!(self.me;
                "state for recovery {} for crashed master {} freed on backup",
                self.recovery_id, self.crashed_master);
            return false;
        }
        let idx = state.next_to_filter;
        if idx >= state.replicas.len() {
            return false;
        }
        state.next_to_filter += 1;

        let built = match Self::filter_replica(
            self.me,
            &state.replicas[idx],
            &self.partitions,
        ) {
            Ok(built) => built,
            Err(e) => {
                pf_warn!(self.me;
                    "filtering segment {} of master {} failed: {}; \
                     serving empty recovery segments for it",
                    state.replicas[idx].segment_id, self.crashed_master, e);
                HashMap::new()
            }
        };
        state.replicas[idx].built = Some(built);
        let more = state.next_to_filter < state.replicas.len();
        drop(state);

        self.built_tx.send_modify(|v| *v += 1);
        more
    }

    /// Walks one replica's certified entries, appending each object entry to
    /// every partition whose tablets cover it. Digest entries carry no
    /// tablet data and are skipped.
    fn filter_replica(
        me: ServerId,
        replica: &RecoveryReplica,
        partitions: &[Partition],
    ) -> Result<HashMap<PartitionId, (Vec<u8>, Certificate)>, MirrorlogError>
    {
        let entries = read_entries(&replica.data, replica.certified_len)?;
        let mut buffers: HashMap<PartitionId, Vec<u8>> = HashMap::new();

        for entry in &entries {
            let (table_id, key_hash) = match entry {
                LogEntry::Object {
                    table_id, key_hash, ..
                } => (*table_id, *key_hash),
                LogEntry::Digest(_) => continue,
            };
            for partition in partitions {
                if partition.covers(table_id, key_hash) {
                    let buf = buffers.entry(partition.id).or_default();
                    crate::common::append_entry(buf, entry)?;
                }
            }
        }

        pf_debug!(me;
            "filtered segment {}: {} entries into {} partitions",
            replica.segment_id, entries.len(), buffers.len());
        Ok(buffers
            .into_iter()
            .map(|(id, buf)| {
                let certificate = Certificate::of(&buf);
                (id, (buf, certificate))
            })
            .collect())
    }

    /// Serves one partition of one recovered segment, waiting until the
    /// filter task has produced it. Idempotent; may be retried.
    pub async fn get_recovery_data(
        &self,
        segment_id: SegmentId,
        partition_id: PartitionId,
    ) -> Result<GetRecoveryDataResponse, RpcFailure> {
        let mut built = self.built_rx.clone();
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.freed {
                    return Err(RpcFailure::BadSegmentId);
                }
                let replica = state
                    .replicas
                    .iter()
                    .find(|r| r.segment_id == segment_id)
                    .ok_or(RpcFailure::BadSegmentId)?;
                if let Some(segments) = &replica.built {
                    return Ok(match segments.get(&partition_id) {
                        Some((data, certificate)) => {
                            GetRecoveryDataResponse {
                                data: data.clone(),
                                certificate: *certificate,
                            }
                        }
                        // no entry of this segment fell in the partition
                        None => GetRecoveryDataResponse {
                            data: vec![],
                            certificate: Certificate::default(),
                        },
                    });
                }
            }
            if built.changed().await.is_err() {
                return Err(RpcFailure::BadSegmentId);
            }
        }
    }
}

/// Cooperative task that filters one replica per invocation until the
/// recovery is fully built or abandoned.
pub struct FilterTask {
    recovery: Arc<MasterRecovery>,
}

impl FilterTask {
    pub fn new(recovery: Arc<MasterRecovery>) -> Self {
        FilterTask { recovery }
    }
}

impl Task for FilterTask {
    fn name(&self) -> &'static str {
        "recovery-filter"
    }

    fn perform_task(&mut self) -> TaskOutcome {
        if self.recovery.filter_one() {
            TaskOutcome::Reschedule
        } else {
            TaskOutcome::Done
        }
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;

    use crate::common::{append_entry, LogDigest};

    fn partition(id: PartitionId, table_id: u64) -> Partition {
        Partition {
            id,
            tablets: vec![crate::common::Tablet {
                table_id,
                start_key_hash: 0,
                end_key_hash: u64::MAX,
            }],
        }
    }

    fn replica_with_entries(
        segment_id: SegmentId,
        primary: bool,
        entries: &[LogEntry],
    ) -> RecoveryReplica {
        let mut buf = vec![];
        for entry in entries {
            append_entry(&mut buf, entry).unwrap();
        }
        let certified_len = buf.len() as u32;
        RecoveryReplica {
            segment_id,
            primary,
            closed: true,
            epoch: 0,
            data: Bytes::from(buf),
            certified_len,
            built: None,
        }
    }

    fn object(table_id: u64, key_hash: u64, value: &[u8]) -> LogEntry {
        LogEntry::Object {
            table_id,
            key_hash,
            value: value.to_vec(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn filter_and_serve() {
        let recovery = MasterRecovery::new(
            ServerId(3),
            456,
            ServerId(99),
            vec![partition(0, 1), partition(1, 2)],
            vec![replica_with_entries(
                88,
                true,
                &[
                    object(1, 10, b"a"),
                    object(2, 11, b"b"),
                    object(1, 12, b"c"),
                ],
            )],
        );
        let mut task = FilterTask::new(recovery.clone());
        assert_eq!(task.perform_task(), TaskOutcome::Done);

        let part0 = recovery.get_recovery_data(88, 0).await.unwrap();
        let entries =
            read_entries(&part0.data, part0.certificate.segment_length)
                .unwrap();
        assert_eq!(
            entries,
            vec![object(1, 10, b"a"), object(1, 12, b"c")]
        );
        assert!(part0.certificate.validates(&part0.data));

        let part1 = recovery.get_recovery_data(88, 1).await.unwrap();
        let entries =
            read_entries(&part1.data, part1.certificate.segment_length)
                .unwrap();
        assert_eq!(entries, vec![object(2, 11, b"b")]);

        // unknown segment
        assert_eq!(
            recovery.get_recovery_data(77, 0).await,
            Err(RpcFailure::BadSegmentId)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocks_until_built() {
        let recovery = MasterRecovery::new(
            ServerId(3),
            456,
            ServerId(99),
            vec![partition(0, 1)],
            vec![replica_with_entries(88, true, &[object(1, 5, b"x")])],
        );

        let waiter = {
            let recovery = recovery.clone();
            tokio::spawn(
                async move { recovery.get_recovery_data(88, 0).await },
            )
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let mut task = FilterTask::new(recovery.clone());
        task.perform_task();
        let response = waiter.await.unwrap().unwrap();
        assert!(!response.data.is_empty());
    }

    #[test]
    fn primaries_filter_first() {
        let recovery = MasterRecovery::new(
            ServerId(3),
            1,
            ServerId(99),
            vec![partition(0, 1)],
            vec![
                replica_with_entries(88, false, &[object(1, 5, b"x")]),
                replica_with_entries(89, true, &[object(1, 6, b"y")]),
            ],
        );
        // inventory reports the primary first
        let response = recovery.cached_response();
        assert_eq!(response.replicas[0].segment_id, 89);
        assert!(response.replicas[0].primary);
        assert_eq!(response.replicas[1].segment_id, 88);

        // and the primary is built by the first filter step
        let mut task = FilterTask::new(recovery.clone());
        assert_eq!(task.perform_task(), TaskOutcome::Reschedule);
        let state = recovery.state.lock().unwrap();
        assert!(state.replicas[0].built.is_some());
        assert!(state.replicas[1].built.is_none());
    }

    #[test]
    fn digest_from_newest_segment() {
        let digest_old = LogEntry::Digest(LogDigest {
            segment_ids: vec![88],
        });
        let digest_new = LogEntry::Digest(LogDigest {
            segment_ids: vec![88, 89],
        });
        let recovery = MasterRecovery::new(
            ServerId(3),
            1,
            ServerId(99),
            vec![],
            vec![
                replica_with_entries(88, true, &[digest_old]),
                replica_with_entries(89, false, &[digest_new.clone()]),
            ],
        );
        let digest = recovery.cached_response().digest.unwrap();
        assert_eq!(digest.segment_id, 89);
        assert_eq!(
            LogEntry::Digest(digest.digest),
            digest_new
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_recovery_rejects_waiters() {
        let recovery = MasterRecovery::new(
            ServerId(3),
            456,
            ServerId(99),
            vec![partition(0, 1)],
            vec![replica_with_entries(88, true, &[object(1, 5, b"x")])],
        );
        let waiter = {
            let recovery = recovery.clone();
            tokio::spawn(
                async move { recovery.get_recovery_data(88, 0).await },
            )
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        recovery.mark_freed();
        assert_eq!(waiter.await.unwrap(), Err(RpcFailure::BadSegmentId));

        // the filter task retires immediately
        let mut task = FilterTask::new(recovery);
        assert_eq!(task.perform_task(), TaskOutcome::Done);
    }
}
