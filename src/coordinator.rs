//! Coordinator-side recovery: fan-out of replica inventory requests across
//! all backups, assembly and digest-verification of the crashed master's
//! segment set, and dispatch of recovery partitions to substitute masters.
//! Also hosts the replication-epoch registry that invalidates stale open
//! replicas.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::{
    Partition, PartitionId, RecoveryId, SegmentEpoch, SegmentId, ServerId,
};
use crate::rpc::{DigestInfo, ReplicaSource, StartReadingDataResponse};
use crate::tracker::ServerTracker;
use crate::transport::{BackupClient, MasterClient};
use crate::utils::MirrorlogError;

use tokio::sync::mpsc;

/// Log prefix for coordinator-side messages.
const ME: &str = "coord";

/// Registry of `(masterId, segmentId) -> replication epoch` minimums.
/// Open replicas whose recorded epoch is below the registered value are
/// stale and must not be used during recovery.
#[derive(Default)]
pub struct EpochRegistry {
    epochs: Mutex<HashMap<(ServerId, SegmentId), SegmentEpoch>>,
}

impl EpochRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(EpochRegistry::default())
    }

    /// Raises the recorded epoch for `(master, segment_id)` to at least
    /// `epoch`; never lowers it.
    pub fn update_to_at_least(
        &self,
        master: ServerId,
        segment_id: SegmentId,
        epoch: SegmentEpoch,
    ) {
        let mut epochs = self.epochs.lock().unwrap();
        let current = epochs.entry((master, segment_id)).or_insert(epoch);
        if *current < epoch {
            *current = epoch;
        }
    }

    /// Currently recorded minimum epoch; zero when never raised.
    pub fn get(&self, master: ServerId, segment_id: SegmentId) -> SegmentEpoch {
        self.epochs
            .lock()
            .unwrap()
            .get(&(master, segment_id))
            .copied()
            .unwrap_or(0)
    }
}

/// Fatal failure of one recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    /// No replica of the crashed master carried a log digest; the head of
    /// the log cannot be identified.
    NoLogDigest,

    /// The digest names segments no backup produced; replaying would
    /// silently lose data.
    LogIncomplete { missing: Vec<SegmentId> },

    /// Fewer substitute masters available than recovery partitions.
    InsufficientMasters { masters: usize, partitions: usize },

    /// A substitute master refused (or could not receive) its partition.
    DispatchFailed { master: ServerId },
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecoveryError::NoLogDigest => {
                write!(f, "no log digest found on any backup")
            }
            RecoveryError::LogIncomplete { missing } => {
                write!(f, "log incomplete; missing segments {:?}", missing)
            }
            RecoveryError::InsufficientMasters {
                masters,
                partitions,
            } => write!(
                f,
                "only {} masters available for {} partitions",
                masters, partitions
            ),
            RecoveryError::DispatchFailed { master } => {
                write!(f, "dispatch to substitute master {} failed", master)
            }
        }
    }
}

impl From<RecoveryError> for MirrorlogError {
    fn from(e: RecoveryError) -> Self {
        MirrorlogError(e.to_string())
    }
}

/// The best replica found for one segment.
#[derive(Debug, Clone, Copy)]
struct BestReplica {
    backup_id: ServerId,
    length: u32,
    primary: bool,
}

/// Outcome of a successfully started recovery.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub recovery_id: RecoveryId,

    /// For each recovered segment, the backup substitutes fetch it from.
    pub sources: Vec<ReplicaSource>,

    /// Which substitute master serves each partition.
    pub assignments: Vec<(PartitionId, ServerId)>,
}

/// Drives the recovery of crashed masters.
pub struct RecoveryCoordinator {
    tracker: ServerTracker,
    backup_client: Arc<dyn BackupClient>,
    master_client: Arc<dyn MasterClient>,
    epochs: Arc<EpochRegistry>,
    next_recovery_id: AtomicU64,
}

impl RecoveryCoordinator {
    pub fn new(
        tracker: ServerTracker,
        backup_client: Arc<dyn BackupClient>,
        master_client: Arc<dyn MasterClient>,
        epochs: Arc<EpochRegistry>,
    ) -> Self {
        RecoveryCoordinator {
            tracker,
            backup_client,
            master_client,
            epochs,
            next_recovery_id: AtomicU64::new(1),
        }
    }

    /// The epoch registry backing `updateReplicationEpoch` requests.
    pub fn epochs(&self) -> Arc<EpochRegistry> {
        self.epochs.clone()
    }

    /// Recovers one crashed master: inventories replicas on every backup,
    /// verifies the log is complete against the newest digest, and hands
    /// each tablet partition to a substitute master.
    pub async fn start_recovery(
        &self,
        crashed_master: ServerId,
        partitions: Vec<Partition>,
    ) -> Result<RecoveryPlan, RecoveryError> {
        let recovery_id =
            self.next_recovery_id.fetch_add(1, Ordering::Relaxed);
        let backups = self.tracker.backups_up();
        pf_info!(ME;
            "starting recovery {} of crashed master {} across {} backups \
             and {} partitions",
            recovery_id, crashed_master, backups.len(), partitions.len());

        // inventory all backups in parallel
        let (tx, mut rx) = mpsc::unbounded_channel();
        for backup in &backups {
            let backup_id = backup.id;
            let client = self.backup_client.clone();
            let partitions = partitions.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = client
                    .start_reading_data(
                        backup_id,
                        recovery_id,
                        crashed_master,
                        partitions,
                    )
                    .await;
                let _ = tx.send((backup_id, result));
            });
        }
        drop(tx);

        let mut responses: Vec<(ServerId, StartReadingDataResponse)> =
            vec![];
        while let Some((backup_id, result)) = rx.recv().await {
            match result {
                Ok(response) => responses.push((backup_id, response)),
                Err(e) => {
                    // a missing inventory is only fatal if the digest
                    // check finds a segment nobody else has
                    pf_warn!(ME;
                        "startReadingData on backup {} failed: {}",
                        backup_id, e);
                }
            }
        }

        let segment_map = self.build_segment_map(crashed_master, &responses);
        let digest = Self::pick_digest(&responses)
            .ok_or(RecoveryError::NoLogDigest)?;
        Self::verify_complete_log(&segment_map, &digest)?;

        // one substitute master per partition
        let substitutes: Vec<ServerId> = self
            .tracker
            .masters_up()
            .into_iter()
            .filter(|&id| id != crashed_master)
            .collect();
        if substitutes.len() < partitions.len() {
            pf_error!(ME;
                "recovery {} needs {} masters but only {} are up",
                recovery_id, partitions.len(), substitutes.len());
            return Err(RecoveryError::InsufficientMasters {
                masters: substitutes.len(),
                partitions: partitions.len(),
            });
        }

        let sources: Vec<ReplicaSource> = segment_map
            .iter()
            .map(|(&segment_id, best)| ReplicaSource {
                segment_id,
                backup_id: best.backup_id,
            })
            .collect();

        let mut assignments = vec![];
        for (partition, &master) in partitions.iter().zip(&substitutes) {
            pf_info!(ME;
                "dispatching partition {} of recovery {} to master {}",
                partition.id, recovery_id, master);
            self.master_client
                .recover(
                    master,
                    recovery_id,
                    crashed_master,
                    partition.id,
                    sources.clone(),
                )
                .await
                .map_err(|e| {
                    pf_error!(ME;
                        "recover() on substitute master {} failed: {}",
                        master, e);
                    RecoveryError::DispatchFailed { master }
                })?;
            assignments.push((partition.id, master));
        }

        Ok(RecoveryPlan {
            recovery_id,
            sources,
            assignments,
        })
    }

    /// Chooses the best replica per segment: greatest certified length,
    /// ties broken primary-before-secondary, then arbitrary. Open replicas
    /// whose epoch is below the registered minimum are stale and skipped.
    fn build_segment_map(
        &self,
        crashed_master: ServerId,
        responses: &[(ServerId, StartReadingDataResponse)],
    ) -> HashMap<SegmentId, BestReplica> {
        let mut segment_map: HashMap<SegmentId, BestReplica> = HashMap::new();
        for (backup_id, response) in responses {
            for info in &response.replicas {
                if !info.closed
                    && info.epoch
                        < self.epochs.get(crashed_master, info.segment_id)
                {
                    pf_warn!(ME;
                        "ignoring stale open replica of segment {} on \
                         backup {} (epoch {} below registered {})",
                        info.segment_id, backup_id, info.epoch,
                        self.epochs.get(crashed_master, info.segment_id));
                    continue;
                }
                let candidate = BestReplica {
                    backup_id: *backup_id,
                    length: info.length,
                    primary: info.primary,
                };
                segment_map
                    .entry(info.segment_id)
                    .and_modify(|best| {
                        if (candidate.length, candidate.primary)
                            > (best.length, best.primary)
                        {
                            *best = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
        }
        segment_map
    }

    /// Picks the digest from the newest segment, breaking ties by greatest
    /// certified length.
    fn pick_digest(
        responses: &[(ServerId, StartReadingDataResponse)],
    ) -> Option<DigestInfo> {
        responses
            .iter()
            .filter_map(|(_, response)| response.digest.clone())
            .max_by_key(|digest| (digest.segment_id, digest.length))
    }

    /// Verifies that every segment the digest names was obtained from some
    /// backup. A missing segment means replay would silently lose data.
    fn verify_complete_log(
        segment_map: &HashMap<SegmentId, BestReplica>,
        digest: &DigestInfo,
    ) -> Result<(), RecoveryError> {
        pf_info!(ME;
            "segment {} of length {} bytes is the head of the log",
            digest.segment_id, digest.length);

        let mut missing: Vec<SegmentId> = digest
            .digest
            .segment_ids
            .iter()
            .copied()
            .filter(|segment_id| !segment_map.contains_key(segment_id))
            .collect();
        missing.sort_unstable();
        if missing.is_empty() {
            return Ok(());
        }
        for segment_id in &missing {
            pf_error!(ME; "segment {} is missing!", segment_id);
        }
        pf_error!(ME;
            "{} segments in the digest, but not obtained from backups!",
            missing.len());
        Err(RecoveryError::LogIncomplete { missing })
    }
}

#[cfg(test)]
mod coordinator_tests {
    use super::*;

    use crate::common::LogDigest;
    use crate::rpc::ReplicaInfo;

    fn info(
        segment_id: SegmentId,
        length: u32,
        primary: bool,
        closed: bool,
        epoch: u64,
    ) -> ReplicaInfo {
        ReplicaInfo {
            segment_id,
            length,
            primary,
            closed,
            epoch,
        }
    }

    fn coordinator_over(tracker: ServerTracker) -> RecoveryCoordinator {
        // clients are unused by the helpers under test
        let epochs = EpochRegistry::new();
        let net = Arc::new(crate::transport::LoopbackNet::new(
            tracker.clone(),
            epochs.clone(),
        ));
        RecoveryCoordinator::new(tracker, net.clone(), net, epochs)
    }

    #[tokio::test]
    async fn best_replica_prefers_length_then_primary() {
        let coordinator = coordinator_over(ServerTracker::new());
        let responses = vec![
            (
                ServerId(1),
                StartReadingDataResponse {
                    replicas: vec![
                        info(88, 10, false, true, 0),
                        info(89, 30, false, true, 0),
                    ],
                    digest: None,
                },
            ),
            (
                ServerId(2),
                StartReadingDataResponse {
                    replicas: vec![
                        info(88, 20, false, true, 0),
                        info(89, 30, true, true, 0),
                    ],
                    digest: None,
                },
            ),
        ];
        let map =
            coordinator.build_segment_map(ServerId(99), &responses);
        // 88: longer replica wins
        assert_eq!(map[&88].backup_id, ServerId(2));
        // 89: equal length, primary wins
        assert_eq!(map[&89].backup_id, ServerId(2));
    }

    #[tokio::test]
    async fn stale_open_replicas_skipped() {
        let coordinator = coordinator_over(ServerTracker::new());
        coordinator.epochs.update_to_at_least(ServerId(99), 89, 2);
        let responses = vec![(
            ServerId(1),
            StartReadingDataResponse {
                replicas: vec![
                    info(89, 50, true, false, 1), // stale open
                    info(88, 50, true, true, 0),  // closed: epoch exempt
                ],
                digest: None,
            },
        )];
        let map =
            coordinator.build_segment_map(ServerId(99), &responses);
        assert!(!map.contains_key(&89));
        assert!(map.contains_key(&88));
    }

    #[test]
    fn digest_from_newest_longest_head() {
        let digest = |segment_id, length| DigestInfo {
            segment_id,
            length,
            digest: LogDigest {
                segment_ids: vec![88],
            },
        };
        let responses = vec![
            (
                ServerId(1),
                StartReadingDataResponse {
                    replicas: vec![],
                    digest: Some(digest(90, 64)),
                },
            ),
            (
                ServerId(2),
                StartReadingDataResponse {
                    replicas: vec![],
                    digest: Some(digest(90, 65)),
                },
            ),
            (
                ServerId(3),
                StartReadingDataResponse {
                    replicas: vec![],
                    digest: Some(digest(89, 99)),
                },
            ),
        ];
        let picked = RecoveryCoordinator::pick_digest(&responses).unwrap();
        assert_eq!((picked.segment_id, picked.length), (90, 65));
    }

    #[test]
    fn verify_complete_log_reports_missing() {
        let mut map = HashMap::new();
        map.insert(
            90,
            BestReplica {
                backup_id: ServerId(1),
                length: 65,
                primary: true,
            },
        );
        let digest = DigestInfo {
            segment_id: 90,
            length: 65,
            digest: LogDigest {
                segment_ids: vec![88, 90],
            },
        };
        assert_eq!(
            RecoveryCoordinator::verify_complete_log(&map, &digest),
            Err(RecoveryError::LogIncomplete { missing: vec![88] })
        );

        map.insert(
            88,
            BestReplica {
                backup_id: ServerId(2),
                length: 10,
                primary: false,
            },
        );
        assert!(
            RecoveryCoordinator::verify_complete_log(&map, &digest).is_ok()
        );
    }
}
