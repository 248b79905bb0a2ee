//! Index of live replicas on one backup, keyed by `(masterId, segmentId)`.

use std::collections::HashMap;

use crate::backup::storage::FrameRef;
use crate::common::{ReplicaKey, SegmentEpoch, SegmentId, ServerId};

/// In-memory state of one live replica, owning its frame handle.
#[derive(Clone)]
pub struct ReplicaEntry {
    pub frame: FrameRef,

    /// No further writes are legal once set.
    pub closed: bool,

    pub primary: bool,

    /// Replication epoch carried by the most recent write.
    pub last_write_epoch: SegmentEpoch,

    /// Replica was adopted from storage at restart rather than opened by a
    /// live master; it is subject to the restart garbage collector.
    pub found_on_storage: bool,
}

/// Bijective map from live replica keys to their owning frames. Uniqueness
/// violations are programming errors and panic the process.
#[derive(Default)]
pub struct ReplicaIndex {
    map: HashMap<ReplicaKey, ReplicaEntry>,
}

impl ReplicaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a replica under `key`. Panics if the key is already live.
    pub fn insert(&mut self, key: ReplicaKey, entry: ReplicaEntry) {
        if self.map.insert(key, entry).is_some() {
            panic!("duplicate replica installed for {}", key);
        }
    }

    pub fn lookup(&self, key: ReplicaKey) -> Option<&ReplicaEntry> {
        self.map.get(&key)
    }

    pub fn lookup_mut(&mut self, key: ReplicaKey) -> Option<&mut ReplicaEntry> {
        self.map.get_mut(&key)
    }

    /// Removes and returns the replica under `key`, if live.
    pub fn remove(&mut self, key: ReplicaKey) -> Option<ReplicaEntry> {
        self.map.remove(&key)
    }

    pub fn contains(&self, key: ReplicaKey) -> bool {
        self.map.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Segment ids of all live replicas belonging to `master`, ascending.
    pub fn segments_of_master(&self, master: ServerId) -> Vec<SegmentId> {
        let mut ids: Vec<SegmentId> = self
            .map
            .keys()
            .filter(|key| key.master_id == master)
            .map(|key| key.segment_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Distinct master ids with at least one live replica, ascending.
    pub fn masters(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> =
            self.map.keys().map(|key| key.master_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
