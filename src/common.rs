//! Identifier types and log-structured data model pieces shared between the
//! master, backup, and coordinator sides.

use std::fmt;

use crate::utils::MirrorlogError;

use get_size::GetSize;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

/// Log-unique segment identifier type.
pub type SegmentId = u64;

/// Per-segment replication epoch number type. Bumped each time an open
/// replica is lost so that stale replicas can be told apart at recovery.
pub type SegmentEpoch = u64;

/// Recovery instance identifier type, chosen by the coordinator.
pub type RecoveryId = u64;

/// Recovery partition identifier type.
pub type PartitionId = u32;

/// Cluster-unique server identifier. Id 0 is reserved as the invalid id.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct ServerId(pub u64);

impl ServerId {
    /// The invalid (unassigned) server id.
    pub const INVALID: ServerId = ServerId(0);

    /// True if this id refers to an actual server.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key identifying one replica on a backup.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct ReplicaKey {
    /// Id of the master whose log the segment belongs to.
    pub master_id: ServerId,

    /// Id of the segment.
    pub segment_id: SegmentId,
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{},{}>", self.master_id, self.segment_id)
    }
}

/// Length commitment over a segment's appended prefix. Only bytes covered by
/// the latest durable certificate are visible after recovery.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct Certificate {
    /// Number of valid bytes from the start of the segment.
    pub segment_length: u32,

    /// CRC-32 over those bytes.
    pub checksum: u32,
}

impl Certificate {
    /// Computes the certificate covering the given byte prefix.
    pub fn of(data: &[u8]) -> Self {
        Certificate {
            segment_length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// True if `data` holds at least `segment_length` bytes and the covered
    /// prefix matches the recorded checksum.
    pub fn validates(&self, data: &[u8]) -> bool {
        let len = self.segment_length as usize;
        if data.len() < len {
            return false;
        }
        crc32fast::hash(&data[..len]) == self.checksum
    }
}

/// Manifest, stored inside log entries, naming every segment in the live log
/// at the time it was written.
#[derive(
    Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub struct LogDigest {
    /// Ids of all segments in the log, oldest first.
    pub segment_ids: Vec<SegmentId>,
}

/// Key-hash range of one table assigned to a recovery partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub struct Tablet {
    /// Table the range belongs to.
    pub table_id: u64,

    /// First key hash covered (inclusive).
    pub start_key_hash: u64,

    /// Last key hash covered (inclusive).
    pub end_key_hash: u64,
}

impl Tablet {
    /// True if the tablet covers the given entry coordinates.
    #[inline]
    pub fn covers(&self, table_id: u64, key_hash: u64) -> bool {
        self.table_id == table_id
            && self.start_key_hash <= key_hash
            && key_hash <= self.end_key_hash
    }
}

/// One unit of recovery work: the set of tablets a single substitute master
/// will reconstruct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct Partition {
    /// Partition id, unique within one recovery.
    pub id: PartitionId,

    /// Tablets assigned to this partition.
    pub tablets: Vec<Tablet>,
}

impl Partition {
    /// True if any tablet of this partition covers the entry coordinates.
    #[inline]
    pub fn covers(&self, table_id: u64, key_hash: u64) -> bool {
        self.tablets.iter().any(|t| t.covers(table_id, key_hash))
    }
}

/// One entry of a master's in-memory log, as far as replication and recovery
/// need to understand it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub enum LogEntry {
    /// An object write belonging to a tablet.
    Object {
        table_id: u64,
        key_hash: u64,
        value: Vec<u8>,
    },

    /// A log digest, present near the start of every segment.
    Digest(LogDigest),
}

/// Byte length of the length header preceding each encoded log entry.
const ENTRY_HEADER_LEN: usize = 4;

/// Appends one length-prefixed encoded entry to `buf`. Returns the number of
/// bytes appended.
pub fn append_entry(
    buf: &mut Vec<u8>,
    entry: &LogEntry,
) -> Result<usize, MirrorlogError> {
    let encoded = encode_to_vec(entry)?;
    buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    buf.extend_from_slice(&encoded);
    Ok(ENTRY_HEADER_LEN + encoded.len())
}

/// Decodes the length-prefixed entries found in `data[..certified_len]`.
/// Stops cleanly at the certified boundary; a partial trailing entry within
/// the boundary is a decode error.
pub fn read_entries(
    data: &[u8],
    certified_len: u32,
) -> Result<Vec<LogEntry>, MirrorlogError> {
    let limit = certified_len as usize;
    if limit > data.len() {
        return logged_err!("entries";
            "certified length {} exceeds data length {}", limit, data.len());
    }

    let mut entries = vec![];
    let mut offset = 0;
    while offset < limit {
        if offset + ENTRY_HEADER_LEN > limit {
            return logged_err!("entries";
                "truncated entry header at offset {}", offset);
        }
        let mut header = [0u8; ENTRY_HEADER_LEN];
        header.copy_from_slice(&data[offset..offset + ENTRY_HEADER_LEN]);
        let entry_len = u32::from_le_bytes(header) as usize;
        let body_start = offset + ENTRY_HEADER_LEN;
        if body_start + entry_len > limit {
            return logged_err!("entries";
                "truncated entry body at offset {}", offset);
        }
        entries.push(decode_from_slice(
            &data[body_start..body_start + entry_len],
        )?);
        offset = body_start + entry_len;
    }
    Ok(entries)
}
