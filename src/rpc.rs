//! Wire-level request/response payloads of the replication and recovery
//! operations, plus the typed failures that ride back inside responses.
//! Transport framing and serialization of these types on an actual network
//! is a collaborator's concern; the loopback transport passes them by value.

use std::fmt;

use crate::common::{
    Certificate, LogDigest, SegmentEpoch, SegmentId, ServerId,
};

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Typed failure of a replication/recovery operation, surfaced to callers
/// inside the RPC response.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub enum RpcFailure {
    /// Backup has no free frame; retry elsewhere.
    OutOfStorage,

    /// The referenced replica is in a state incompatible with the operation
    /// (never opened, already closed, or unknown to the recovery).
    BadSegmentId,

    /// Offset/length would exceed the frame.
    SegmentOverflow,

    /// Backup declined a new open (out of storage, or the open would collide
    /// with a replica restored from storage).
    BackupOpenRejected,

    /// Target server is absent from the cluster view; retry after the
    /// failure monitor observes the change.
    ServerNotUp,
}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RpcFailure::OutOfStorage => write!(f, "out of storage"),
            RpcFailure::BadSegmentId => write!(f, "bad segment id"),
            RpcFailure::SegmentOverflow => write!(f, "segment overflow"),
            RpcFailure::BackupOpenRejected => {
                write!(f, "backup open rejected")
            }
            RpcFailure::ServerNotUp => write!(f, "server not up"),
        }
    }
}

/// writeSegment request: replicate `data` at `offset` of one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct WriteSegmentRequest {
    pub master_id: ServerId,
    pub segment_id: SegmentId,

    /// Replication epoch the master currently associates with the segment.
    pub epoch: SegmentEpoch,

    /// Destination offset of `data` within the segment.
    pub offset: u32,

    /// Bytes to append; may be empty (e.g. an epoch-refresh write).
    pub data: Vec<u8>,

    /// When present, makes all bytes up to `certificate.segment_length`
    /// recoverable. When absent, the previously durable certificate stays in
    /// effect.
    pub certificate: Option<Certificate>,

    /// This is the opening write of the replica.
    pub open: bool,

    /// This write closes the replica; no further writes are legal.
    pub close: bool,

    /// Replica is the primary one for its segment.
    pub primary: bool,
}

/// writeSegment response: the backup's current replication group, so masters
/// learn group changes on their next write.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub struct WriteSegmentResponse {
    pub group_id: u64,
    pub group: Vec<ServerId>,
}

/// One replica reported in a startReadingData response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct ReplicaInfo {
    pub segment_id: SegmentId,

    /// Bytes covered by the latest durable certificate.
    pub length: u32,

    pub primary: bool,
    pub closed: bool,

    /// Replication epoch recorded with the replica's last write.
    pub epoch: SegmentEpoch,
}

/// Log digest found in a replica, with the coordinates of the replica it
/// came from so the coordinator can prefer the newest one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct DigestInfo {
    pub segment_id: SegmentId,
    pub length: u32,
    pub digest: LogDigest,
}

/// startReadingData response: the backup's replica inventory for one crashed
/// master (primaries listed first), plus any log digest found.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub struct StartReadingDataResponse {
    pub replicas: Vec<ReplicaInfo>,
    pub digest: Option<DigestInfo>,
}

/// getRecoveryData response: one partition's filtered bytes of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct GetRecoveryDataResponse {
    pub data: Vec<u8>,
    pub certificate: Certificate,
}

/// Where a substitute master should fetch one recovered segment from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub struct ReplicaSource {
    pub segment_id: SegmentId,
    pub backup_id: ServerId,
}

#[cfg(test)]
mod rpc_tests {
    use super::*;

    use rmp_serde::decode::from_slice as decode_from_slice;
    use rmp_serde::encode::to_vec as encode_to_vec;

    use crate::utils::MirrorlogError;

    #[test]
    fn write_request_encodable() -> Result<(), MirrorlogError> {
        let req = WriteSegmentRequest {
            master_id: ServerId(99),
            segment_id: 88,
            epoch: 1,
            offset: 10,
            data: b"test".to_vec(),
            certificate: Some(Certificate {
                segment_length: 14,
                checksum: 0x1234,
            }),
            open: false,
            close: true,
            primary: true,
        };
        let bytes = encode_to_vec(&req)?;
        let decoded: WriteSegmentRequest = decode_from_slice(&bytes)?;
        assert_eq!(decoded, req);
        Ok(())
    }

    #[test]
    fn failure_display() {
        assert_eq!(format!("{}", RpcFailure::OutOfStorage), "out of storage");
        assert_eq!(format!("{}", RpcFailure::BadSegmentId), "bad segment id");
    }
}
