//! Backup frame pool: a fixed array of segment-sized slots backed by memory
//! or a single file, with crash-safe per-frame metadata trailers.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::common::{Certificate, SegmentEpoch, SegmentId, ServerId};
use crate::utils::{Bitmap, MirrorlogError};

use bytes::Bytes;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

/// Fixed byte length of the metadata trailer of every frame.
pub const METADATA_BLOCK_LEN: usize = 1024;

/// Fixed byte length of the superblock at the head of a storage file.
pub(crate) const SUPERBLOCK_LEN: usize = 512;

/// Failure of a frame-pool operation. Storage-level io errors are not
/// represented here: a backup whose storage fails writes cannot keep its
/// durability promises and terminates instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// No free frame in the pool.
    OutOfStorage,

    /// Write would exceed the frame's capacity.
    Overflow,
}

/// Metadata trailer persisted with each certificate-carrying append. The
/// checksum over all other fields makes torn or stale trailers detectable
/// at restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMetadata {
    pub certificate: Certificate,
    pub master_id: ServerId,
    pub segment_id: SegmentId,

    /// Frame capacity the writer assumed; must match the configured segment
    /// size for the replica to be reusable.
    pub segment_capacity: u32,

    pub segment_epoch: SegmentEpoch,
    pub closed: bool,
    pub primary: bool,
}

/// Encodes a metadata trailer into a fixed-size block:
/// `[body_len: u32][crc32(body): u32][body][zero padding]`.
pub fn encode_metadata_block(
    metadata: &ReplicaMetadata,
) -> Result<Vec<u8>, MirrorlogError> {
    let body = encode_to_vec(metadata)?;
    if 8 + body.len() > METADATA_BLOCK_LEN {
        return logged_err!("frames";
            "metadata body of {} bytes exceeds block size", body.len());
    }
    let mut block = Vec::with_capacity(METADATA_BLOCK_LEN);
    block.extend_from_slice(&(body.len() as u32).to_le_bytes());
    block.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    block.extend_from_slice(&body);
    block.resize(METADATA_BLOCK_LEN, 0);
    Ok(block)
}

/// Decodes a metadata block, returning `None` if the length header or the
/// checksum does not validate (the frame is then treated as free).
pub fn decode_metadata_block(block: &[u8]) -> Option<ReplicaMetadata> {
    if block.len() < 8 {
        return None;
    }
    let body_len =
        u32::from_le_bytes(block[0..4].try_into().unwrap()) as usize;
    if body_len == 0 || 8 + body_len > block.len() {
        return None;
    }
    let checksum = u32::from_le_bytes(block[4..8].try_into().unwrap());
    let body = &block[8..8 + body_len];
    if crc32fast::hash(body) != checksum {
        return None;
    }
    decode_from_slice(body).ok()
}

/// Contents of a storage file's superblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Superblock {
    cluster_name: String,
}

enum Backend {
    /// Volatile pool; one resident buffer per open frame.
    Memory {
        bufs: Vec<Mutex<Option<Vec<u8>>>>,
    },

    /// One backing file holding all frames behind a superblock.
    File { file: File },
}

struct StoreShared {
    segment_size: u32,
    num_frames: usize,
    backend: Backend,

    /// Free map plus per-frame cached metadata, under one lock.
    state: Mutex<StoreState>,
}

struct StoreState {
    free: Bitmap,
    metas: Vec<Option<ReplicaMetadata>>,
}

/// Handle on one reserved frame. Cheap to clone; all clones address the same
/// slot. The slot stays reserved until `FrameStore::free` releases it.
#[derive(Clone)]
pub struct Frame {
    slot: usize,

    /// Persist appends before returning from them.
    sync: bool,

    shared: Arc<StoreShared>,
}

/// Shared reference to a frame.
pub type FrameRef = Arc<Frame>;

/// Pool of segment-sized replica frames on one backup.
pub struct FrameStore {
    shared: Arc<StoreShared>,
}

fn die_on_io<T>(what: &str, result: io::Result<T>) -> T {
    match result {
        Ok(v) => v,
        // a backup that cannot read or write its frames cannot keep its
        // durability promises; terminate rather than serve garbage
        Err(e) => panic!("backup storage {} failed: {}", what, e),
    }
}

impl FrameStore {
    /// Creates a volatile in-memory pool.
    pub fn new_memory(segment_size: u32, num_frames: usize) -> Self {
        let bufs = (0..num_frames).map(|_| Mutex::new(None)).collect();
        FrameStore {
            shared: Arc::new(StoreShared {
                segment_size,
                num_frames,
                backend: Backend::Memory { bufs },
                state: Mutex::new(StoreState {
                    free: Bitmap::new(num_frames, true),
                    metas: vec![None; num_frames],
                }),
            }),
        }
    }

    /// Opens (creating and sizing if needed) a single-file pool at `path`.
    pub fn new_file(
        segment_size: u32,
        num_frames: usize,
        path: &Path,
    ) -> Result<Self, MirrorlogError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let total = SUPERBLOCK_LEN as u64
            + num_frames as u64
                * (segment_size as u64 + METADATA_BLOCK_LEN as u64);
        if file.metadata()?.len() < total {
            file.set_len(total)?;
        }
        Ok(FrameStore {
            shared: Arc::new(StoreShared {
                segment_size,
                num_frames,
                backend: Backend::File { file },
                state: Mutex::new(StoreState {
                    free: Bitmap::new(num_frames, true),
                    metas: vec![None; num_frames],
                }),
            }),
        })
    }

    /// Configured frame capacity in bytes.
    pub fn segment_size(&self) -> u32 {
        self.shared.segment_size
    }

    /// Total number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.shared.num_frames
    }

    /// Number of currently free frames.
    pub fn free_frames(&self) -> usize {
        self.shared.state.lock().unwrap().free.count()
    }

    /// Reserves a free frame for a new replica. With `sync`, appends through
    /// the returned handle persist before returning.
    pub fn open(&self, sync: bool) -> Result<FrameRef, FrameError> {
        let mut state = self.shared.state.lock().unwrap();
        let slot = state.free.first_one().ok_or(FrameError::OutOfStorage)?;
        state.free.set(slot, false).unwrap();
        state.metas[slot] = None;
        drop(state);

        if let Backend::Memory { bufs } = &self.shared.backend {
            *bufs[slot].lock().unwrap() =
                Some(vec![0; self.shared.segment_size as usize]);
        }
        Ok(Arc::new(Frame {
            slot,
            sync,
            shared: self.shared.clone(),
        }))
    }

    /// Returns a frame's slot to the free pool. Existing loaded views of the
    /// data stay valid; the slot's contents may be overwritten by the next
    /// open.
    pub fn free(&self, frame: &Frame) {
        let mut state = self.shared.state.lock().unwrap();
        state.free.set(frame.slot, true).unwrap();
        state.metas[frame.slot] = None;
        drop(state);

        if let Backend::Memory { bufs } = &self.shared.backend {
            *bufs[frame.slot].lock().unwrap() = None;
        }
    }

    /// Re-reserves a specific slot found populated during a restart scan,
    /// handing back a handle on it.
    pub fn adopt(
        &self,
        slot: usize,
        metadata: ReplicaMetadata,
    ) -> FrameRef {
        let mut state = self.shared.state.lock().unwrap();
        if !state.free.get(slot).unwrap() {
            panic!("adopting frame slot {} which is not free", slot);
        }
        state.free.set(slot, false).unwrap();
        state.metas[slot] = Some(metadata);
        Arc::new(Frame {
            slot,
            sync: true,
            shared: self.shared.clone(),
        })
    }

    /// Reads every slot's metadata block from backing storage, returning
    /// `(slot, decoded metadata)` pairs. Slots whose block fails validation
    /// yield `None`. Only meaningful before any frame has been opened.
    pub fn scan(&self) -> Vec<(usize, Option<ReplicaMetadata>)> {
        match &self.shared.backend {
            Backend::Memory { .. } => {
                // volatile pool: nothing survives a restart
                (0..self.shared.num_frames).map(|i| (i, None)).collect()
            }
            Backend::File { file } => (0..self.shared.num_frames)
                .map(|slot| {
                    let mut block = vec![0u8; METADATA_BLOCK_LEN];
                    die_on_io(
                        "metadata read",
                        file.read_exact_at(
                            &mut block,
                            self.metadata_offset(slot),
                        ),
                    );
                    (slot, decode_metadata_block(&block))
                })
                .collect(),
        }
    }

    /// Overwrites every metadata block with zeroes, making all previously
    /// stored replicas unrecoverable. Used when the stored cluster name does
    /// not match the configured one.
    pub fn scribble(&self) {
        if let Backend::File { file } = &self.shared.backend {
            let zeros = vec![0u8; METADATA_BLOCK_LEN];
            for slot in 0..self.shared.num_frames {
                die_on_io(
                    "metadata scribble",
                    file.write_all_at(&zeros, self.metadata_offset(slot)),
                );
            }
            die_on_io("metadata scribble sync", file.sync_data());
        }
    }

    /// Cluster name recorded in the storage file's superblock, if one is
    /// present and validates.
    pub fn stored_cluster_name(&self) -> Option<String> {
        match &self.shared.backend {
            Backend::Memory { .. } => None,
            Backend::File { file } => {
                let mut block = vec![0u8; SUPERBLOCK_LEN];
                die_on_io(
                    "superblock read",
                    file.read_exact_at(&mut block, 0),
                );
                decode_superblock(&block).map(|sb| sb.cluster_name)
            }
        }
    }

    /// Records the configured cluster name in the superblock.
    pub fn write_cluster_name(
        &self,
        cluster_name: &str,
    ) -> Result<(), MirrorlogError> {
        if let Backend::File { file } = &self.shared.backend {
            let block = encode_superblock(&Superblock {
                cluster_name: cluster_name.to_string(),
            })?;
            die_on_io("superblock write", file.write_all_at(&block, 0));
            die_on_io("superblock sync", file.sync_data());
        }
        Ok(())
    }

    fn metadata_offset(&self, slot: usize) -> u64 {
        self.shared.metadata_offset(slot)
    }
}

impl StoreShared {
    fn data_offset(&self, slot: usize) -> u64 {
        SUPERBLOCK_LEN as u64
            + slot as u64
                * (self.segment_size as u64 + METADATA_BLOCK_LEN as u64)
    }

    fn metadata_offset(&self, slot: usize) -> u64 {
        self.data_offset(slot) + self.segment_size as u64
    }
}

fn encode_superblock(sb: &Superblock) -> Result<Vec<u8>, MirrorlogError> {
    let body = encode_to_vec(sb)?;
    if 8 + body.len() > SUPERBLOCK_LEN {
        return logged_err!("frames";
            "cluster name of {} bytes exceeds superblock", body.len());
    }
    let mut block = Vec::with_capacity(SUPERBLOCK_LEN);
    block.extend_from_slice(&(body.len() as u32).to_le_bytes());
    block.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    block.extend_from_slice(&body);
    block.resize(SUPERBLOCK_LEN, 0);
    Ok(block)
}

fn decode_superblock(block: &[u8]) -> Option<Superblock> {
    if block.len() < 8 {
        return None;
    }
    let body_len =
        u32::from_le_bytes(block[0..4].try_into().unwrap()) as usize;
    if body_len == 0 || 8 + body_len > block.len() {
        return None;
    }
    let checksum = u32::from_le_bytes(block[4..8].try_into().unwrap());
    let body = &block[8..8 + body_len];
    if crc32fast::hash(body) != checksum {
        return None;
    }
    decode_from_slice(body).ok()
}

impl Frame {
    /// Slot index of this frame within the pool.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Copies `length` bytes of `data` starting at `source_offset` into the
    /// frame at `dest_offset`, then (if given) atomically replaces the
    /// frame's metadata trailer. Data is made durable before the new trailer
    /// becomes visible, so a torn crash leaves either the prior trailer or
    /// the new one, never new metadata over missing data.
    pub fn append(
        &self,
        data: &[u8],
        source_offset: u32,
        length: u32,
        dest_offset: u32,
        metadata: Option<&ReplicaMetadata>,
    ) -> Result<(), FrameError> {
        if dest_offset as u64 + length as u64 > self.shared.segment_size as u64
        {
            return Err(FrameError::Overflow);
        }
        if source_offset as u64 + length as u64 > data.len() as u64 {
            return Err(FrameError::Overflow);
        }
        let src =
            &data[source_offset as usize..(source_offset + length) as usize];

        match &self.shared.backend {
            Backend::Memory { bufs } => {
                let mut buf = bufs[self.slot].lock().unwrap();
                let buf = buf
                    .as_mut()
                    .unwrap_or_else(|| {
                        panic!("append to unopened frame {}", self.slot)
                    });
                buf[dest_offset as usize..(dest_offset + length) as usize]
                    .copy_from_slice(src);
            }
            Backend::File { file } => {
                if length > 0 {
                    die_on_io(
                        "data write",
                        file.write_all_at(
                            src,
                            self.shared.data_offset(self.slot)
                                + dest_offset as u64,
                        ),
                    );
                }
                if self.sync {
                    die_on_io("data sync", file.sync_data());
                }
                if let Some(metadata) = metadata {
                    let block = match encode_metadata_block(metadata) {
                        Ok(block) => block,
                        Err(e) => panic!("metadata block encoding: {}", e),
                    };
                    die_on_io(
                        "metadata write",
                        file.write_all_at(
                            &block,
                            self.shared.metadata_offset(self.slot),
                        ),
                    );
                    if self.sync {
                        die_on_io("metadata sync", file.sync_data());
                    }
                }
            }
        }

        if let Some(metadata) = metadata {
            self.shared.state.lock().unwrap().metas[self.slot] =
                Some(metadata.clone());
        }
        Ok(())
    }

    /// Returns an immutable view of the frame's full data region. The view
    /// stays valid after the frame is freed or reused.
    pub fn load(&self) -> Bytes {
        match &self.shared.backend {
            Backend::Memory { bufs } => {
                let buf = bufs[self.slot].lock().unwrap();
                match buf.as_ref() {
                    Some(buf) => Bytes::from(buf.clone()),
                    None => Bytes::new(),
                }
            }
            Backend::File { file } => {
                let mut buf = vec![0u8; self.shared.segment_size as usize];
                die_on_io(
                    "data read",
                    file.read_exact_at(
                        &mut buf,
                        self.shared.data_offset(self.slot),
                    ),
                );
                Bytes::from(buf)
            }
        }
    }

    /// Current cached metadata trailer, if any durable one exists.
    pub fn metadata(&self) -> Option<ReplicaMetadata> {
        self.shared.state.lock().unwrap().metas[self.slot].clone()
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;

    fn sample_metadata(master: u64, segment: u64) -> ReplicaMetadata {
        ReplicaMetadata {
            certificate: Certificate {
                segment_length: 14,
                checksum: 0xabcd,
            },
            master_id: ServerId(master),
            segment_id: segment,
            segment_capacity: 4096,
            segment_epoch: 0,
            closed: false,
            primary: true,
        }
    }

    #[test]
    fn metadata_block_roundtrip() {
        let metadata = sample_metadata(70, 88);
        let block = encode_metadata_block(&metadata).unwrap();
        assert_eq!(block.len(), METADATA_BLOCK_LEN);
        assert_eq!(decode_metadata_block(&block), Some(metadata));
    }

    #[test]
    fn metadata_block_bad_checksum() {
        let metadata = sample_metadata(70, 90);
        let mut block = encode_metadata_block(&metadata).unwrap();
        block[10] ^= 0xff;
        assert_eq!(decode_metadata_block(&block), None);
        assert_eq!(decode_metadata_block(&[0u8; METADATA_BLOCK_LEN]), None);
    }

    #[test]
    fn memory_open_append_load_free() {
        let store = FrameStore::new_memory(4096, 2);
        assert_eq!(store.free_frames(), 2);

        let frame = store.open(false).unwrap();
        assert_eq!(store.free_frames(), 1);

        let metadata = sample_metadata(99, 88);
        frame
            .append(b"__test", 2, 4, 10, Some(&metadata))
            .unwrap();
        let view = frame.load();
        assert_eq!(&view[10..14], b"test");
        assert_eq!(frame.metadata(), Some(metadata));

        store.free(&frame);
        assert_eq!(store.free_frames(), 2);
    }

    #[test]
    fn append_overflow() {
        let store = FrameStore::new_memory(16, 1);
        let frame = store.open(false).unwrap();
        let data = vec![7u8; 32];
        assert_eq!(
            frame.append(&data, 0, 17, 0, None),
            Err(FrameError::Overflow)
        );
        assert_eq!(
            frame.append(&data, 0, 8, 9, None),
            Err(FrameError::Overflow)
        );
        assert_eq!(
            frame.append(&data, 30, 8, 0, None),
            Err(FrameError::Overflow)
        );
        assert!(frame.append(&data, 0, 16, 0, None).is_ok());
    }

    #[test]
    fn pool_exhaustion() {
        let store = FrameStore::new_memory(64, 2);
        let _f0 = store.open(false).unwrap();
        let _f1 = store.open(false).unwrap();
        assert!(matches!(store.open(false), Err(FrameError::OutOfStorage)));
    }

    #[test]
    fn load_survives_free() {
        let store = FrameStore::new_memory(64, 1);
        let frame = store.open(false).unwrap();
        frame.append(b"alive", 0, 5, 0, None).unwrap();
        let view = frame.load();
        store.free(&frame);
        let reused = store.open(false).unwrap();
        reused.append(b"other", 0, 5, 0, None).unwrap();
        assert_eq!(&view[..5], b"alive");
    }

    #[test]
    fn file_backend_persistence() -> Result<(), MirrorlogError> {
        let path = std::env::temp_dir().join("mirrorlog-test-frames-0.db");
        let _ = std::fs::remove_file(&path);

        {
            let store = FrameStore::new_file(4096, 3, &path)?;
            store.write_cluster_name("testing")?;
            let frame = store.open(true).unwrap();
            let metadata = sample_metadata(70, 88);
            frame.append(b"durable", 0, 7, 0, Some(&metadata)).unwrap();
        }

        // fresh store over the same file sees the superblock and replica
        let store = FrameStore::new_file(4096, 3, &path)?;
        assert_eq!(store.stored_cluster_name(), Some("testing".into()));
        let scanned = store.scan();
        assert_eq!(scanned.len(), 3);
        let (slot, metadata) = &scanned[0];
        let metadata = metadata.clone().unwrap();
        assert_eq!(metadata.master_id, ServerId(70));
        assert_eq!(metadata.segment_id, 88);
        let frame = store.adopt(*slot, metadata);
        assert_eq!(&frame.load()[..7], b"durable");
        assert!(scanned[1].1.is_none());

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn file_backend_scribble() -> Result<(), MirrorlogError> {
        let path = std::env::temp_dir().join("mirrorlog-test-frames-1.db");
        let _ = std::fs::remove_file(&path);

        {
            let store = FrameStore::new_file(1024, 2, &path)?;
            store.write_cluster_name("old-cluster")?;
            let frame = store.open(true).unwrap();
            frame
                .append(b"x", 0, 1, 0, Some(&sample_metadata(5, 6)))
                .unwrap();
        }

        let store = FrameStore::new_file(1024, 2, &path)?;
        store.scribble();
        assert!(store.scan().iter().all(|(_, m)| m.is_none()));

        std::fs::remove_file(&path)?;
        Ok(())
    }
}
