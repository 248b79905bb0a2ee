//! In-memory log segment on the master side: an append-only byte region of
//! fixed capacity holding length-prefixed log entries, with a certificate
//! over the appended prefix.

use std::sync::{Arc, Mutex};

use crate::common::{
    append_entry, Certificate, LogDigest, LogEntry, SegmentId,
};
use crate::utils::MirrorlogError;

/// One fixed-capacity segment of the master's in-memory log. Shared between
/// the log writer (appending) and the replication engine (reading).
pub struct LogSegment {
    capacity: u32,
    data: Mutex<Vec<u8>>,
}

impl LogSegment {
    /// Creates an empty segment.
    pub fn new(capacity: u32) -> Arc<Self> {
        Arc::new(LogSegment {
            capacity,
            data: Mutex::new(vec![]),
        })
    }

    /// Creates a head segment carrying a log digest naming `segment_ids`
    /// as its first entry.
    pub fn new_head(
        capacity: u32,
        segment_ids: Vec<SegmentId>,
    ) -> Result<Arc<Self>, MirrorlogError> {
        let segment = Self::new(capacity);
        segment.append(&LogEntry::Digest(LogDigest { segment_ids }))?;
        Ok(segment)
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Appends one entry, returning the new appended length.
    pub fn append(&self, entry: &LogEntry) -> Result<u32, MirrorlogError> {
        let mut data = self.data.lock().unwrap();
        let mut probe = vec![];
        let entry_len = append_entry(&mut probe, entry)?;
        if data.len() + entry_len > self.capacity as usize {
            return logged_err!("logseg";
                "segment full: {} + {} exceeds capacity {}",
                data.len(), entry_len, self.capacity);
        }
        data.extend_from_slice(&probe);
        Ok(data.len() as u32)
    }

    /// Appends one object entry, returning the new appended length.
    pub fn append_object(
        &self,
        table_id: u64,
        key_hash: u64,
        value: &[u8],
    ) -> Result<u32, MirrorlogError> {
        self.append(&LogEntry::Object {
            table_id,
            key_hash,
            value: value.to_vec(),
        })
    }

    /// Current appended length together with the certificate covering it.
    pub fn appended(&self) -> (u32, Certificate) {
        let data = self.data.lock().unwrap();
        (data.len() as u32, Certificate::of(&data))
    }

    /// Copies out `[offset, offset + length)` of the appended bytes.
    pub fn read(&self, offset: u32, length: u32) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = (offset + length) as usize;
        data[start..end].to_vec()
    }
}

#[cfg(test)]
mod logseg_tests {
    use super::*;

    use crate::common::read_entries;

    #[test]
    fn append_and_certificate() -> Result<(), MirrorlogError> {
        let segment = LogSegment::new(1024);
        let (len, cert) = segment.appended();
        assert_eq!(len, 0);
        assert_eq!(cert, Certificate::default());

        let len = segment.append_object(1, 7, b"value")?;
        let (appended, cert) = segment.appended();
        assert_eq!(appended, len);
        assert!(cert.validates(&segment.read(0, appended)));

        let entries = read_entries(&segment.read(0, appended), appended)?;
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[test]
    fn head_segment_carries_digest() -> Result<(), MirrorlogError> {
        let segment = LogSegment::new_head(1024, vec![88, 89])?;
        let (appended, _) = segment.appended();
        let entries = read_entries(&segment.read(0, appended), appended)?;
        assert_eq!(
            entries[0],
            LogEntry::Digest(LogDigest {
                segment_ids: vec![88, 89]
            })
        );
        Ok(())
    }

    #[test]
    fn rejects_appends_past_capacity() {
        let segment = LogSegment::new(16);
        assert!(segment.append_object(1, 7, b"0123456789abcdef").is_err());
    }
}
