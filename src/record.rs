use bitflags::bitflags;

use crate::cluster::{ClusterId, NULL_CLUSTER};
use crate::header::{StorageHeader, StoragePolicy};
use crate::StorageError;

/// Size of the fixed part of a record: traits(1) + start(8) + size(8) + end(8).
pub const RECORD_BASE_SIZE: usize = 25;

/// Size of the optional key checksum field.
pub const KEY_CHECKSUM_SIZE: usize = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RecordTraits: u8 {
        /// The record stands for an absent item.
        const IS_NULL = 0b0000_0001;
        /// The slot has been handed out by `add` or `insert`.
        const IS_USED = 0b0000_0010;
    }
}

/// Per-stream metadata. The record's index in the table is the terminal
/// value of the chain it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub traits: RecordTraits,
    pub size: u64,
    pub start: ClusterId,
    pub end: ClusterId,
    pub key_checksum: u32,
    pub key: Vec<u8>,
}

impl StreamRecord {
    /// A record that owns no clusters, with a zeroed key of the layout's size.
    pub fn empty(layout: &RecordLayout) -> Self {
        StreamRecord {
            traits: RecordTraits::empty(),
            size: 0,
            start: NULL_CLUSTER,
            end: NULL_CLUSTER,
            key_checksum: 0,
            key: vec![0u8; layout.key_size],
        }
    }

    /// `empty`, flagged as handed out.
    pub fn used(layout: &RecordLayout) -> Self {
        let mut record = Self::empty(layout);
        record.traits.insert(RecordTraits::IS_USED);
        record
    }

    /// True when the record owns no chain.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_null(&self) -> bool {
        self.traits.contains(RecordTraits::IS_NULL)
    }
}

/// On-medium shape of a record, fixed per storage by its policy.
///
/// `traits | start | size | end | [key_checksum] | [key]`, little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub track_checksums: bool,
    pub key_size: usize,
}

impl RecordLayout {
    pub fn from_header(header: &StorageHeader) -> Self {
        RecordLayout {
            track_checksums: header.policy.contains(StoragePolicy::TRACK_CHECKSUMS),
            key_size: if header.policy.contains(StoragePolicy::TRACK_KEY) {
                header.record_key_size as usize
            } else {
                0
            },
        }
    }

    pub fn record_size(&self) -> usize {
        let checksum = if self.track_checksums {
            KEY_CHECKSUM_SIZE
        } else {
            0
        };
        RECORD_BASE_SIZE + checksum + self.key_size
    }

    pub fn encode(&self, record: &StreamRecord) -> Result<Vec<u8>, StorageError> {
        if record.key.len() != self.key_size {
            return Err(StorageError::InvalidArgument(format!(
                "record key is {} bytes, layout expects {}",
                record.key.len(),
                self.key_size
            )));
        }
        let mut buf = Vec::with_capacity(self.record_size());
        buf.push(record.traits.bits());
        buf.extend_from_slice(&record.start.to_le_bytes());
        buf.extend_from_slice(&record.size.to_le_bytes());
        buf.extend_from_slice(&record.end.to_le_bytes());
        if self.track_checksums {
            buf.extend_from_slice(&record.key_checksum.to_le_bytes());
        }
        buf.extend_from_slice(&record.key);
        Ok(buf)
    }

    pub fn decode(&self, buf: &[u8]) -> Result<StreamRecord, StorageError> {
        if buf.len() != self.record_size() {
            return Err(StorageError::Corruption(format!(
                "record image is {} bytes, expected {}",
                buf.len(),
                self.record_size()
            )));
        }
        let traits = RecordTraits::from_bits(buf[0]).ok_or_else(|| {
            StorageError::Corruption(format!("unknown record trait bits {:#04x}", buf[0]))
        })?;
        let mut pos = RECORD_BASE_SIZE;
        let key_checksum = if self.track_checksums {
            pos += KEY_CHECKSUM_SIZE;
            u32::from_le_bytes(buf[RECORD_BASE_SIZE..pos].try_into().unwrap())
        } else {
            0
        };
        Ok(StreamRecord {
            traits,
            start: ClusterId::from_le_bytes(buf[1..9].try_into().unwrap()),
            size: u64::from_le_bytes(buf[9..17].try_into().unwrap()),
            end: ClusterId::from_le_bytes(buf[17..25].try_into().unwrap()),
            key_checksum,
            key: buf[pos..].to_vec(),
        })
    }
}

/// CRC-32 of a record key, as stored in the key checksum field.
pub fn key_checksum(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_policy() {
        let mut header = StorageHeader::new(StoragePolicy::empty(), 32, 16, 0);
        assert_eq!(RecordLayout::from_header(&header).record_size(), 25);

        header.policy = StoragePolicy::TRACK_CHECKSUMS;
        assert_eq!(RecordLayout::from_header(&header).record_size(), 29);

        header.policy = StoragePolicy::TRACK_CHECKSUMS | StoragePolicy::TRACK_KEY;
        assert_eq!(RecordLayout::from_header(&header).record_size(), 45);
    }

    #[test]
    fn encode_places_fields() {
        let layout = RecordLayout {
            track_checksums: true,
            key_size: 3,
        };
        let record = StreamRecord {
            traits: RecordTraits::IS_USED,
            size: 70,
            start: 4,
            end: 9,
            key_checksum: key_checksum(b"abc"),
            key: b"abc".to_vec(),
        };
        let bytes = layout.encode(&record).unwrap();
        assert_eq!(bytes.len(), layout.record_size());
        assert_eq!(bytes[0], 0b10);
        assert_eq!(&bytes[1..9], &4i64.to_le_bytes());
        assert_eq!(&bytes[9..17], &70u64.to_le_bytes());
        assert_eq!(&bytes[29..], b"abc");
        assert_eq!(layout.decode(&bytes).unwrap(), record);
    }

    #[test]
    fn key_length_must_match_layout() {
        let layout = RecordLayout {
            track_checksums: false,
            key_size: 4,
        };
        let mut record = StreamRecord::empty(&layout);
        record.key = vec![1, 2];
        assert!(matches!(
            layout.encode(&record),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_record_owns_nothing() {
        let layout = RecordLayout {
            track_checksums: false,
            key_size: 0,
        };
        let record = StreamRecord::used(&layout);
        assert!(record.is_empty());
        assert!(!record.is_null());
        assert_eq!(record.start, NULL_CLUSTER);
        assert_eq!(record.end, NULL_CLUSTER);
        assert!(record.traits.contains(RecordTraits::IS_USED));
    }
}
