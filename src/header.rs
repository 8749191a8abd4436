use bitflags::bitflags;

use crate::cluster::{ClusterId, NULL_CLUSTER};
use crate::medium::BackingMedium;
use crate::StorageError;

/// Size of the storage header. Cluster data begins right after it.
pub const HEADER_SIZE: u64 = 256;

/// Current header format version.
pub const FORMAT_VERSION: u8 = 1;

// Header layout (fixed offsets, little-endian):
// | version: u8 | policy: u32 | records_count: u64 | records_end_cluster: i64 |
// | record_key_size: u16 | reserved_records: u64 | cluster_size: u32 |
// | total_clusters: u64 | merkle_root: [u8;32] | master_key: [u8;32] | padding |
const VERSION_OFFSET: usize = 0;
const POLICY_OFFSET: usize = VERSION_OFFSET + 1;
const RECORDS_COUNT_OFFSET: usize = POLICY_OFFSET + 4;
const RECORDS_END_CLUSTER_OFFSET: usize = RECORDS_COUNT_OFFSET + 8;
const RECORD_KEY_SIZE_OFFSET: usize = RECORDS_END_CLUSTER_OFFSET + 8;
const RESERVED_RECORDS_OFFSET: usize = RECORD_KEY_SIZE_OFFSET + 2;
const CLUSTER_SIZE_OFFSET: usize = RESERVED_RECORDS_OFFSET + 8;
const TOTAL_CLUSTERS_OFFSET: usize = CLUSTER_SIZE_OFFSET + 4;
const MERKLE_ROOT_OFFSET: usize = TOTAL_CLUSTERS_OFFSET + 8;
const MASTER_KEY_OFFSET: usize = MERKLE_ROOT_OFFSET + 32;
const HEADER_END: usize = MASTER_KEY_OFFSET + 32;

bitflags! {
    /// Storage-wide behaviour switches, persisted in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StoragePolicy: u32 {
        /// Pre-size a stream to the serialized length before writing an item.
        const FAST_ALLOCATE = 1 << 0;
        /// Cache cluster link headers of the record table chain.
        const CACHE_RECORD_CLUSTERS = 1 << 1;
        /// Cache cluster link headers of open streams.
        const CACHE_OPEN_CLUSTERS = 1 << 2;
        /// Cache decoded records.
        const CACHE_RECORDS = 1 << 3;
        /// Run the full verifier after every structural operation.
        const INTEGRITY_CHECKS = 1 << 4;
        /// Records carry a 4-byte key checksum.
        const TRACK_CHECKSUMS = 1 << 5;
        /// Records carry a fixed-size key.
        const TRACK_KEY = 1 << 6;
    }
}

/// The fixed 256-byte preamble of every storage.
///
/// Mutating setters write their field through to the medium immediately, so
/// the on-medium header is always current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHeader {
    pub version: u8,
    pub policy: StoragePolicy,
    pub records_count: u64,
    pub records_end_cluster: ClusterId,
    pub record_key_size: u16,
    pub reserved_records: u64,
    pub cluster_size: u32,
    pub total_clusters: u64,
    pub merkle_root: [u8; 32],
    pub master_key: [u8; 32],
}

impl StorageHeader {
    pub fn new(
        policy: StoragePolicy,
        cluster_size: u32,
        record_key_size: u16,
        reserved_records: u64,
    ) -> Self {
        StorageHeader {
            version: FORMAT_VERSION,
            policy,
            records_count: 0,
            records_end_cluster: NULL_CLUSTER,
            record_key_size,
            reserved_records,
            cluster_size,
            total_clusters: 0,
            merkle_root: [0u8; 32],
            master_key: [0u8; 32],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[VERSION_OFFSET] = self.version;
        buf[POLICY_OFFSET..RECORDS_COUNT_OFFSET].copy_from_slice(&self.policy.bits().to_le_bytes());
        buf[RECORDS_COUNT_OFFSET..RECORDS_END_CLUSTER_OFFSET]
            .copy_from_slice(&self.records_count.to_le_bytes());
        buf[RECORDS_END_CLUSTER_OFFSET..RECORD_KEY_SIZE_OFFSET]
            .copy_from_slice(&self.records_end_cluster.to_le_bytes());
        buf[RECORD_KEY_SIZE_OFFSET..RESERVED_RECORDS_OFFSET]
            .copy_from_slice(&self.record_key_size.to_le_bytes());
        buf[RESERVED_RECORDS_OFFSET..CLUSTER_SIZE_OFFSET]
            .copy_from_slice(&self.reserved_records.to_le_bytes());
        buf[CLUSTER_SIZE_OFFSET..TOTAL_CLUSTERS_OFFSET]
            .copy_from_slice(&self.cluster_size.to_le_bytes());
        buf[TOTAL_CLUSTERS_OFFSET..MERKLE_ROOT_OFFSET]
            .copy_from_slice(&self.total_clusters.to_le_bytes());
        buf[MERKLE_ROOT_OFFSET..MASTER_KEY_OFFSET].copy_from_slice(&self.merkle_root);
        buf[MASTER_KEY_OFFSET..HEADER_END].copy_from_slice(&self.master_key);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, StorageError> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(StorageError::Corruption(format!(
                "header is {} bytes, expected {}",
                buf.len(),
                HEADER_SIZE
            )));
        }
        let version = buf[VERSION_OFFSET];
        if version != FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported header format version: {}",
                version
            )));
        }
        let policy_bits = u32::from_le_bytes(buf[POLICY_OFFSET..RECORDS_COUNT_OFFSET].try_into().unwrap());
        let policy = StoragePolicy::from_bits(policy_bits).ok_or_else(|| {
            StorageError::Corruption(format!("unknown policy bits {:#x}", policy_bits))
        })?;
        let cluster_size = u32::from_le_bytes(
            buf[CLUSTER_SIZE_OFFSET..TOTAL_CLUSTERS_OFFSET].try_into().unwrap(),
        );
        if cluster_size == 0 {
            return Err(StorageError::Corruption("cluster size is zero".to_string()));
        }

        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&buf[MERKLE_ROOT_OFFSET..MASTER_KEY_OFFSET]);
        let mut master_key = [0u8; 32];
        master_key.copy_from_slice(&buf[MASTER_KEY_OFFSET..HEADER_END]);

        Ok(StorageHeader {
            version,
            policy,
            records_count: u64::from_le_bytes(
                buf[RECORDS_COUNT_OFFSET..RECORDS_END_CLUSTER_OFFSET].try_into().unwrap(),
            ),
            records_end_cluster: ClusterId::from_le_bytes(
                buf[RECORDS_END_CLUSTER_OFFSET..RECORD_KEY_SIZE_OFFSET].try_into().unwrap(),
            ),
            record_key_size: u16::from_le_bytes(
                buf[RECORD_KEY_SIZE_OFFSET..RESERVED_RECORDS_OFFSET].try_into().unwrap(),
            ),
            reserved_records: u64::from_le_bytes(
                buf[RESERVED_RECORDS_OFFSET..CLUSTER_SIZE_OFFSET].try_into().unwrap(),
            ),
            cluster_size,
            total_clusters: u64::from_le_bytes(
                buf[TOTAL_CLUSTERS_OFFSET..MERKLE_ROOT_OFFSET].try_into().unwrap(),
            ),
            merkle_root,
            master_key,
        })
    }

    /// Read the header from the start of the medium.
    pub fn load<M: BackingMedium>(medium: &M) -> Result<Self, StorageError> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        medium
            .read_exact_at(0, &mut buf)
            .map_err(|e| StorageError::Io(format!("failed to read storage header: {}", e)))?;
        Self::from_bytes(&buf)
    }

    /// Write the whole header to the start of the medium.
    pub fn store<M: BackingMedium>(&self, medium: &M) -> Result<(), StorageError> {
        medium.write(0, &self.to_bytes())
    }

    pub fn set_records_count<M: BackingMedium>(
        &mut self,
        medium: &M,
        value: u64,
    ) -> Result<(), StorageError> {
        self.records_count = value;
        medium.write(RECORDS_COUNT_OFFSET as u64, &value.to_le_bytes())
    }

    pub fn set_records_end_cluster<M: BackingMedium>(
        &mut self,
        medium: &M,
        value: ClusterId,
    ) -> Result<(), StorageError> {
        self.records_end_cluster = value;
        medium.write(RECORDS_END_CLUSTER_OFFSET as u64, &value.to_le_bytes())
    }

    pub fn set_total_clusters<M: BackingMedium>(
        &mut self,
        medium: &M,
        value: u64,
    ) -> Result<(), StorageError> {
        self.total_clusters = value;
        medium.write(TOTAL_CLUSTERS_OFFSET as u64, &value.to_le_bytes())
    }

    pub fn set_merkle_root<M: BackingMedium>(
        &mut self,
        medium: &M,
        value: [u8; 32],
    ) -> Result<(), StorageError> {
        self.merkle_root = value;
        medium.write(MERKLE_ROOT_OFFSET as u64, &value)
    }

    pub fn set_master_key<M: BackingMedium>(
        &mut self,
        medium: &M,
        value: [u8; 32],
    ) -> Result<(), StorageError> {
        self.master_key = value;
        medium.write(MASTER_KEY_OFFSET as u64, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryMedium;

    #[test]
    fn field_offsets_match_layout() {
        assert_eq!(RECORDS_COUNT_OFFSET, 5);
        assert_eq!(RECORDS_END_CLUSTER_OFFSET, 13);
        assert_eq!(RECORD_KEY_SIZE_OFFSET, 21);
        assert_eq!(RESERVED_RECORDS_OFFSET, 23);
        assert_eq!(CLUSTER_SIZE_OFFSET, 31);
        assert_eq!(TOTAL_CLUSTERS_OFFSET, 35);
        assert_eq!(MERKLE_ROOT_OFFSET, 43);
        assert_eq!(MASTER_KEY_OFFSET, 75);
        assert!(HEADER_END <= HEADER_SIZE as usize);
    }

    #[test]
    fn eager_setters_write_through() {
        let medium = MemoryMedium::new();
        let mut header = StorageHeader::new(
            StoragePolicy::CACHE_RECORDS | StoragePolicy::TRACK_KEY,
            32,
            16,
            2,
        );
        header.store(&medium).unwrap();

        header.set_records_count(&medium, 9).unwrap();
        header.set_records_end_cluster(&medium, 41).unwrap();
        header.set_total_clusters(&medium, 77).unwrap();
        header.set_merkle_root(&medium, [0xAB; 32]).unwrap();

        let loaded = StorageHeader::load(&medium).unwrap();
        assert_eq!(loaded, header);
        assert_eq!(loaded.records_count, 9);
        assert_eq!(loaded.records_end_cluster, 41);
        assert_eq!(loaded.total_clusters, 77);
        assert_eq!(loaded.reserved_records, 2);
        assert_eq!(loaded.record_key_size, 16);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = StorageHeader::new(StoragePolicy::empty(), 32, 0, 0).to_bytes();
        bytes[0] = 99;
        assert!(matches!(
            StorageHeader::from_bytes(&bytes),
            Err(StorageError::Corruption(_))
        ));
    }
}
