use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::cluster::{ClusterId, NULL_CLUSTER};
use crate::cluster_map::ClusterMap;
use crate::fragment_provider::{FragmentProvider, StreamListener};
use crate::header::StorageHeader;
use crate::medium::BackingMedium;
use crate::record::{RecordLayout, StreamRecord};
use crate::StorageError;

/// A deferred edit to one record, collected while the cluster map is busy
/// and applied once the map operation has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPatch {
    Bounds {
        index: u64,
        start: ClusterId,
        end: ClusterId,
    },
    Start {
        index: u64,
        start: ClusterId,
    },
    End {
        index: u64,
        end: ClusterId,
    },
    Size {
        index: u64,
        size: u64,
    },
}

impl RecordPatch {
    pub fn index(&self) -> u64 {
        match *self {
            RecordPatch::Bounds { index, .. }
            | RecordPatch::Start { index, .. }
            | RecordPatch::End { index, .. }
            | RecordPatch::Size { index, .. } => index,
        }
    }

    fn apply(&self, record: &mut StreamRecord) {
        match *self {
            RecordPatch::Bounds { start, end, .. } => {
                record.start = start;
                record.end = end;
            }
            RecordPatch::Start { start, .. } => record.start = start,
            RecordPatch::End { end, .. } => record.end = end,
            RecordPatch::Size { size, .. } => record.size = size,
        }
    }
}

/// The array of stream records, stored as the chain whose terminal is
/// `NULL_CLUSTER`.
pub struct RecordTable {
    provider: Mutex<FragmentProvider>,
    layout: RecordLayout,
    count: u64,
    cluster_size: usize,
    cache: Option<Mutex<LruCache<u64, StreamRecord>>>,
}

impl RecordTable {
    /// Attach to the record chain described by `header`. The chain start is
    /// found by walking back from the persisted end cluster.
    pub fn attach<M: BackingMedium>(
        map: &ClusterMap<M>,
        header: &StorageHeader,
        cache_capacity: Option<NonZeroUsize>,
    ) -> Result<Self, StorageError> {
        let layout = RecordLayout::from_header(header);
        let count = header.records_count;
        let bytes = count
            .checked_mul(layout.record_size() as u64)
            .ok_or_else(|| {
                StorageError::Corruption(format!("record count {} overflows the record chain", count))
            })?;
        let cluster_size = map.cluster_size();

        let provider = if header.records_end_cluster == NULL_CLUSTER {
            if count != 0 {
                return Err(StorageError::Corruption(format!(
                    "{} records but no record chain",
                    count
                )));
            }
            FragmentProvider::empty(NULL_CLUSTER, cluster_size)
        } else {
            let end = header.records_end_cluster;
            let links = map.links(end)?;
            if !links.is_end() || links.next != NULL_CLUSTER {
                return Err(StorageError::Corruption(format!(
                    "cluster {} is not the end of the record chain",
                    end
                )));
            }
            let start = map.resolve_chain_start(end)?;
            if map.prev(start)? != NULL_CLUSTER {
                return Err(StorageError::Corruption(format!(
                    "record chain starting at {} has terminal {}",
                    start,
                    map.prev(start)?
                )));
            }
            FragmentProvider::attach(NULL_CLUSTER, start, end, bytes, cluster_size)
        };

        Ok(RecordTable {
            provider: Mutex::new(provider),
            layout,
            count,
            cluster_size,
            cache: cache_capacity.map(|cap| Mutex::new(LruCache::new(cap))),
        })
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn byte_len(&self) -> u64 {
        self.count * self.layout.record_size() as u64
    }

    pub fn start_cluster(&self) -> ClusterId {
        self.provider.lock().start_cluster()
    }

    pub fn end_cluster(&self) -> ClusterId {
        self.provider.lock().end_cluster()
    }

    pub fn chain_clusters(&self) -> u64 {
        self.provider.lock().cluster_count()
    }

    /// The record chain's provider, to be fed cluster map events.
    pub fn provider_mut(&mut self) -> &mut FragmentProvider {
        self.provider.get_mut()
    }

    fn check_index(&self, index: u64) -> Result<(), StorageError> {
        if index >= self.count {
            return Err(StorageError::OutOfBounds(format!(
                "record index {} out of range ({} records)",
                index, self.count
            )));
        }
        Ok(())
    }

    pub fn read<M: BackingMedium>(
        &self,
        map: &ClusterMap<M>,
        index: u64,
    ) -> Result<StreamRecord, StorageError> {
        self.check_index(index)?;
        if let Some(cache) = &self.cache {
            if let Some(record) = cache.lock().get(&index) {
                return Ok(record.clone());
            }
        }
        let size = self.layout.record_size();
        let mut buf = vec![0u8; size];
        let n = self
            .provider
            .lock()
            .read(map, index * size as u64, &mut buf)?;
        if n != size {
            return Err(StorageError::Corruption(format!(
                "record {} truncated to {} bytes",
                index, n
            )));
        }
        let record = self.layout.decode(&buf)?;
        if let Some(cache) = &self.cache {
            cache.lock().put(index, record.clone());
        }
        Ok(record)
    }

    /// Every record, in index order, read in one pass.
    pub fn read_all<M: BackingMedium>(
        &self,
        map: &ClusterMap<M>,
    ) -> Result<Vec<StreamRecord>, StorageError> {
        let size = self.layout.record_size();
        let mut buf = vec![0u8; self.byte_len() as usize];
        let n = self.provider.lock().read(map, 0, &mut buf)?;
        if n != buf.len() {
            return Err(StorageError::Corruption(format!(
                "record chain holds {} bytes, expected {}",
                n,
                buf.len()
            )));
        }
        buf.chunks(size).map(|chunk| self.layout.decode(chunk)).collect()
    }

    pub fn write<M: BackingMedium>(
        &self,
        map: &mut ClusterMap<M>,
        index: u64,
        record: &StreamRecord,
    ) -> Result<(), StorageError> {
        self.check_index(index)?;
        let bytes = self.layout.encode(record)?;
        self.provider
            .lock()
            .write(map, index * bytes.len() as u64, &bytes)?;
        if let Some(cache) = &self.cache {
            cache.lock().put(index, record.clone());
        }
        Ok(())
    }

    /// Grow or shrink the table to `count` records. New slots hold empty
    /// records.
    pub fn set_count<M, L>(
        &mut self,
        map: &mut ClusterMap<M>,
        count: u64,
        listener: &mut L,
    ) -> Result<(), StorageError>
    where
        M: BackingMedium,
        L: StreamListener<M> + ?Sized,
    {
        let old = self.count;
        let size = self.layout.record_size() as u64;
        let bytes = count.checked_mul(size).ok_or_else(|| {
            StorageError::OutOfBounds(format!("{} records overflow the record chain", count))
        })?;
        self.provider
            .get_mut()
            .set_total_bytes(map, bytes, listener)?;
        self.count = count;

        if count < old {
            if let Some(cache) = &self.cache {
                let mut cache = cache.lock();
                for index in count..old {
                    cache.pop(&index);
                }
            }
        } else {
            let empty = StreamRecord::empty(&self.layout);
            for index in old..count {
                self.write(map, index, &empty)?;
            }
        }
        Ok(())
    }

    pub fn apply_patches<M: BackingMedium>(
        &self,
        map: &mut ClusterMap<M>,
        patches: &[RecordPatch],
    ) -> Result<(), StorageError> {
        for patch in patches {
            let mut record = self.read(map, patch.index())?;
            patch.apply(&mut record);
            self.write(map, patch.index(), &record)?;
        }
        Ok(())
    }

    /// Forget the record chain after the cluster map has been cleared.
    pub fn reset(&mut self) {
        *self.provider.get_mut() = FragmentProvider::empty(NULL_CLUSTER, self.cluster_size);
        self.count = 0;
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }
}
