use crate::cluster::ClusterId;
use crate::cluster_map::ClusterMove;

/// Notifications delivered to an external `StorageObserver`.
///
/// Cluster-level variants mirror the cluster map events and arrive after
/// the storage has updated its own bookkeeping. Record-level variants are
/// sent once the façade operation has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    ClusterCountChanged { delta: i64, terminal: ClusterId },
    ChainCreated { terminal: ClusterId, start: ClusterId, end: ClusterId },
    ChainRemoved { terminal: ClusterId },
    ChainStartChanged { terminal: ClusterId, start: ClusterId },
    ChainEndChanged { terminal: ClusterId, end: ClusterId },
    ClusterMoved(ClusterMove),
    StreamLengthChanged { terminal: ClusterId, old_len: u64, new_len: u64 },
    RecordAdded(u64),
    RecordInserted(u64),
    RecordRemoved(u64),
    RecordsSwapped(u64, u64),
    Cleared,
}

/// Optional external listener attached with `ClusteredStorage::set_observer`.
pub trait StorageObserver {
    fn on_event(&mut self, event: &StorageEvent);
}

impl<F: FnMut(&StorageEvent)> StorageObserver for F {
    fn on_event(&mut self, event: &StorageEvent) {
        self(event)
    }
}
