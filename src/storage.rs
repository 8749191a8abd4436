use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::cluster::{ClusterId, ClusterTraits, NULL_CLUSTER};
use crate::cluster_map::{ClusterMap, ClusterMapListener, ClusterMove};
use crate::file_medium::FileMedium;
use crate::fragment_provider::{FragmentProvider, StreamListener};
use crate::header::{StorageHeader, StoragePolicy};
use crate::medium::{BackingMedium, OpenMode};
use crate::memory_medium::MemoryMedium;
use crate::observer::{StorageEvent, StorageObserver};
use crate::record::{key_checksum, RecordTraits, StreamRecord};
use crate::record_table::{RecordPatch, RecordTable};
use crate::scope::StreamScope;
use crate::serializer::ItemSerializer;
use crate::verify::{summarize_chains, verify_structure};
use crate::StorageError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_CLUSTER_SIZE: u32 = 4096;
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Options used when creating a storage.
///
/// Everything but `cache_capacity` is persisted in the header; when loading
/// an existing medium the header wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOptions {
    pub cluster_size: u32,
    pub policy: StoragePolicy,
    pub record_key_size: u16,
    pub reserved_records: u64,
    /// Entries per LRU cache enabled by the policy.
    pub cache_capacity: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        StorageOptions {
            cluster_size: DEFAULT_CLUSTER_SIZE,
            policy: StoragePolicy::CACHE_RECORDS,
            record_key_size: 0,
            reserved_records: 0,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl StorageOptions {
    fn validate(&self) -> Result<(), StorageError> {
        if self.cluster_size == 0 {
            return Err(StorageError::InvalidArgument(
                "cluster size must be non-zero".to_string(),
            ));
        }
        if self.record_key_size > 0 && !self.policy.contains(StoragePolicy::TRACK_KEY) {
            return Err(StorageError::InvalidArgument(
                "record key size requires the TRACK_KEY policy".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Per-record lock state.
#[derive(Default)]
struct LockState {
    readers: u32,
    has_writer: bool,
}

/// Bookkeeping of one open stream scope.
struct OpenScope {
    record_index: u64,
    mode: OpenMode,
    /// Traits and key as seen by the scope; persisted on close when dirty.
    snapshot: StreamRecord,
    dirty: bool,
    provider: Mutex<FragmentProvider>,
}

struct StorageCore<M: BackingMedium> {
    map: ClusterMap<M>,
    header: StorageHeader,
    records: RecordTable,
    scopes: HashMap<u64, OpenScope>,
    locks: HashMap<u64, LockState>,
    next_scope_id: u64,
    observer: Option<Box<dyn StorageObserver + Send + Sync>>,
    suppress_events: bool,
}

// ---------------------------------------------------------------------------
// Event routing
// ---------------------------------------------------------------------------

/// Dispatches cluster map events to everything that caches cluster ids.
///
/// For each event, in order: the header's cluster count and record chain
/// end are updated, the record chain's provider is corrected, a record patch
/// is queued for the owning record, every open scope's provider is
/// corrected, and finally the external observer is told. Patches are applied
/// once the map call returns, when the record chain is readable again.
struct EventRouter<'a> {
    header: &'a mut StorageHeader,
    records_chain: Option<&'a mut FragmentProvider>,
    scopes: &'a mut HashMap<u64, OpenScope>,
    patches: &'a mut Vec<RecordPatch>,
    observer: Option<&'a mut Box<dyn StorageObserver + Send + Sync>>,
}

fn record_index(terminal: ClusterId) -> Option<u64> {
    if terminal >= 0 {
        Some(terminal as u64)
    } else {
        None
    }
}

impl EventRouter<'_> {
    fn forward<M, F>(&mut self, map: &mut ClusterMap<M>, mut f: F) -> Result<(), StorageError>
    where
        M: BackingMedium,
        F: FnMut(&mut FragmentProvider, &mut ClusterMap<M>) -> Result<(), StorageError>,
    {
        if let Some(records) = self.records_chain.as_deref_mut() {
            f(records, map)?;
        }
        for scope in self.scopes.values_mut() {
            f(scope.provider.get_mut(), map)?;
        }
        Ok(())
    }

    fn notify(&mut self, event: StorageEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_event(&event);
        }
    }

    fn set_records_end<M: BackingMedium>(
        &mut self,
        map: &ClusterMap<M>,
        end: ClusterId,
    ) -> Result<(), StorageError> {
        self.header.set_records_end_cluster(map.medium(), end)
    }
}

impl<M: BackingMedium> ClusterMapListener<M> for EventRouter<'_> {
    fn cluster_count_changed(
        &mut self,
        map: &mut ClusterMap<M>,
        delta: i64,
        terminal: ClusterId,
    ) -> Result<(), StorageError> {
        self.header
            .set_total_clusters(map.medium(), map.cluster_count())?;
        self.forward(map, |p, map| p.cluster_count_changed(map, delta, terminal))?;
        self.notify(StorageEvent::ClusterCountChanged { delta, terminal });
        Ok(())
    }

    fn chain_created(
        &mut self,
        map: &mut ClusterMap<M>,
        terminal: ClusterId,
        start: ClusterId,
        end: ClusterId,
    ) -> Result<(), StorageError> {
        if terminal == NULL_CLUSTER {
            self.set_records_end(map, end)?;
        }
        self.forward(map, |p, map| p.chain_created(map, terminal, start, end))?;
        if let Some(index) = record_index(terminal) {
            self.patches.push(RecordPatch::Bounds { index, start, end });
        }
        self.notify(StorageEvent::ChainCreated {
            terminal,
            start,
            end,
        });
        Ok(())
    }

    fn chain_removed(&mut self, map: &mut ClusterMap<M>, terminal: ClusterId) -> Result<(), StorageError> {
        if terminal == NULL_CLUSTER {
            self.set_records_end(map, NULL_CLUSTER)?;
        }
        self.forward(map, |p, map| p.chain_removed(map, terminal))?;
        if let Some(index) = record_index(terminal) {
            self.patches.push(RecordPatch::Bounds {
                index,
                start: NULL_CLUSTER,
                end: NULL_CLUSTER,
            });
        }
        self.notify(StorageEvent::ChainRemoved { terminal });
        Ok(())
    }

    fn chain_start_changed(
        &mut self,
        map: &mut ClusterMap<M>,
        terminal: ClusterId,
        start: ClusterId,
    ) -> Result<(), StorageError> {
        self.forward(map, |p, map| p.chain_start_changed(map, terminal, start))?;
        if let Some(index) = record_index(terminal) {
            self.patches.push(RecordPatch::Start { index, start });
        }
        self.notify(StorageEvent::ChainStartChanged { terminal, start });
        Ok(())
    }

    fn chain_end_changed(
        &mut self,
        map: &mut ClusterMap<M>,
        terminal: ClusterId,
        end: ClusterId,
    ) -> Result<(), StorageError> {
        if terminal == NULL_CLUSTER {
            self.set_records_end(map, end)?;
        }
        self.forward(map, |p, map| p.chain_end_changed(map, terminal, end))?;
        if let Some(index) = record_index(terminal) {
            self.patches.push(RecordPatch::End { index, end });
        }
        self.notify(StorageEvent::ChainEndChanged { terminal, end });
        Ok(())
    }

    fn cluster_moved(&mut self, map: &mut ClusterMap<M>, moved: &ClusterMove) -> Result<(), StorageError> {
        if moved.terminal == Some(NULL_CLUSTER) && moved.traits.contains(ClusterTraits::END) {
            self.set_records_end(map, moved.to)?;
        }
        self.forward(map, |p, map| p.cluster_moved(map, moved))?;
        if let Some(index) = moved.terminal.and_then(record_index) {
            if moved.traits.contains(ClusterTraits::START) {
                self.patches.push(RecordPatch::Start {
                    index,
                    start: moved.to,
                });
            }
            if moved.traits.contains(ClusterTraits::END) {
                self.patches.push(RecordPatch::End {
                    index,
                    end: moved.to,
                });
            }
        }
        self.notify(StorageEvent::ClusterMoved(*moved));
        Ok(())
    }
}

impl<M: BackingMedium> StreamListener<M> for EventRouter<'_> {
    fn stream_length_changed(
        &mut self,
        _map: &mut ClusterMap<M>,
        terminal: ClusterId,
        old_len: u64,
        new_len: u64,
    ) -> Result<(), StorageError> {
        if let Some(index) = record_index(terminal) {
            self.patches.push(RecordPatch::Size {
                index,
                size: new_len,
            });
        }
        self.notify(StorageEvent::StreamLengthChanged {
            terminal,
            old_len,
            new_len,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Core operations (caller holds the write lock)
// ---------------------------------------------------------------------------

impl<M: BackingMedium> StorageCore<M> {
    /// Run a cluster map operation with the record chain routed like any
    /// other listener, then apply the queued record patches.
    fn route<R>(
        &mut self,
        op: impl FnOnce(&mut ClusterMap<M>, &mut EventRouter<'_>) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut patches = Vec::new();
        let value = {
            let StorageCore {
                map,
                header,
                records,
                scopes,
                observer,
                suppress_events,
                ..
            } = self;
            let mut router = EventRouter {
                header,
                records_chain: Some(records.provider_mut()),
                scopes,
                patches: &mut patches,
                observer: if *suppress_events { None } else { observer.as_mut() },
            };
            op(map, &mut router)?
        };
        self.records.apply_patches(&mut self.map, &patches)?;
        Ok(value)
    }

    /// Like `route`, for operations that resize the record chain itself.
    fn route_records<R>(
        &mut self,
        op: impl FnOnce(&mut ClusterMap<M>, &mut RecordTable, &mut EventRouter<'_>) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut patches = Vec::new();
        let value = {
            let StorageCore {
                map,
                header,
                records,
                scopes,
                observer,
                suppress_events,
                ..
            } = self;
            let mut router = EventRouter {
                header,
                records_chain: None,
                scopes,
                patches: &mut patches,
                observer: if *suppress_events { None } else { observer.as_mut() },
            };
            op(map, records, &mut router)?
        };
        self.records.apply_patches(&mut self.map, &patches)?;
        Ok(value)
    }

    fn notify(&mut self, event: StorageEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_event(&event);
        }
    }

    /// Run `op` with cluster-level observer events suppressed. The flag is
    /// restored whatever `op` returns.
    fn with_events_suppressed<R>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let previous = std::mem::replace(&mut self.suppress_events, true);
        let result = op(self);
        self.suppress_events = previous;
        result
    }

    fn ensure_no_scopes(&self, operation: &str) -> Result<(), StorageError> {
        if !self.scopes.is_empty() {
            return Err(StorageError::ScopesOpen(format!(
                "cannot {} while {} scope(s) are open",
                operation,
                self.scopes.len()
            )));
        }
        Ok(())
    }

    fn check_record_index(&self, index: u64) -> Result<(), StorageError> {
        if index >= self.records.count() {
            return Err(StorageError::OutOfBounds(format!(
                "record index {} out of range ({} records)",
                index,
                self.records.count()
            )));
        }
        Ok(())
    }

    fn resize_records(&mut self, count: u64) -> Result<(), StorageError> {
        self.route_records(|map, records, router| records.set_count(map, count, router))?;
        self.header.set_records_count(self.map.medium(), count)
    }

    /// Resize the stream of an open scope. The scope is detached while its
    /// own provider drives the change, so it only sees events once.
    fn resize_scope(&mut self, scope_id: u64, new_len: u64) -> Result<(), StorageError> {
        let mut scope = self
            .scopes
            .remove(&scope_id)
            .ok_or_else(|| StorageError::NotFound(format!("scope {}", scope_id)))?;
        let result = self.route(|map, router| {
            scope
                .provider
                .get_mut()
                .set_total_bytes(map, new_len, router)
        });
        self.scopes.insert(scope_id, scope);
        result
    }

    /// Release every cluster of record `index`.
    fn release_chain(&mut self, index: u64) -> Result<(), StorageError> {
        let record = self.records.read(&self.map, index)?;
        if record.is_empty() {
            return Ok(());
        }
        let end = self.map.links(record.end)?;
        if !end.is_end() || end.next != index as ClusterId {
            return Err(StorageError::Corruption(format!(
                "record {} ends at cluster {} which does not end its chain",
                index, record.end
            )));
        }
        let expected = self.map.calculate_cluster_chain_length(record.size);
        let removed = self.route(|map, router| map.remove_backwards(record.end, expected, router))?;
        if removed != expected {
            return Err(StorageError::Corruption(format!(
                "record {} released {} clusters, expected {}",
                index, removed, expected
            )));
        }
        Ok(())
    }

    /// Copy record `from` into slot `to` and renumber its chain's terminal.
    fn move_record(&mut self, from: u64, to: u64) -> Result<(), StorageError> {
        let record = self.records.read(&self.map, from)?;
        self.records.write(&mut self.map, to, &record)?;
        if !record.is_empty() {
            self.map
                .set_chain_terminal(record.start, record.end, to as ClusterId)?;
        }
        Ok(())
    }

    fn acquire_lock(&mut self, index: u64, mode: OpenMode) -> Result<(), StorageError> {
        let lock = self.locks.entry(index).or_default();
        let granted = match mode {
            OpenMode::Read => !lock.has_writer,
            OpenMode::Write => !lock.has_writer && lock.readers == 0,
        };
        if !granted {
            if lock.readers == 0 && !lock.has_writer {
                self.locks.remove(&index);
            }
            return Err(StorageError::LockConflict(format!(
                "lock conflict on record {}",
                index
            )));
        }
        match mode {
            OpenMode::Read => lock.readers += 1,
            OpenMode::Write => lock.has_writer = true,
        }
        Ok(())
    }

    fn release_lock(&mut self, index: u64, mode: OpenMode) {
        if let Some(lock) = self.locks.get_mut(&index) {
            match mode {
                OpenMode::Read => lock.readers = lock.readers.saturating_sub(1),
                OpenMode::Write => lock.has_writer = false,
            }
            if lock.readers == 0 && !lock.has_writer {
                self.locks.remove(&index);
            }
        }
    }

    fn open_scope(&mut self, index: u64, mode: OpenMode) -> Result<u64, StorageError> {
        self.check_record_index(index)?;
        self.acquire_lock(index, mode)?;
        let record = match self.records.read(&self.map, index) {
            Ok(record) => record,
            Err(e) => {
                self.release_lock(index, mode);
                return Err(e);
            }
        };
        let provider = FragmentProvider::attach(
            index as ClusterId,
            record.start,
            record.end,
            record.size,
            self.map.cluster_size(),
        );

        let scope_id = self.next_scope_id;
        self.next_scope_id += 1;
        self.scopes.insert(
            scope_id,
            OpenScope {
                record_index: index,
                mode,
                snapshot: record,
                dirty: false,
                provider: Mutex::new(provider),
            },
        );
        debug!(index, scope = scope_id, ?mode, "opened scope");
        Ok(scope_id)
    }

    fn scope(&self, scope_id: u64) -> Result<&OpenScope, StorageError> {
        self.scopes
            .get(&scope_id)
            .ok_or_else(|| StorageError::NotFound(format!("scope {}", scope_id)))
    }

    fn writable_scope(&mut self, scope_id: u64) -> Result<&mut OpenScope, StorageError> {
        let scope = self
            .scopes
            .get_mut(&scope_id)
            .ok_or_else(|| StorageError::NotFound(format!("scope {}", scope_id)))?;
        if scope.mode != OpenMode::Write {
            return Err(StorageError::ReadOnly(format!(
                "scope on record {} was opened for reading",
                scope.record_index
            )));
        }
        Ok(scope)
    }

    /// Structural issues plus header-level consistency checks.
    fn verify_issues(&self) -> Result<Vec<String>, StorageError> {
        let clusters = self.map.clusters()?;
        let records = self.records.read_all(&self.map)?;
        let mut issues = verify_structure(&clusters, Some(records.as_slice()));

        if self.header.total_clusters != self.map.cluster_count() {
            issues.push(format!(
                "header counts {} clusters but the map holds {}",
                self.header.total_clusters,
                self.map.cluster_count()
            ));
        }
        if self.header.records_count != self.records.count() {
            issues.push(format!(
                "header counts {} records but the table holds {}",
                self.header.records_count,
                self.records.count()
            ));
        }
        let expected = self.map.calculate_cluster_chain_length(self.records.byte_len());
        match summarize_chains(&clusters).get(&NULL_CLUSTER) {
            Some(chain) => {
                if chain.end != self.header.records_end_cluster {
                    issues.push(format!(
                        "record chain ends at {} but the header says {}",
                        chain.end, self.header.records_end_cluster
                    ));
                }
                if chain.length != expected {
                    issues.push(format!(
                        "record chain holds {} clusters, expected {}",
                        chain.length, expected
                    ));
                }
            }
            None => {
                if expected != 0 || self.header.records_end_cluster != NULL_CLUSTER {
                    issues.push("record chain is missing".to_string());
                }
            }
        }
        Ok(issues)
    }

    fn check_integrity(&self) -> Result<(), StorageError> {
        let issues = self.verify_issues()?;
        if issues.is_empty() {
            Ok(())
        } else {
            Err(StorageError::Integrity(issues))
        }
    }

    fn check_integrity_if_enabled(&self) -> Result<(), StorageError> {
        if self.header.policy.contains(StoragePolicy::INTEGRITY_CHECKS) {
            self.check_integrity()?;
        }
        Ok(())
    }
}

/// Copy the scope-owned fields of `snapshot` over a live record.
fn overlay(record: &mut StreamRecord, snapshot: &StreamRecord) {
    record.traits = snapshot.traits;
    record.key_checksum = snapshot.key_checksum;
    record.key.clone_from(&snapshot.key);
}

// ---------------------------------------------------------------------------
// ClusteredStorage
// ---------------------------------------------------------------------------

/// Many independently resizable byte streams multiplexed over one medium.
///
/// All methods take `&self`. Non-structural reads share a read lock; every
/// mutation takes the write lock. `insert`, `remove`, `swap` and `clear`
/// also require that no stream scope is open.
pub struct ClusteredStorage<M: BackingMedium> {
    core: RwLock<StorageCore<M>>,
}

impl ClusteredStorage<MemoryMedium> {
    /// A fresh storage held in memory.
    pub fn in_memory(options: StorageOptions) -> Result<Self, StorageError> {
        Self::load(MemoryMedium::new(), options)
    }
}

impl ClusteredStorage<FileMedium> {
    /// Create a new storage file. Fails if `path` exists.
    pub fn create_file<P: AsRef<Path>>(path: P, options: StorageOptions) -> Result<Self, StorageError> {
        Self::load(FileMedium::create(path)?, options)
    }

    /// Open an existing storage file.
    pub fn open_file<P: AsRef<Path>>(
        path: P,
        mode: OpenMode,
        options: StorageOptions,
    ) -> Result<Self, StorageError> {
        let medium = FileMedium::open(path, mode)?;
        if medium.is_empty()? {
            return Err(StorageError::Corruption(
                "storage file is empty".to_string(),
            ));
        }
        Self::load(medium, options)
    }
}

impl<M: BackingMedium> ClusteredStorage<M> {
    /// Attach to `medium`, writing a fresh header when it is empty.
    pub fn load(medium: M, options: StorageOptions) -> Result<Self, StorageError> {
        let fresh = medium.is_empty()?;
        let header = if fresh {
            options.validate()?;
            let header = StorageHeader::new(
                options.policy,
                options.cluster_size,
                options.record_key_size,
                options.reserved_records,
            );
            header.store(&medium)?;
            header
        } else {
            StorageHeader::load(&medium)?
        };

        let capacity = NonZeroUsize::new(options.cache_capacity);
        let link_cache = if header
            .policy
            .intersects(StoragePolicy::CACHE_RECORD_CLUSTERS | StoragePolicy::CACHE_OPEN_CLUSTERS)
        {
            capacity
        } else {
            None
        };
        let record_cache = if header.policy.contains(StoragePolicy::CACHE_RECORDS) {
            capacity
        } else {
            None
        };

        let map = ClusterMap::attach(
            medium,
            header.cluster_size as usize,
            header.total_clusters,
            link_cache,
        )?;
        let records = RecordTable::attach(&map, &header, record_cache)?;
        let mut core = StorageCore {
            map,
            header,
            records,
            scopes: HashMap::new(),
            locks: HashMap::new(),
            next_scope_id: 0,
            observer: None,
            suppress_events: false,
        };
        if fresh && core.header.reserved_records > 0 {
            let reserved = core.header.reserved_records;
            core.resize_records(reserved)?;
        }
        debug!(
            fresh,
            cluster_size = core.header.cluster_size,
            records = core.records.count(),
            clusters = core.map.cluster_count(),
            "loaded clustered storage"
        );
        Ok(ClusteredStorage {
            core: RwLock::new(core),
        })
    }

    /// Flush the medium and hand it back.
    pub fn into_medium(self) -> Result<M, StorageError> {
        let core = self.core.into_inner();
        core.map.medium().flush()?;
        Ok(core.map.into_medium())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.core.read().map.medium().flush()
    }

    // -- queries ------------------------------------------------------------

    /// Number of records.
    pub fn count(&self) -> u64 {
        self.core.read().records.count()
    }

    pub fn record(&self, index: u64) -> Result<StreamRecord, StorageError> {
        let core = self.core.read();
        core.records.read(&core.map, index)
    }

    pub fn header(&self) -> StorageHeader {
        self.core.read().header.clone()
    }

    pub fn policy(&self) -> StoragePolicy {
        self.core.read().header.policy
    }

    pub fn cluster_size(&self) -> usize {
        self.core.read().map.cluster_size()
    }

    pub fn cluster_count(&self) -> u64 {
        self.core.read().map.cluster_count()
    }

    pub fn open_scope_count(&self) -> usize {
        self.core.read().scopes.len()
    }

    pub fn merkle_root(&self) -> [u8; 32] {
        self.core.read().header.merkle_root
    }

    pub fn set_merkle_root(&self, root: [u8; 32]) -> Result<(), StorageError> {
        let mut core = self.core.write();
        let core = &mut *core;
        core.header.set_merkle_root(core.map.medium(), root)
    }

    pub fn master_key(&self) -> [u8; 32] {
        self.core.read().header.master_key
    }

    pub fn set_master_key(&self, key: [u8; 32]) -> Result<(), StorageError> {
        let mut core = self.core.write();
        let core = &mut *core;
        core.header.set_master_key(core.map.medium(), key)
    }

    /// Attach or detach the external observer.
    pub fn set_observer(&self, observer: Option<Box<dyn StorageObserver + Send + Sync>>) {
        self.core.write().observer = observer;
    }

    /// Run the diagnostics verifier. An empty list means no issues.
    pub fn verify(&self) -> Result<Vec<String>, StorageError> {
        self.core.read().verify_issues()
    }

    /// `verify`, failing with `StorageError::Integrity` on any issue.
    pub fn check_integrity(&self) -> Result<(), StorageError> {
        self.core.read().check_integrity()
    }

    /// Compaction is not supported.
    pub fn optimize(&self) -> Result<(), StorageError> {
        Err(StorageError::Unsupported(
            "cluster compaction is not implemented".to_string(),
        ))
    }

    // -- structural operations ---------------------------------------------

    /// Append an empty record and open it for writing.
    pub fn add(&self) -> Result<StreamScope<'_, M>, StorageError> {
        let mut core = self.core.write();
        let index = core.records.count();
        core.resize_records(index + 1)?;
        let used = StreamRecord::used(core.records.layout());
        {
            let core = &mut *core;
            core.records.write(&mut core.map, index, &used)?;
        }
        core.notify(StorageEvent::RecordAdded(index));
        debug!(index, clusters = core.map.cluster_count(), "added record");
        core.check_integrity_if_enabled()?;
        let scope_id = core.open_scope(index, OpenMode::Write)?;
        Ok(StreamScope::new(self, scope_id, index, OpenMode::Write))
    }

    pub fn open_read(&self, index: u64) -> Result<StreamScope<'_, M>, StorageError> {
        self.open(index, OpenMode::Read)
    }

    pub fn open_write(&self, index: u64) -> Result<StreamScope<'_, M>, StorageError> {
        self.open(index, OpenMode::Write)
    }

    /// Open record `index` in the given mode. A writer excludes every other
    /// scope on the record; readers exclude writers.
    pub fn open(&self, index: u64, mode: OpenMode) -> Result<StreamScope<'_, M>, StorageError> {
        let scope_id = self.core.write().open_scope(index, mode)?;
        Ok(StreamScope::new(self, scope_id, index, mode))
    }

    /// Insert an empty record at `index`, shifting later records up by one,
    /// and open it for writing. Costs one terminal renumbering per shifted
    /// record.
    pub fn insert(&self, index: u64) -> Result<StreamScope<'_, M>, StorageError> {
        let mut core = self.core.write();
        core.ensure_no_scopes("insert")?;
        let count = core.records.count();
        if index > count {
            return Err(StorageError::OutOfBounds(format!(
                "insert index {} beyond {} records",
                index, count
            )));
        }
        if index < core.header.reserved_records {
            return Err(StorageError::InvalidArgument(format!(
                "cannot insert at {}: the first {} records are reserved",
                index, core.header.reserved_records
            )));
        }

        core.with_events_suppressed(|core| {
            core.resize_records(count + 1)?;
            for i in (index..count).rev() {
                core.move_record(i, i + 1)?;
            }
            let used = StreamRecord::used(core.records.layout());
            core.records.write(&mut core.map, index, &used)
        })?;
        core.notify(StorageEvent::RecordInserted(index));
        debug!(index, records = count + 1, "inserted record");
        core.check_integrity_if_enabled()?;
        let scope_id = core.open_scope(index, OpenMode::Write)?;
        Ok(StreamScope::new(self, scope_id, index, OpenMode::Write))
    }

    /// Delete record `index` and its chain, shifting later records down.
    pub fn remove(&self, index: u64) -> Result<(), StorageError> {
        let mut core = self.core.write();
        core.ensure_no_scopes("remove")?;
        core.check_record_index(index)?;
        if index < core.header.reserved_records {
            return Err(StorageError::InvalidArgument(format!(
                "record {} is reserved",
                index
            )));
        }
        let count = core.records.count();
        let clusters_before = core.map.cluster_count();

        core.with_events_suppressed(|core| {
            core.release_chain(index)?;
            for i in index + 1..count {
                core.move_record(i, i - 1)?;
            }
            core.resize_records(count - 1)
        })?;
        core.notify(StorageEvent::RecordRemoved(index));
        debug!(
            index,
            released = clusters_before as i64 - core.map.cluster_count() as i64,
            "removed record"
        );
        core.check_integrity_if_enabled()
    }

    /// Exchange records `a` and `b`, repointing both chains' terminals.
    pub fn swap(&self, a: u64, b: u64) -> Result<(), StorageError> {
        let mut core = self.core.write();
        core.ensure_no_scopes("swap")?;
        core.check_record_index(a)?;
        core.check_record_index(b)?;
        if a == b {
            return Ok(());
        }

        core.with_events_suppressed(|core| {
            let ra = core.records.read(&core.map, a)?;
            let rb = core.records.read(&core.map, b)?;
            core.records.write(&mut core.map, a, &rb)?;
            core.records.write(&mut core.map, b, &ra)?;
            if !rb.is_empty() {
                core.map.set_chain_terminal(rb.start, rb.end, a as ClusterId)?;
            }
            if !ra.is_empty() {
                core.map.set_chain_terminal(ra.start, ra.end, b as ClusterId)?;
            }
            Ok(())
        })?;
        core.notify(StorageEvent::RecordsSwapped(a, b));
        debug!(a, b, "swapped records");
        core.check_integrity_if_enabled()
    }

    /// Drop every record and cluster. Reserved records are recreated empty.
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut core = self.core.write();
        core.ensure_no_scopes("clear")?;

        core.with_events_suppressed(|core| {
            core.map.clear()?;
            core.records.reset();
            let medium = core.map.medium();
            core.header.set_total_clusters(medium, 0)?;
            core.header.set_records_end_cluster(medium, NULL_CLUSTER)?;
            core.header.set_records_count(medium, 0)?;
            let reserved = core.header.reserved_records;
            if reserved > 0 {
                core.resize_records(reserved)?;
            }
            Ok(())
        })?;
        core.notify(StorageEvent::Cleared);
        debug!(records = core.records.count(), "cleared storage");
        core.check_integrity_if_enabled()
    }

    // -- item helpers -------------------------------------------------------

    /// Serialize `item` into record `index`; `None` stores a null record.
    pub fn save_item<T, S: ItemSerializer<T>>(
        &self,
        index: u64,
        item: Option<&T>,
        serializer: &S,
    ) -> Result<(), StorageError> {
        let mut scope = self.open_write(index)?;
        self.write_item(&mut scope, item, serializer)?;
        scope.close()
    }

    /// Deserialize record `index`; a null record loads as `None`.
    pub fn load_item<T, S: ItemSerializer<T>>(
        &self,
        index: u64,
        serializer: &S,
    ) -> Result<Option<T>, StorageError> {
        let mut scope = self.open_read(index)?;
        let item = Self::read_item(&mut scope, serializer)?;
        scope.close()?;
        Ok(item)
    }

    /// Append a record holding `item`. Returns its index.
    pub fn add_item<T, S: ItemSerializer<T>>(
        &self,
        item: Option<&T>,
        serializer: &S,
    ) -> Result<u64, StorageError> {
        let mut scope = self.add()?;
        let index = scope.index();
        self.write_item(&mut scope, item, serializer)?;
        scope.close()?;
        Ok(index)
    }

    /// `save_item`, leaving the write scope open for further changes.
    pub fn enter_save_item_scope<T, S: ItemSerializer<T>>(
        &self,
        index: u64,
        item: Option<&T>,
        serializer: &S,
    ) -> Result<StreamScope<'_, M>, StorageError> {
        let mut scope = self.open_write(index)?;
        self.write_item(&mut scope, item, serializer)?;
        Ok(scope)
    }

    /// `load_item`, also returning the still open read scope.
    pub fn enter_load_item_scope<T, S: ItemSerializer<T>>(
        &self,
        index: u64,
        serializer: &S,
    ) -> Result<(Option<T>, StreamScope<'_, M>), StorageError> {
        let mut scope = self.open_read(index)?;
        let item = Self::read_item(&mut scope, serializer)?;
        Ok((item, scope))
    }

    fn write_item<T, S: ItemSerializer<T>>(
        &self,
        scope: &mut StreamScope<'_, M>,
        item: Option<&T>,
        serializer: &S,
    ) -> Result<(), StorageError> {
        match item {
            None => {
                scope.set_len(0)?;
                scope.set_null(true)
            }
            Some(item) => {
                let bytes = serializer.serialize(item)?;
                if self.policy().contains(StoragePolicy::FAST_ALLOCATE) {
                    scope.set_len(bytes.len() as u64)?;
                } else {
                    scope.set_len(0)?;
                }
                scope.write_at(0, &bytes)?;
                scope.set_null(false)
            }
        }
    }

    fn read_item<T, S: ItemSerializer<T>>(
        scope: &mut StreamScope<'_, M>,
        serializer: &S,
    ) -> Result<Option<T>, StorageError> {
        if scope.record()?.is_null() {
            return Ok(None);
        }
        let bytes = scope.read_to_vec()?;
        serializer.deserialize(&bytes).map(Some)
    }

    // -- scope plumbing -----------------------------------------------------

    pub(crate) fn scope_read(
        &self,
        scope_id: u64,
        position: u64,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        let core = self.core.read();
        let scope = core.scope(scope_id)?;
        let mut provider = scope.provider.lock();
        provider.read(&core.map, position, buf)
    }

    pub(crate) fn scope_write(
        &self,
        scope_id: u64,
        position: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let mut core = self.core.write();
        let len = core.writable_scope(scope_id)?.provider.get_mut().total_bytes();
        let end = position.checked_add(data.len() as u64).ok_or_else(|| {
            StorageError::OutOfBounds(format!(
                "write of {} bytes at {} overflows the stream offset",
                data.len(),
                position
            ))
        })?;
        if end > len {
            core.resize_scope(scope_id, end)?;
        }
        let core = &mut *core;
        let scope = core
            .scopes
            .get_mut(&scope_id)
            .ok_or_else(|| StorageError::NotFound(format!("scope {}", scope_id)))?;
        scope.provider.get_mut().write(&mut core.map, position, data)
    }

    pub(crate) fn scope_len(&self, scope_id: u64) -> Result<u64, StorageError> {
        let core = self.core.read();
        let len = core.scope(scope_id)?.provider.lock().total_bytes();
        Ok(len)
    }

    pub(crate) fn scope_set_len(&self, scope_id: u64, len: u64) -> Result<(), StorageError> {
        let mut core = self.core.write();
        core.writable_scope(scope_id)?;
        core.resize_scope(scope_id, len)
    }

    /// The live record of a scope with the scope's pending traits and key.
    pub(crate) fn scope_record(&self, scope_id: u64) -> Result<StreamRecord, StorageError> {
        let core = self.core.read();
        let scope = core.scope(scope_id)?;
        let mut record = core.records.read(&core.map, scope.record_index)?;
        overlay(&mut record, &scope.snapshot);
        Ok(record)
    }

    pub(crate) fn scope_set_key(&self, scope_id: u64, key: &[u8]) -> Result<(), StorageError> {
        let mut core = self.core.write();
        let layout = *core.records.layout();
        if layout.key_size == 0 {
            return Err(StorageError::Unsupported(
                "storage does not track record keys".to_string(),
            ));
        }
        if key.len() != layout.key_size {
            return Err(StorageError::InvalidArgument(format!(
                "key is {} bytes, records hold {}",
                key.len(),
                layout.key_size
            )));
        }
        let scope = core.writable_scope(scope_id)?;
        scope.snapshot.key = key.to_vec();
        if layout.track_checksums {
            scope.snapshot.key_checksum = key_checksum(key);
        }
        scope.dirty = true;
        Ok(())
    }

    pub(crate) fn scope_set_key_checksum(&self, scope_id: u64, checksum: u32) -> Result<(), StorageError> {
        let mut core = self.core.write();
        if !core.records.layout().track_checksums {
            return Err(StorageError::Unsupported(
                "storage does not track key checksums".to_string(),
            ));
        }
        let scope = core.writable_scope(scope_id)?;
        scope.snapshot.key_checksum = checksum;
        scope.dirty = true;
        Ok(())
    }

    pub(crate) fn scope_set_null(&self, scope_id: u64, null: bool) -> Result<(), StorageError> {
        let mut core = self.core.write();
        let scope = core.writable_scope(scope_id)?;
        if scope.snapshot.traits.contains(RecordTraits::IS_NULL) != null {
            scope.snapshot.traits.set(RecordTraits::IS_NULL, null);
            scope.dirty = true;
        }
        Ok(())
    }

    /// Unregister a scope, persisting its snapshot when it was writable.
    pub(crate) fn close_scope(&self, scope_id: u64) -> Result<(), StorageError> {
        let mut core = self.core.write();
        let scope = core
            .scopes
            .remove(&scope_id)
            .ok_or_else(|| StorageError::NotFound(format!("scope {}", scope_id)))?;
        core.release_lock(scope.record_index, scope.mode);

        if scope.mode == OpenMode::Write {
            if scope.dirty {
                let core = &mut *core;
                let mut record = core.records.read(&core.map, scope.record_index)?;
                overlay(&mut record, &scope.snapshot);
                core.records.write(&mut core.map, scope.record_index, &record)?;
            }
            core.check_integrity_if_enabled()?;
        }
        debug!(
            index = scope.record_index,
            scope = scope_id,
            "closed scope"
        );
        Ok(())
    }
}

