use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::cluster::{Cluster, ClusterId, ClusterLinks, ClusterTraits, CLUSTER_HEADER_SIZE, NULL_CLUSTER};
use crate::header::HEADER_SIZE;
use crate::medium::BackingMedium;
use crate::StorageError;

/// A cluster relocated by tip substitution: the physical tail cluster `from`
/// now lives at `to`. `terminal` is set when the moved cluster is a chain
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterMove {
    pub from: ClusterId,
    pub to: ClusterId,
    pub traits: ClusterTraits,
    pub terminal: Option<ClusterId>,
}

/// Receiver of cluster map change notifications.
///
/// Every structural change of the map is reported synchronously, in the
/// order it happens, with enough data to correct cached cluster ids without
/// rescanning. The map itself is passed back so a listener can read or write
/// cluster payloads while handling the event; it must not change structure.
///
/// All methods default to no-ops.
pub trait ClusterMapListener<M: BackingMedium> {
    /// The number of clusters owned by the chain `terminal` changed by `delta`.
    fn cluster_count_changed(
        &mut self,
        map: &mut ClusterMap<M>,
        delta: i64,
        terminal: ClusterId,
    ) -> Result<(), StorageError> {
        let _ = (map, delta, terminal);
        Ok(())
    }

    fn chain_created(
        &mut self,
        map: &mut ClusterMap<M>,
        terminal: ClusterId,
        start: ClusterId,
        end: ClusterId,
    ) -> Result<(), StorageError> {
        let _ = (map, terminal, start, end);
        Ok(())
    }

    fn chain_removed(
        &mut self,
        map: &mut ClusterMap<M>,
        terminal: ClusterId,
    ) -> Result<(), StorageError> {
        let _ = (map, terminal);
        Ok(())
    }

    fn chain_start_changed(
        &mut self,
        map: &mut ClusterMap<M>,
        terminal: ClusterId,
        start: ClusterId,
    ) -> Result<(), StorageError> {
        let _ = (map, terminal, start);
        Ok(())
    }

    fn chain_end_changed(
        &mut self,
        map: &mut ClusterMap<M>,
        terminal: ClusterId,
        end: ClusterId,
    ) -> Result<(), StorageError> {
        let _ = (map, terminal, end);
        Ok(())
    }

    fn cluster_moved(
        &mut self,
        map: &mut ClusterMap<M>,
        moved: &ClusterMove,
    ) -> Result<(), StorageError> {
        let _ = (map, moved);
        Ok(())
    }
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl<M: BackingMedium> ClusterMapListener<M> for NoopListener {}

/// Owner of the flat cluster array stored after the header.
///
/// Cluster `n` lives at `HEADER_SIZE + n * (CLUSTER_HEADER_SIZE + cluster_size)`.
/// Clusters are only ever appended at, and released from, the physical tail
/// of the array. Removing a cluster elsewhere relocates the tail cluster into
/// the freed slot (tip substitution) and reports the move to the listener.
pub struct ClusterMap<M: BackingMedium> {
    medium: M,
    cluster_size: usize,
    count: u64,
    /// Optional write-through LRU cache of cluster link headers.
    link_cache: Option<Mutex<LruCache<ClusterId, ClusterLinks>>>,
}

impl<M: BackingMedium> ClusterMap<M> {
    /// Attach to a medium that already holds `cluster_count` clusters.
    pub fn attach(
        medium: M,
        cluster_size: usize,
        cluster_count: u64,
        link_cache_capacity: Option<NonZeroUsize>,
    ) -> Result<Self, StorageError> {
        if cluster_size == 0 {
            return Err(StorageError::InvalidArgument(
                "cluster size must be non-zero".to_string(),
            ));
        }
        let map = ClusterMap {
            medium,
            cluster_size,
            count: cluster_count,
            link_cache: link_cache_capacity.map(|cap| Mutex::new(LruCache::new(cap))),
        };
        let expected = map.array_end(cluster_count).ok_or_else(|| {
            StorageError::Corruption(format!(
                "cluster count {} exceeds the addressable medium",
                cluster_count
            ))
        })?;
        let len = map.medium.len()?;
        if len < expected {
            return Err(StorageError::Corruption(format!(
                "medium holds {} bytes but {} clusters need {}",
                len, cluster_count, expected
            )));
        }
        Ok(map)
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn into_medium(self) -> M {
        self.medium
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Total number of clusters in the array.
    pub fn cluster_count(&self) -> u64 {
        self.count
    }

    /// Number of clusters needed to hold `byte_length` bytes.
    pub fn calculate_cluster_chain_length(&self, byte_length: u64) -> u64 {
        byte_length.div_ceil(self.cluster_size as u64)
    }

    pub fn contains(&self, id: ClusterId) -> bool {
        id >= 0 && (id as u64) < self.count
    }

    fn stride(&self) -> u64 {
        (CLUSTER_HEADER_SIZE + self.cluster_size) as u64
    }

    /// Offset of cluster `id`. Only valid for `id <= count`, whose array end
    /// was range-checked by `attach` or `allocate`.
    fn offset_of(&self, id: ClusterId) -> u64 {
        HEADER_SIZE + id as u64 * self.stride()
    }

    /// Medium length needed for `clusters` clusters, `None` on overflow.
    fn array_end(&self, clusters: u64) -> Option<u64> {
        if clusters > ClusterId::MAX as u64 {
            return None;
        }
        clusters.checked_mul(self.stride())?.checked_add(HEADER_SIZE)
    }

    fn check_index(&self, id: ClusterId) -> Result<(), StorageError> {
        if !self.contains(id) {
            return Err(StorageError::Corruption(format!(
                "cluster {} out of range ({} clusters)",
                id, self.count
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Fast accessors
    // -----------------------------------------------------------------------

    pub fn links(&self, id: ClusterId) -> Result<ClusterLinks, StorageError> {
        self.check_index(id)?;
        if let Some(cache) = &self.link_cache {
            if let Some(links) = cache.lock().get(&id) {
                return Ok(*links);
            }
        }
        let mut buf = [0u8; CLUSTER_HEADER_SIZE];
        self.medium.read_exact_at(self.offset_of(id), &mut buf)?;
        let links = ClusterLinks::from_bytes(&buf)?;
        if let Some(cache) = &self.link_cache {
            cache.lock().put(id, links);
        }
        Ok(links)
    }

    pub fn traits(&self, id: ClusterId) -> Result<ClusterTraits, StorageError> {
        Ok(self.links(id)?.traits)
    }

    pub fn prev(&self, id: ClusterId) -> Result<ClusterId, StorageError> {
        Ok(self.links(id)?.prev)
    }

    pub fn next(&self, id: ClusterId) -> Result<ClusterId, StorageError> {
        Ok(self.links(id)?.next)
    }

    pub fn set_links(&mut self, id: ClusterId, links: ClusterLinks) -> Result<(), StorageError> {
        self.check_index(id)?;
        self.medium.write(self.offset_of(id), &links.to_bytes())?;
        if let Some(cache) = &self.link_cache {
            cache.lock().put(id, links);
        }
        Ok(())
    }

    pub fn set_traits(&mut self, id: ClusterId, traits: ClusterTraits) -> Result<(), StorageError> {
        let mut links = self.links(id)?;
        links.traits = traits;
        self.set_links(id, links)
    }

    pub fn set_prev(&mut self, id: ClusterId, prev: ClusterId) -> Result<(), StorageError> {
        let mut links = self.links(id)?;
        links.prev = prev;
        self.set_links(id, links)
    }

    pub fn set_next(&mut self, id: ClusterId, next: ClusterId) -> Result<(), StorageError> {
        let mut links = self.links(id)?;
        links.next = next;
        self.set_links(id, links)
    }

    fn check_data_range(&self, offset: usize, len: usize) -> Result<(), StorageError> {
        if offset + len > self.cluster_size {
            return Err(StorageError::OutOfBounds(format!(
                "range {}..{} exceeds cluster size {}",
                offset,
                offset + len,
                self.cluster_size
            )));
        }
        Ok(())
    }

    /// Read `buf.len()` payload bytes of cluster `id` starting at `offset`.
    pub fn read_data(&self, id: ClusterId, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_index(id)?;
        self.check_data_range(offset, buf.len())?;
        let at = self.offset_of(id) + (CLUSTER_HEADER_SIZE + offset) as u64;
        self.medium.read_exact_at(at, buf)
    }

    /// Overwrite payload bytes of cluster `id` starting at `offset`.
    pub fn write_data(&mut self, id: ClusterId, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        self.check_index(id)?;
        self.check_data_range(offset, data.len())?;
        let at = self.offset_of(id) + (CLUSTER_HEADER_SIZE + offset) as u64;
        self.medium.write(at, data)
    }

    pub fn read_cluster(&self, id: ClusterId) -> Result<Cluster, StorageError> {
        self.check_index(id)?;
        let mut buf = vec![0u8; self.stride() as usize];
        self.medium.read_exact_at(self.offset_of(id), &mut buf)?;
        Cluster::from_bytes(&buf, self.cluster_size)
    }

    pub fn write_cluster(&mut self, id: ClusterId, cluster: &Cluster) -> Result<(), StorageError> {
        self.check_index(id)?;
        if cluster.data.len() != self.cluster_size {
            return Err(StorageError::InvalidArgument(format!(
                "cluster payload is {} bytes, expected {}",
                cluster.data.len(),
                self.cluster_size
            )));
        }
        self.medium.write(self.offset_of(id), &cluster.to_bytes())?;
        if let Some(cache) = &self.link_cache {
            cache.lock().put(id, cluster.links());
        }
        Ok(())
    }

    /// Snapshot of every cluster, in physical order. Diagnostics only.
    pub fn clusters(&self) -> Result<Vec<Cluster>, StorageError> {
        let stride = self.stride() as usize;
        let mut buf = vec![0u8; stride * self.count as usize];
        if !buf.is_empty() {
            self.medium.read_exact_at(HEADER_SIZE, &mut buf)?;
        }
        buf.chunks(stride)
            .map(|chunk| Cluster::from_bytes(chunk, self.cluster_size))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Chain helpers
    // -----------------------------------------------------------------------

    /// Walk forward from `id` to the chain end and return the chain's terminal.
    pub fn resolve_terminal(&self, id: ClusterId) -> Result<ClusterId, StorageError> {
        let mut visited = HashSet::new();
        let mut current = id;
        loop {
            if !visited.insert(current) {
                return Err(StorageError::Corruption(format!(
                    "cycle detected at cluster {} while resolving terminal of {}",
                    current, id
                )));
            }
            let links = self.links(current)?;
            if links.is_end() {
                return Ok(links.next);
            }
            current = links.next;
        }
    }

    /// Walk backwards from `id` to the chain start and return its id.
    pub fn resolve_chain_start(&self, id: ClusterId) -> Result<ClusterId, StorageError> {
        let mut visited = HashSet::new();
        let mut current = id;
        loop {
            if !visited.insert(current) {
                return Err(StorageError::Corruption(format!(
                    "cycle detected at cluster {} while resolving start of {}",
                    current, id
                )));
            }
            let links = self.links(current)?;
            if links.is_start() {
                return Ok(current);
            }
            current = links.prev;
        }
    }

    /// Rewrite the terminal value of the chain bounded by `start` and `end`.
    pub fn set_chain_terminal(
        &mut self,
        start: ClusterId,
        end: ClusterId,
        terminal: ClusterId,
    ) -> Result<(), StorageError> {
        let mut start_links = self.links(start)?;
        if !start_links.is_start() {
            return Err(StorageError::Corruption(format!(
                "cluster {} is not a chain start",
                start
            )));
        }
        if start == end {
            if !start_links.is_end() {
                return Err(StorageError::Corruption(format!(
                    "cluster {} is not a chain end",
                    end
                )));
            }
            start_links.prev = terminal;
            start_links.next = terminal;
            return self.set_links(start, start_links);
        }
        let mut end_links = self.links(end)?;
        if !end_links.is_end() {
            return Err(StorageError::Corruption(format!(
                "cluster {} is not a chain end",
                end
            )));
        }
        start_links.prev = terminal;
        end_links.next = terminal;
        self.set_links(start, start_links)?;
        self.set_links(end, end_links)
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Grow the array by `quantity` zeroed clusters. Returns the first new id.
    fn allocate(&mut self, quantity: u64) -> Result<ClusterId, StorageError> {
        let first = self.count as ClusterId;
        let old_end = self.offset_of(first);
        let new_end = self
            .count
            .checked_add(quantity)
            .and_then(|n| self.array_end(n))
            .ok_or_else(|| {
                StorageError::OutOfBounds(format!(
                    "allocating {} clusters after {} exceeds the addressable medium",
                    quantity, self.count
                ))
            })?;
        // Drop any stale bytes past the array so the new clusters read as zero.
        if self.medium.len()? != old_end {
            self.medium.set_len(old_end)?;
        }
        self.medium.set_len(new_end)?;
        self.count += quantity;
        Ok(first)
    }

    /// Release the physical slot `slot`. When `slot` is not the tail, the
    /// tail cluster is migrated into it and its neighbours are repointed.
    ///
    /// `slot` must already be unlinked: no live cluster may reference it.
    fn deallocate(&mut self, slot: ClusterId) -> Result<Option<ClusterMove>, StorageError> {
        self.check_index(slot)?;
        let tail = self.count as ClusterId - 1;
        let moved = if slot != tail {
            let cluster = self.read_cluster(tail)?;
            self.write_cluster(slot, &cluster)?;
            if !cluster.traits.contains(ClusterTraits::START) {
                self.set_next(cluster.prev, slot)?;
            }
            if !cluster.traits.contains(ClusterTraits::END) {
                self.set_prev(cluster.next, slot)?;
            }
            Some(ClusterMove {
                from: tail,
                to: slot,
                traits: cluster.traits,
                terminal: cluster.links().terminal(),
            })
        } else {
            None
        };

        self.count -= 1;
        self.medium.set_len(self.offset_of(self.count as ClusterId))?;
        if let Some(cache) = &self.link_cache {
            cache.lock().pop(&tail);
        }
        if let Some(m) = &moved {
            trace!(from = m.from, to = m.to, "migrated tail cluster");
        }
        Ok(moved)
    }

    // -----------------------------------------------------------------------
    // Chain operations
    // -----------------------------------------------------------------------

    /// Allocate a new chain of `quantity` clusters owned by `terminal`.
    /// Returns `(start, end)`.
    pub fn new_cluster_chain<L: ClusterMapListener<M> + ?Sized>(
        &mut self,
        quantity: u64,
        terminal: ClusterId,
        listener: &mut L,
    ) -> Result<(ClusterId, ClusterId), StorageError> {
        if quantity == 0 {
            return Err(StorageError::InvalidArgument(
                "a cluster chain needs at least one cluster".to_string(),
            ));
        }
        let start = self.allocate(1)?;
        self.set_links(
            start,
            ClusterLinks {
                traits: ClusterTraits::START | ClusterTraits::END,
                prev: terminal,
                next: terminal,
            },
        )?;
        trace!(terminal, start, quantity, "created cluster chain");
        listener.cluster_count_changed(self, 1, terminal)?;
        listener.chain_created(self, terminal, start, start)?;

        let end = if quantity > 1 {
            self.append_clusters_to_end(start, quantity - 1, listener)?
        } else {
            start
        };
        Ok((start, end))
    }

    /// Extend the chain ending at `from_end` by `quantity` clusters.
    /// Returns the new end.
    pub fn append_clusters_to_end<L: ClusterMapListener<M> + ?Sized>(
        &mut self,
        from_end: ClusterId,
        quantity: u64,
        listener: &mut L,
    ) -> Result<ClusterId, StorageError> {
        let mut end_links = self.links(from_end)?;
        if !end_links.is_end() {
            return Err(StorageError::Corruption(format!(
                "cluster {} is not a chain end",
                from_end
            )));
        }
        if quantity == 0 {
            return Ok(from_end);
        }
        let terminal = end_links.next;
        let first = self.allocate(quantity)?;

        end_links.traits.remove(ClusterTraits::END);
        end_links.next = first;
        self.set_links(from_end, end_links)?;

        for i in 0..quantity {
            let id = first + i as ClusterId;
            let last = i + 1 == quantity;
            self.set_links(
                id,
                ClusterLinks {
                    traits: if last {
                        ClusterTraits::END
                    } else {
                        ClusterTraits::empty()
                    },
                    prev: if i == 0 { from_end } else { id - 1 },
                    next: if last { terminal } else { id + 1 },
                },
            )?;
        }

        let new_end = first + quantity as ClusterId - 1;
        trace!(terminal, from_end, new_end, quantity, "appended clusters");
        listener.cluster_count_changed(self, quantity as i64, terminal)?;
        listener.chain_end_changed(self, terminal, new_end)?;
        Ok(new_end)
    }

    /// Remove up to `quantity` clusters walking backwards from `from`,
    /// stopping early once the chain start has been consumed.
    /// Returns the number of clusters removed.
    ///
    /// Each step unlinks the cluster from its chain, then frees its physical
    /// slot by tip substitution. Events of one step are emitted in this
    /// order before the next step begins: count change, boundary change
    /// (chain removed, new start, or new end), then the migration. Listeners
    /// such as the record table read through chains while handling the
    /// migration, so the boundary they depend on must already be correct.
    pub fn remove_backwards<L: ClusterMapListener<M> + ?Sized>(
        &mut self,
        from: ClusterId,
        quantity: u64,
        listener: &mut L,
    ) -> Result<u64, StorageError> {
        if quantity == 0 {
            return Ok(0);
        }
        let terminal = self.resolve_terminal(from)?;

        let mut current = from;
        let mut removed = 0u64;
        loop {
            let links = self.links(current)?;
            let is_start = links.is_start();
            let is_end = links.is_end();
            if (!is_start && links.prev == current) || (!is_end && links.next == current) {
                return Err(StorageError::Corruption(format!(
                    "cluster {} points to itself",
                    current
                )));
            }
            let mut prev = links.prev;
            let mut next = links.next;

            // Unlink `current`, handing its boundary role to the neighbour.
            match (is_start, is_end) {
                (true, true) => {}
                (true, false) => {
                    let mut next_links = self.links(next)?;
                    next_links.traits.insert(ClusterTraits::START);
                    next_links.prev = terminal;
                    self.set_links(next, next_links)?;
                }
                (false, true) => {
                    let mut prev_links = self.links(prev)?;
                    prev_links.traits.insert(ClusterTraits::END);
                    prev_links.next = terminal;
                    self.set_links(prev, prev_links)?;
                }
                (false, false) => {
                    self.set_next(prev, next)?;
                    self.set_prev(next, prev)?;
                }
            }

            let moved = self.deallocate(current)?;
            if let Some(m) = &moved {
                if !is_start && prev == m.from {
                    prev = m.to;
                }
                if !is_end && next == m.from {
                    next = m.to;
                }
            }
            removed += 1;

            listener.cluster_count_changed(self, -1, terminal)?;
            match (is_start, is_end) {
                (true, true) => {
                    trace!(terminal, "removed cluster chain");
                    listener.chain_removed(self, terminal)?;
                }
                (true, false) => listener.chain_start_changed(self, terminal, next)?,
                (false, true) => listener.chain_end_changed(self, terminal, prev)?,
                (false, false) => {}
            }
            if let Some(m) = &moved {
                listener.cluster_moved(self, m)?;
            }

            if is_start || removed == quantity {
                break;
            }
            current = prev;
        }
        trace!(terminal, removed, "removed clusters");
        Ok(removed)
    }

    /// Drop every cluster. Emits no events; the owner resets its bookkeeping.
    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.count = 0;
        self.medium.set_len(HEADER_SIZE)?;
        if let Some(cache) = &self.link_cache {
            cache.lock().clear();
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::verify::verify_structure;
    use crate::MemoryMedium;

    pub(crate) fn new_map(cluster_size: usize) -> ClusterMap<MemoryMedium> {
        let medium = MemoryMedium::new();
        medium.set_len(HEADER_SIZE).unwrap();
        ClusterMap::attach(medium, cluster_size, 0, None).unwrap()
    }

    /// Follows events the way the record table does: one (start, end, count)
    /// entry per terminal.
    #[derive(Default)]
    pub(crate) struct ChainTracker {
        pub chains: HashMap<ClusterId, (ClusterId, ClusterId, i64)>,
        pub touched: HashSet<ClusterId>,
    }

    impl<M: BackingMedium> ClusterMapListener<M> for ChainTracker {
        fn cluster_count_changed(
            &mut self,
            _map: &mut ClusterMap<M>,
            delta: i64,
            terminal: ClusterId,
        ) -> Result<(), StorageError> {
            self.touched.insert(terminal);
            let entry = self
                .chains
                .entry(terminal)
                .or_insert((NULL_CLUSTER, NULL_CLUSTER, 0));
            entry.2 += delta;
            Ok(())
        }

        fn chain_created(
            &mut self,
            _map: &mut ClusterMap<M>,
            terminal: ClusterId,
            start: ClusterId,
            end: ClusterId,
        ) -> Result<(), StorageError> {
            let entry = self.chains.get_mut(&terminal).unwrap();
            entry.0 = start;
            entry.1 = end;
            Ok(())
        }

        fn chain_removed(
            &mut self,
            _map: &mut ClusterMap<M>,
            terminal: ClusterId,
        ) -> Result<(), StorageError> {
            let entry = self.chains.remove(&terminal).unwrap();
            assert_eq!(entry.2, 0, "chain {} removed with clusters left", terminal);
            Ok(())
        }

        fn chain_start_changed(
            &mut self,
            _map: &mut ClusterMap<M>,
            terminal: ClusterId,
            start: ClusterId,
        ) -> Result<(), StorageError> {
            self.chains.get_mut(&terminal).unwrap().0 = start;
            Ok(())
        }

        fn chain_end_changed(
            &mut self,
            _map: &mut ClusterMap<M>,
            terminal: ClusterId,
            end: ClusterId,
        ) -> Result<(), StorageError> {
            self.chains.get_mut(&terminal).unwrap().1 = end;
            Ok(())
        }

        fn cluster_moved(
            &mut self,
            _map: &mut ClusterMap<M>,
            moved: &ClusterMove,
        ) -> Result<(), StorageError> {
            if let Some(terminal) = moved.terminal {
                self.touched.insert(terminal);
                let entry = self.chains.get_mut(&terminal).unwrap();
                if moved.traits.contains(ClusterTraits::START) {
                    assert_eq!(entry.0, moved.from);
                    entry.0 = moved.to;
                }
                if moved.traits.contains(ClusterTraits::END) {
                    assert_eq!(entry.1, moved.from);
                    entry.1 = moved.to;
                }
            }
            Ok(())
        }
    }

    /// Ids of the chain starting at `start`, in logical order.
    pub(crate) fn walk<M: BackingMedium>(map: &ClusterMap<M>, start: ClusterId) -> Vec<ClusterId> {
        let mut ids = vec![start];
        let mut current = start;
        while !map.links(current).unwrap().is_end() {
            current = map.next(current).unwrap();
            ids.push(current);
        }
        ids
    }

    fn tags<M: BackingMedium>(map: &ClusterMap<M>, start: ClusterId) -> Vec<u8> {
        walk(map, start)
            .into_iter()
            .map(|id| {
                let mut b = [0u8; 1];
                map.read_data(id, 0, &mut b).unwrap();
                b[0]
            })
            .collect()
    }

    fn assert_tracker_matches<M: BackingMedium>(map: &ClusterMap<M>, tracker: &ChainTracker) {
        for (&terminal, &(start, end, count)) in &tracker.chains {
            let links = map.links(start).unwrap();
            assert!(links.is_start());
            assert_eq!(links.prev, terminal);
            let ids = walk(map, start);
            assert_eq!(*ids.last().unwrap(), end);
            assert_eq!(ids.len() as i64, count);
        }
        let total: i64 = tracker.chains.values().map(|c| c.2).sum();
        assert_eq!(total as u64, map.cluster_count());
    }

    #[test]
    fn new_chain_links_sequentially() {
        let mut map = new_map(8);
        let mut tracker = ChainTracker::default();
        let (start, end) = map.new_cluster_chain(3, 5, &mut tracker).unwrap();
        assert_eq!((start, end), (0, 2));
        assert_eq!(walk(&map, start), vec![0, 1, 2]);
        assert_eq!(map.prev(0).unwrap(), 5);
        assert_eq!(map.next(2).unwrap(), 5);
        assert_eq!(map.traits(1).unwrap(), ClusterTraits::empty());
        assert_eq!(tracker.chains[&5], (0, 2, 3));
        assert!(verify_structure(&map.clusters().unwrap(), None).is_empty());
    }

    #[test]
    fn single_cluster_chain_is_start_and_end() {
        let mut map = new_map(8);
        let (start, end) = map.new_cluster_chain(1, NULL_CLUSTER, &mut NoopListener).unwrap();
        assert_eq!(start, end);
        assert_eq!(
            map.traits(start).unwrap(),
            ClusterTraits::START | ClusterTraits::END
        );
        assert!(map.new_cluster_chain(0, 1, &mut NoopListener).is_err());
    }

    #[test]
    fn append_requires_chain_end() {
        let mut map = new_map(8);
        map.new_cluster_chain(3, 0, &mut NoopListener).unwrap();
        assert!(matches!(
            map.append_clusters_to_end(1, 1, &mut NoopListener),
            Err(StorageError::Corruption(_))
        ));
        let end = map.append_clusters_to_end(2, 2, &mut NoopListener).unwrap();
        assert_eq!(end, 4);
        assert_eq!(walk(&map, 0), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn chain_length_rounds_up() {
        let map = new_map(32);
        assert_eq!(map.calculate_cluster_chain_length(0), 0);
        assert_eq!(map.calculate_cluster_chain_length(1), 1);
        assert_eq!(map.calculate_cluster_chain_length(32), 1);
        assert_eq!(map.calculate_cluster_chain_length(33), 2);
        assert_eq!(map.calculate_cluster_chain_length(100), 4);
    }

    /// Three interleaved chains of length `n`; chain 1 is the one under test.
    /// Every cluster's first payload byte tags (chain, position).
    fn interleaved(n: u64) -> (ClusterMap<MemoryMedium>, ChainTracker) {
        let mut map = new_map(4);
        let mut tracker = ChainTracker::default();
        let mut ends: HashMap<ClusterId, ClusterId> = HashMap::new();
        for pos in 0..n {
            for terminal in 0..3 {
                let id = match ends.get(&terminal) {
                    None => map.new_cluster_chain(1, terminal, &mut tracker).unwrap().1,
                    Some(&end) => map.append_clusters_to_end(end, 1, &mut tracker).unwrap(),
                };
                ends.insert(terminal, id);
                map.write_data(id, 0, &[(terminal as u8) * 16 + pos as u8]).unwrap();
            }
        }
        (map, tracker)
    }

    #[test]
    fn tip_substitution_at_every_position() {
        for n in 1..=5u64 {
            for from_pos in 0..n {
                for k in 0..=n {
                    let (mut map, mut tracker) = interleaved(n);
                    let start = tracker.chains[&1].0;
                    let from = walk(&map, start)[from_pos as usize];
                    tracker.touched.clear();

                    let removed = map.remove_backwards(from, k, &mut tracker).unwrap();
                    let expected_removed = k.min(from_pos + 1);
                    assert_eq!(removed, expected_removed, "n={} from={} k={}", n, from_pos, k);
                    assert_eq!(map.cluster_count(), 3 * n - removed);

                    let first_removed = from_pos + 1 - removed;
                    let expected_tags: Vec<u8> = (0..n)
                        .filter(|p| *p < first_removed || *p > from_pos)
                        .map(|p| 16 + p as u8)
                        .collect();
                    match tracker.chains.get(&1) {
                        Some(&(start, _, _)) => assert_eq!(tags(&map, start), expected_tags),
                        None => assert!(expected_tags.is_empty()),
                    }
                    for other in [0, 2] {
                        let start = tracker.chains[&other].0;
                        let expected: Vec<u8> =
                            (0..n).map(|p| other as u8 * 16 + p as u8).collect();
                        assert_eq!(tags(&map, start), expected);
                    }
                    if removed == 0 {
                        assert!(tracker.touched.is_empty());
                    }
                    assert_tracker_matches(&map, &tracker);
                    let issues = verify_structure(&map.clusters().unwrap(), None);
                    assert!(issues.is_empty(), "n={} from={} k={}: {:?}", n, from_pos, k, issues);
                }
            }
        }
    }

    #[test]
    fn removing_whole_chain_reports_removal() {
        let (mut map, mut tracker) = interleaved(3);
        let end = tracker.chains[&2].1;
        assert_eq!(map.remove_backwards(end, u64::MAX, &mut tracker).unwrap(), 3);
        assert!(!tracker.chains.contains_key(&2));
        assert_eq!(map.cluster_count(), 6);
        assert_tracker_matches(&map, &tracker);
    }

    #[test]
    fn remove_in_middle_relinks_neighbours() {
        let mut map = new_map(4);
        let mut tracker = ChainTracker::default();
        map.new_cluster_chain(5, 9, &mut tracker).unwrap();
        assert_eq!(map.remove_backwards(2, 2, &mut tracker).unwrap(), 2);
        let ids = walk(&map, 0);
        assert_eq!(ids.len(), 3);
        assert_tracker_matches(&map, &tracker);
        assert!(verify_structure(&map.clusters().unwrap(), None).is_empty());
    }

    #[test]
    fn cycle_is_reported_as_corruption() {
        let mut map = new_map(4);
        map.new_cluster_chain(3, 0, &mut NoopListener).unwrap();
        // 2 -> 1 instead of ending the chain.
        map.set_links(
            2,
            ClusterLinks {
                traits: ClusterTraits::empty(),
                prev: 1,
                next: 1,
            },
        )
        .unwrap();
        assert!(matches!(
            map.resolve_terminal(0),
            Err(StorageError::Corruption(_))
        ));
        assert!(matches!(
            map.remove_backwards(1, 1, &mut NoopListener),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn link_cache_stays_coherent_through_migration() {
        let medium = MemoryMedium::new();
        medium.set_len(HEADER_SIZE).unwrap();
        let mut map = ClusterMap::attach(medium, 4, 0, NonZeroUsize::new(2)).unwrap();
        let mut tracker = ChainTracker::default();
        map.new_cluster_chain(2, 0, &mut tracker).unwrap();
        map.new_cluster_chain(2, 1, &mut tracker).unwrap();
        map.remove_backwards(1, 2, &mut tracker).unwrap();
        assert_tracker_matches(&map, &tracker);
        assert!(verify_structure(&map.clusters().unwrap(), None).is_empty());
    }

    #[test]
    fn set_chain_terminal_rewrites_boundaries() {
        let mut map = new_map(4);
        map.new_cluster_chain(1, 3, &mut NoopListener).unwrap();
        map.new_cluster_chain(2, 4, &mut NoopListener).unwrap();
        map.set_chain_terminal(0, 0, 7).unwrap();
        map.set_chain_terminal(1, 2, 8).unwrap();
        assert_eq!(map.links(0).unwrap().terminal(), Some(7));
        assert_eq!(map.prev(1).unwrap(), 8);
        assert_eq!(map.next(2).unwrap(), 8);
        assert!(map.set_chain_terminal(2, 1, 9).is_err());
    }
}
