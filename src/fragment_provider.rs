use crate::cluster::{ClusterId, ClusterTraits, NULL_CLUSTER};
use crate::cluster_map::{ClusterMap, ClusterMapListener, ClusterMove, NoopListener};
use crate::medium::BackingMedium;
use crate::seeker::ClusterSeeker;
use crate::StorageError;

/// Listener of a resizable stream: cluster map events plus the stream's own
/// length changes.
pub trait StreamListener<M: BackingMedium>: ClusterMapListener<M> {
    fn stream_length_changed(
        &mut self,
        map: &mut ClusterMap<M>,
        terminal: ClusterId,
        old_len: u64,
        new_len: u64,
    ) -> Result<(), StorageError> {
        let _ = (map, terminal, old_len, new_len);
        Ok(())
    }
}

impl<M: BackingMedium> StreamListener<M> for NoopListener {}

/// Presents one cluster chain as a resizable byte stream.
///
/// Fragment `n` is the payload of the chain's `n`-th cluster. The provider
/// is itself a cluster map listener: fed the map's events it keeps its chain
/// bounds and cached seek position valid for its own terminal.
#[derive(Debug, Clone)]
pub struct FragmentProvider {
    seeker: ClusterSeeker,
    cluster_size: usize,
    total_bytes: u64,
}

impl FragmentProvider {
    /// Provider over an existing chain holding `total_bytes` bytes.
    pub fn attach(
        terminal: ClusterId,
        start: ClusterId,
        end: ClusterId,
        total_bytes: u64,
        cluster_size: usize,
    ) -> Self {
        let clusters = total_bytes.div_ceil(cluster_size as u64);
        FragmentProvider {
            seeker: ClusterSeeker::new(terminal, start, end, clusters),
            cluster_size,
            total_bytes,
        }
    }

    pub fn empty(terminal: ClusterId, cluster_size: usize) -> Self {
        Self::attach(terminal, NULL_CLUSTER, NULL_CLUSTER, 0, cluster_size)
    }

    pub fn terminal(&self) -> ClusterId {
        self.seeker.terminal()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn cluster_count(&self) -> u64 {
        self.seeker.total_clusters()
    }

    pub fn start_cluster(&self) -> ClusterId {
        self.seeker.start()
    }

    pub fn end_cluster(&self) -> ClusterId {
        self.seeker.end()
    }

    /// Payload of the chain's `index`-th cluster.
    pub fn get_fragment<M: BackingMedium>(
        &mut self,
        map: &ClusterMap<M>,
        index: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let cluster = self.seeker.seek_to(map, index)?;
        let mut data = vec![0u8; self.cluster_size];
        map.read_data(cluster, 0, &mut data)?;
        Ok(data)
    }

    /// Translate a byte position into `(cluster, offset within cluster)`.
    pub fn map_stream_position<M: BackingMedium>(
        &mut self,
        map: &ClusterMap<M>,
        position: u64,
    ) -> Result<(ClusterId, usize), StorageError> {
        if position >= self.total_bytes {
            return Err(StorageError::OutOfBounds(format!(
                "position {} beyond stream length {}",
                position, self.total_bytes
            )));
        }
        let cs = self.cluster_size as u64;
        let cluster = self.seeker.seek_to(map, position / cs)?;
        Ok((cluster, (position % cs) as usize))
    }

    /// Overwrite part of one cluster's payload in place.
    pub fn update_fragment<M: BackingMedium>(
        &self,
        map: &mut ClusterMap<M>,
        cluster: ClusterId,
        offset: usize,
        data: &[u8],
    ) -> Result<(), StorageError> {
        map.write_data(cluster, offset, data)
    }

    /// Read up to `buf.len()` bytes at `position`, clipped to the stream
    /// length. Returns the number of bytes read.
    pub fn read<M: BackingMedium>(
        &mut self,
        map: &ClusterMap<M>,
        position: u64,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        if position >= self.total_bytes {
            return Ok(0);
        }
        let len = (self.total_bytes - position).min(buf.len() as u64) as usize;
        let mut done = 0;
        while done < len {
            let (cluster, offset) = self.map_stream_position(map, position + done as u64)?;
            let chunk = (self.cluster_size - offset).min(len - done);
            map.read_data(cluster, offset, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(done)
    }

    /// Write `data` at `position`. The range must lie within the stream;
    /// grow it with `set_total_bytes` first.
    pub fn write<M: BackingMedium>(
        &mut self,
        map: &mut ClusterMap<M>,
        position: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let end = position.checked_add(data.len() as u64).ok_or_else(|| {
            StorageError::OutOfBounds(format!(
                "write of {} bytes at {} overflows the stream offset",
                data.len(),
                position
            ))
        })?;
        if end > self.total_bytes {
            return Err(StorageError::OutOfBounds(format!(
                "write of {} bytes at {} exceeds stream length {}",
                data.len(),
                position,
                self.total_bytes
            )));
        }
        let mut done = 0;
        while done < data.len() {
            let (cluster, offset) = self.map_stream_position(map, position + done as u64)?;
            let chunk = (self.cluster_size - offset).min(data.len() - done);
            self.update_fragment(map, cluster, offset, &data[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Resize the stream to `new_len` bytes, growing or shrinking its chain.
    ///
    /// The provider applies the resulting cluster map events to itself
    /// before `listener` sees them. Bytes past `new_len` in the new end
    /// cluster are zeroed.
    pub fn set_total_bytes<M, L>(
        &mut self,
        map: &mut ClusterMap<M>,
        new_len: u64,
        listener: &mut L,
    ) -> Result<(), StorageError>
    where
        M: BackingMedium,
        L: StreamListener<M> + ?Sized,
    {
        let old_len = self.total_bytes;
        if new_len == old_len {
            return Ok(());
        }
        let terminal = self.terminal();
        let old_clusters = self.cluster_count();
        let new_clusters = map.calculate_cluster_chain_length(new_len);

        {
            let mut tee = SelfFirst {
                provider: &mut *self,
                downstream: &mut *listener,
            };
            if new_clusters > old_clusters {
                let delta = new_clusters - old_clusters;
                if old_clusters == 0 {
                    map.new_cluster_chain(delta, terminal, &mut tee)?;
                } else {
                    let end = tee.provider.end_cluster();
                    map.append_clusters_to_end(end, delta, &mut tee)?;
                }
            } else if new_clusters < old_clusters {
                let delta = old_clusters - new_clusters;
                let end = tee.provider.end_cluster();
                let removed = map.remove_backwards(end, delta, &mut tee)?;
                if removed != delta {
                    return Err(StorageError::Corruption(format!(
                        "chain {} released {} of {} clusters",
                        terminal, removed, delta
                    )));
                }
            }
        }
        if self.cluster_count() != new_clusters {
            return Err(StorageError::Corruption(format!(
                "chain {} holds {} clusters after resize, expected {}",
                terminal,
                self.cluster_count(),
                new_clusters
            )));
        }
        self.total_bytes = new_len;

        let tail = (new_len % self.cluster_size as u64) as usize;
        if tail != 0 {
            let zeros = vec![0u8; self.cluster_size - tail];
            map.write_data(self.end_cluster(), tail, &zeros)?;
        }
        listener.stream_length_changed(map, terminal, old_len, new_len)
    }
}

impl<M: BackingMedium> ClusterMapListener<M> for FragmentProvider {
    fn cluster_count_changed(
        &mut self,
        _map: &mut ClusterMap<M>,
        delta: i64,
        terminal: ClusterId,
    ) -> Result<(), StorageError> {
        if terminal == self.terminal() {
            self.seeker.adjust_total(delta)?;
        }
        Ok(())
    }

    fn chain_created(
        &mut self,
        _map: &mut ClusterMap<M>,
        terminal: ClusterId,
        start: ClusterId,
        end: ClusterId,
    ) -> Result<(), StorageError> {
        if terminal == self.terminal() {
            let total = self.seeker.total_clusters();
            self.seeker.set_bounds(start, end, total);
        }
        Ok(())
    }

    fn chain_removed(&mut self, _map: &mut ClusterMap<M>, terminal: ClusterId) -> Result<(), StorageError> {
        if terminal == self.terminal() {
            self.seeker.set_bounds(NULL_CLUSTER, NULL_CLUSTER, 0);
        }
        Ok(())
    }

    fn chain_start_changed(
        &mut self,
        _map: &mut ClusterMap<M>,
        terminal: ClusterId,
        start: ClusterId,
    ) -> Result<(), StorageError> {
        if terminal == self.terminal() {
            self.seeker.set_start(start);
        }
        Ok(())
    }

    fn chain_end_changed(
        &mut self,
        _map: &mut ClusterMap<M>,
        terminal: ClusterId,
        end: ClusterId,
    ) -> Result<(), StorageError> {
        if terminal == self.terminal() {
            self.seeker.set_end(end);
        }
        Ok(())
    }

    fn cluster_moved(&mut self, _map: &mut ClusterMap<M>, moved: &ClusterMove) -> Result<(), StorageError> {
        // Interior clusters carry no terminal, so any move may hit our cursor.
        self.seeker.relocate(moved.from, moved.to);
        if moved.terminal == Some(self.terminal()) {
            if moved.traits.contains(ClusterTraits::START) && self.start_cluster() != moved.to {
                return Err(StorageError::Corruption(format!(
                    "chain {} start moved from {} but was tracked at {}",
                    self.terminal(),
                    moved.from,
                    self.start_cluster()
                )));
            }
            if moved.traits.contains(ClusterTraits::END) && self.end_cluster() != moved.to {
                return Err(StorageError::Corruption(format!(
                    "chain {} end moved from {} but was tracked at {}",
                    self.terminal(),
                    moved.from,
                    self.end_cluster()
                )));
            }
        }
        Ok(())
    }
}

impl<M: BackingMedium> StreamListener<M> for FragmentProvider {}

/// Delivers each event to the resizing provider, then to the downstream
/// listener.
struct SelfFirst<'a, L: ?Sized> {
    provider: &'a mut FragmentProvider,
    downstream: &'a mut L,
}

impl<M, L> ClusterMapListener<M> for SelfFirst<'_, L>
where
    M: BackingMedium,
    L: ClusterMapListener<M> + ?Sized,
{
    fn cluster_count_changed(
        &mut self,
        map: &mut ClusterMap<M>,
        delta: i64,
        terminal: ClusterId,
    ) -> Result<(), StorageError> {
        self.provider.cluster_count_changed(map, delta, terminal)?;
        self.downstream.cluster_count_changed(map, delta, terminal)
    }

    fn chain_created(
        &mut self,
        map: &mut ClusterMap<M>,
        terminal: ClusterId,
        start: ClusterId,
        end: ClusterId,
    ) -> Result<(), StorageError> {
        self.provider.chain_created(map, terminal, start, end)?;
        self.downstream.chain_created(map, terminal, start, end)
    }

    fn chain_removed(&mut self, map: &mut ClusterMap<M>, terminal: ClusterId) -> Result<(), StorageError> {
        self.provider.chain_removed(map, terminal)?;
        self.downstream.chain_removed(map, terminal)
    }

    fn chain_start_changed(
        &mut self,
        map: &mut ClusterMap<M>,
        terminal: ClusterId,
        start: ClusterId,
    ) -> Result<(), StorageError> {
        self.provider.chain_start_changed(map, terminal, start)?;
        self.downstream.chain_start_changed(map, terminal, start)
    }

    fn chain_end_changed(
        &mut self,
        map: &mut ClusterMap<M>,
        terminal: ClusterId,
        end: ClusterId,
    ) -> Result<(), StorageError> {
        self.provider.chain_end_changed(map, terminal, end)?;
        self.downstream.chain_end_changed(map, terminal, end)
    }

    fn cluster_moved(&mut self, map: &mut ClusterMap<M>, moved: &ClusterMove) -> Result<(), StorageError> {
        self.provider.cluster_moved(map, moved)?;
        self.downstream.cluster_moved(map, moved)
    }
}
