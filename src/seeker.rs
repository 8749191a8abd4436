use std::collections::HashSet;

use crate::cluster::{ClusterId, ClusterTraits, NULL_CLUSTER};
use crate::cluster_map::ClusterMap;
use crate::medium::BackingMedium;
use crate::StorageError;

/// The last cluster a seeker visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekPosition {
    pub cluster: ClusterId,
    /// Logical index of `cluster` within its chain.
    pub index: u64,
    pub traits: ClusterTraits,
}

/// Logical-index navigation over one cluster chain.
///
/// Remembers the last visited cluster so sequential access costs one step.
/// Any change to the chain's bounds or length drops that memory, since the
/// cluster it named may have moved or been freed.
#[derive(Debug, Clone)]
pub struct ClusterSeeker {
    terminal: ClusterId,
    start: ClusterId,
    end: ClusterId,
    total: u64,
    current: Option<SeekPosition>,
}

#[derive(Clone, Copy)]
enum Anchor {
    Start,
    End,
    Current,
}

impl ClusterSeeker {
    pub fn new(terminal: ClusterId, start: ClusterId, end: ClusterId, total: u64) -> Self {
        ClusterSeeker {
            terminal,
            start,
            end,
            total,
            current: None,
        }
    }

    /// Seeker over a chain that has no clusters yet.
    pub fn empty(terminal: ClusterId) -> Self {
        Self::new(terminal, NULL_CLUSTER, NULL_CLUSTER, 0)
    }

    pub fn terminal(&self) -> ClusterId {
        self.terminal
    }

    pub fn start(&self) -> ClusterId {
        self.start
    }

    pub fn end(&self) -> ClusterId {
        self.end
    }

    pub fn total_clusters(&self) -> u64 {
        self.total
    }

    pub fn current(&self) -> Option<SeekPosition> {
        self.current
    }

    /// Forget the remembered position.
    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn set_bounds(&mut self, start: ClusterId, end: ClusterId, total: u64) {
        self.start = start;
        self.end = end;
        self.total = total;
        self.reset();
    }

    pub fn set_start(&mut self, start: ClusterId) {
        self.start = start;
        self.reset();
    }

    pub fn set_end(&mut self, end: ClusterId) {
        self.end = end;
        self.reset();
    }

    pub fn adjust_total(&mut self, delta: i64) -> Result<(), StorageError> {
        let total = self.total as i64 + delta;
        if total < 0 {
            return Err(StorageError::Corruption(format!(
                "chain {} cluster count would become {}",
                self.terminal, total
            )));
        }
        self.total = total as u64;
        self.reset();
        Ok(())
    }

    /// Follow a physical relocation of cluster `from` to `to`.
    pub fn relocate(&mut self, from: ClusterId, to: ClusterId) {
        if self.start == from {
            self.start = to;
        }
        if self.end == from {
            self.end = to;
        }
        if let Some(pos) = &mut self.current {
            if pos.cluster == from {
                pos.cluster = to;
            }
        }
    }

    fn ensure_not_empty(&self) -> Result<(), StorageError> {
        if self.total == 0 {
            return Err(StorageError::OutOfBounds(format!(
                "chain {} has no clusters",
                self.terminal
            )));
        }
        Ok(())
    }

    pub fn seek_start<M: BackingMedium>(&mut self, map: &ClusterMap<M>) -> Result<ClusterId, StorageError> {
        self.ensure_not_empty()?;
        let links = map.links(self.start)?;
        if !links.is_start() || links.prev != self.terminal {
            return Err(StorageError::Corruption(format!(
                "cluster {} is not the start of chain {}",
                self.start, self.terminal
            )));
        }
        self.current = Some(SeekPosition {
            cluster: self.start,
            index: 0,
            traits: links.traits,
        });
        Ok(self.start)
    }

    pub fn seek_end<M: BackingMedium>(&mut self, map: &ClusterMap<M>) -> Result<ClusterId, StorageError> {
        self.ensure_not_empty()?;
        let links = map.links(self.end)?;
        if !links.is_end() || links.next != self.terminal {
            return Err(StorageError::Corruption(format!(
                "cluster {} is not the end of chain {}",
                self.end, self.terminal
            )));
        }
        self.current = Some(SeekPosition {
            cluster: self.end,
            index: self.total - 1,
            traits: links.traits,
        });
        Ok(self.end)
    }

    fn current_or_corrupt(&self) -> Result<SeekPosition, StorageError> {
        self.current.ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "seeker of chain {} has no current position",
                self.terminal
            ))
        })
    }

    /// Walk `steps` clusters along `next` from the current position.
    pub fn seek_forward<M: BackingMedium>(
        &mut self,
        map: &ClusterMap<M>,
        steps: u64,
    ) -> Result<ClusterId, StorageError> {
        let mut pos = self.current_or_corrupt()?;
        if pos.index + steps >= self.total {
            return Err(StorageError::OutOfBounds(format!(
                "cluster index {} beyond chain {} of {} clusters",
                pos.index + steps,
                self.terminal,
                self.total
            )));
        }
        let mut visited = HashSet::new();
        visited.insert(pos.cluster);
        for _ in 0..steps {
            let links = map.links(pos.cluster)?;
            if links.is_end() {
                return Err(StorageError::Corruption(format!(
                    "chain {} ends at index {} but should hold {} clusters",
                    self.terminal, pos.index, self.total
                )));
            }
            let next = links.next;
            if !visited.insert(next) {
                return Err(StorageError::Corruption(format!(
                    "cycle detected in chain {} at cluster {}",
                    self.terminal, next
                )));
            }
            let next_links = map.links(next)?;
            if next_links.is_start() || next_links.prev != pos.cluster {
                return Err(StorageError::Corruption(format!(
                    "cluster {} does not link back to {}",
                    next, pos.cluster
                )));
            }
            pos = SeekPosition {
                cluster: next,
                index: pos.index + 1,
                traits: next_links.traits,
            };
            self.current = Some(pos);
        }
        Ok(pos.cluster)
    }

    /// Walk `steps` clusters along `prev` from the current position.
    pub fn seek_backwards<M: BackingMedium>(
        &mut self,
        map: &ClusterMap<M>,
        steps: u64,
    ) -> Result<ClusterId, StorageError> {
        let mut pos = self.current_or_corrupt()?;
        if steps > pos.index {
            return Err(StorageError::OutOfBounds(format!(
                "cannot step {} clusters back from index {} in chain {}",
                steps, pos.index, self.terminal
            )));
        }
        let mut visited = HashSet::new();
        visited.insert(pos.cluster);
        for _ in 0..steps {
            let links = map.links(pos.cluster)?;
            if links.is_start() {
                return Err(StorageError::Corruption(format!(
                    "chain {} starts at recorded index {}",
                    self.terminal, pos.index
                )));
            }
            let prev = links.prev;
            if !visited.insert(prev) {
                return Err(StorageError::Corruption(format!(
                    "cycle detected in chain {} at cluster {}",
                    self.terminal, prev
                )));
            }
            let prev_links = map.links(prev)?;
            if prev_links.is_end() || prev_links.next != pos.cluster {
                return Err(StorageError::Corruption(format!(
                    "cluster {} does not link forward to {}",
                    prev, pos.cluster
                )));
            }
            pos = SeekPosition {
                cluster: prev,
                index: pos.index - 1,
                traits: prev_links.traits,
            };
            self.current = Some(pos);
        }
        Ok(pos.cluster)
    }

    /// Position on logical cluster `index`, walking from whichever of the
    /// start, the end or the remembered position is closest.
    pub fn seek_to<M: BackingMedium>(
        &mut self,
        map: &ClusterMap<M>,
        index: u64,
    ) -> Result<ClusterId, StorageError> {
        if index >= self.total {
            return Err(StorageError::OutOfBounds(format!(
                "cluster index {} beyond chain {} of {} clusters",
                index, self.terminal, self.total
            )));
        }

        let mut best = (Anchor::Start, index);
        let from_end = self.total - 1 - index;
        if from_end < best.1 {
            best = (Anchor::End, from_end);
        }
        if let Some(pos) = self.current {
            let distance = pos.index.abs_diff(index);
            if distance <= best.1 {
                best = (Anchor::Current, distance);
            }
        }

        let from = match best.0 {
            Anchor::Start => {
                self.seek_start(map)?;
                0
            }
            Anchor::End => {
                self.seek_end(map)?;
                self.total - 1
            }
            Anchor::Current => self.current_or_corrupt()?.index,
        };
        if index >= from {
            self.seek_forward(map, index - from)
        } else {
            self.seek_backwards(map, from - index)
        }
    }
}
