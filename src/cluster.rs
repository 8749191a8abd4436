//! Cluster data model.
//!
//! A cluster is the smallest physical unit of the storage:
//! `| traits: u8 | prev: i64 | next: i64 | data: [u8; cluster_size] |`.
//! Clusters are addressed by their index in the flat cluster array, never by
//! reference, because removal relocates clusters physically.

use bitflags::bitflags;

use crate::StorageError;

/// Index of a cluster in the flat cluster array.
///
/// At a chain boundary the same type carries the chain's terminal value
/// instead (a record index, or `NULL_CLUSTER` for the record table chain).
pub type ClusterId = i64;

/// Sentinel "no cluster" value. Also the terminal of the record table chain.
pub const NULL_CLUSTER: ClusterId = -1;

/// Size of the on-disk cluster header: traits(1) + prev(8) + next(8).
pub const CLUSTER_HEADER_SIZE: usize = 17;

bitflags! {
    /// Boundary markers of a cluster within its chain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClusterTraits: u8 {
        /// `prev` holds the chain's terminal value.
        const START = 0b0000_0001;
        /// `next` holds the chain's terminal value.
        const END = 0b0000_0010;
    }
}

/// The link header of a cluster (everything but the payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterLinks {
    pub traits: ClusterTraits,
    pub prev: ClusterId,
    pub next: ClusterId,
}

impl ClusterLinks {
    pub fn is_start(&self) -> bool {
        self.traits.contains(ClusterTraits::START)
    }

    pub fn is_end(&self) -> bool {
        self.traits.contains(ClusterTraits::END)
    }

    /// Terminal value carried by this cluster, if it is a chain boundary.
    pub fn terminal(&self) -> Option<ClusterId> {
        if self.is_start() {
            Some(self.prev)
        } else if self.is_end() {
            Some(self.next)
        } else {
            None
        }
    }

    pub fn to_bytes(self) -> [u8; CLUSTER_HEADER_SIZE] {
        let mut buf = [0u8; CLUSTER_HEADER_SIZE];
        buf[0] = self.traits.bits();
        buf[1..9].copy_from_slice(&self.prev.to_le_bytes());
        buf[9..17].copy_from_slice(&self.next.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; CLUSTER_HEADER_SIZE]) -> Result<Self, StorageError> {
        let traits = ClusterTraits::from_bits(buf[0]).ok_or_else(|| {
            StorageError::Corruption(format!("unknown cluster trait bits {:#04x}", buf[0]))
        })?;
        Ok(ClusterLinks {
            traits,
            prev: ClusterId::from_le_bytes(buf[1..9].try_into().unwrap()),
            next: ClusterId::from_le_bytes(buf[9..17].try_into().unwrap()),
        })
    }
}

/// A full cluster: link header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub traits: ClusterTraits,
    pub prev: ClusterId,
    pub next: ClusterId,
    pub data: Vec<u8>,
}

impl Cluster {
    /// A zeroed cluster with no traits and null links.
    pub fn new(cluster_size: usize) -> Self {
        Cluster {
            traits: ClusterTraits::empty(),
            prev: NULL_CLUSTER,
            next: NULL_CLUSTER,
            data: vec![0u8; cluster_size],
        }
    }

    pub fn links(&self) -> ClusterLinks {
        ClusterLinks {
            traits: self.traits,
            prev: self.prev,
            next: self.next,
        }
    }

    pub fn set_links(&mut self, links: ClusterLinks) {
        self.traits = links.traits;
        self.prev = links.prev;
        self.next = links.next;
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CLUSTER_HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&self.links().to_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn from_bytes(buf: &[u8], cluster_size: usize) -> Result<Self, StorageError> {
        if buf.len() != CLUSTER_HEADER_SIZE + cluster_size {
            return Err(StorageError::Corruption(format!(
                "cluster image is {} bytes, expected {}",
                buf.len(),
                CLUSTER_HEADER_SIZE + cluster_size
            )));
        }
        let header: &[u8; CLUSTER_HEADER_SIZE] = buf[..CLUSTER_HEADER_SIZE].try_into().unwrap();
        let links = ClusterLinks::from_bytes(header)?;
        Ok(Cluster {
            traits: links.traits,
            prev: links.prev,
            next: links.next,
            data: buf[CLUSTER_HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_comes_from_boundary() {
        let start = ClusterLinks {
            traits: ClusterTraits::START,
            prev: 7,
            next: 3,
        };
        assert_eq!(start.terminal(), Some(7));

        let end = ClusterLinks {
            traits: ClusterTraits::END,
            prev: 2,
            next: NULL_CLUSTER,
        };
        assert_eq!(end.terminal(), Some(NULL_CLUSTER));

        let middle = ClusterLinks {
            traits: ClusterTraits::empty(),
            prev: 1,
            next: 2,
        };
        assert_eq!(middle.terminal(), None);
    }

    #[test]
    fn cluster_image_layout() {
        let mut cluster = Cluster::new(4);
        cluster.traits = ClusterTraits::START | ClusterTraits::END;
        cluster.prev = NULL_CLUSTER;
        cluster.next = NULL_CLUSTER;
        cluster.data.copy_from_slice(b"abcd");

        let bytes = cluster.to_bytes();
        assert_eq!(bytes.len(), CLUSTER_HEADER_SIZE + 4);
        assert_eq!(bytes[0], 0b11);
        assert_eq!(&bytes[1..9], &[0xFF; 8]);
        assert_eq!(&bytes[17..], b"abcd");
        assert_eq!(Cluster::from_bytes(&bytes, 4).unwrap(), cluster);
    }

    #[test]
    fn unknown_trait_bits_are_corruption() {
        let mut bytes = [0u8; CLUSTER_HEADER_SIZE];
        bytes[0] = 0x80;
        assert!(matches!(
            ClusterLinks::from_bytes(&bytes),
            Err(StorageError::Corruption(_))
        ));
    }
}
