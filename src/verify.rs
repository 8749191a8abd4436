//! Diagnostics verifier.
//!
//! A pure check of every structural invariant over a snapshot of the
//! cluster array and, optionally, the record array. Not used on the hot
//! path: the façade calls it from `verify`, and after each structural
//! operation when the storage policy asks for integrity checks.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::cluster::{Cluster, ClusterId, ClusterTraits, NULL_CLUSTER};
use crate::record::StreamRecord;
use crate::StorageError;

/// Boundaries and length of one chain found by walking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSummary {
    pub start: ClusterId,
    pub end: ClusterId,
    pub length: u64,
}

/// Walk every chain in `clusters`, keyed by terminal. Chains that cannot be
/// walked cleanly are left out; `verify_structure` reports why.
pub fn summarize_chains(clusters: &[Cluster]) -> BTreeMap<ClusterId, ChainSummary> {
    let mut issues = Vec::new();
    walk_chains(clusters, &mut issues)
}

/// Check the cluster array (and the records, when given) and return one
/// line per violated invariant. An empty list means the structure is sound.
pub fn verify_structure(clusters: &[Cluster], records: Option<&[StreamRecord]>) -> Vec<String> {
    let mut issues = Vec::new();
    check_links(clusters, &mut issues);
    let chains = walk_chains(clusters, &mut issues);
    if let Some(records) = records {
        let cluster_size = clusters.first().map(|c| c.data.len() as u64);
        check_records(clusters.len(), &chains, records, cluster_size, &mut issues);
    }
    issues
}

/// `verify_structure`, failing with `StorageError::Integrity` on any issue.
pub fn assert_structure(
    clusters: &[Cluster],
    records: Option<&[StreamRecord]>,
) -> Result<(), StorageError> {
    let issues = verify_structure(clusters, records);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(StorageError::Integrity(issues))
    }
}

fn in_range(id: ClusterId, count: usize) -> bool {
    id >= 0 && (id as u64) < count as u64
}

/// Pointer reciprocity, self-loops, and terminal uniqueness and pairing.
fn check_links(clusters: &[Cluster], issues: &mut Vec<String>) {
    let count = clusters.len();
    let mut starts: HashMap<ClusterId, ClusterId> = HashMap::new();
    let mut ends: HashMap<ClusterId, ClusterId> = HashMap::new();

    for (i, cluster) in clusters.iter().enumerate() {
        let id = i as ClusterId;

        if cluster.traits.contains(ClusterTraits::START) {
            if let Some(other) = starts.insert(cluster.prev, id) {
                issues.push(format!(
                    "terminal {} starts two chains (clusters {} and {})",
                    cluster.prev, other, id
                ));
            }
        } else if cluster.prev == id {
            issues.push(format!("cluster {} prev points to itself", id));
        } else if !in_range(cluster.prev, count) {
            issues.push(format!(
                "cluster {} prev {} is out of range",
                id, cluster.prev
            ));
        } else {
            let prev = &clusters[cluster.prev as usize];
            if prev.traits.contains(ClusterTraits::END) || prev.next != id {
                issues.push(format!(
                    "cluster {} prev {} does not link forward to it",
                    id, cluster.prev
                ));
            }
        }

        if cluster.traits.contains(ClusterTraits::END) {
            if let Some(other) = ends.insert(cluster.next, id) {
                issues.push(format!(
                    "terminal {} ends two chains (clusters {} and {})",
                    cluster.next, other, id
                ));
            }
        } else if cluster.next == id {
            issues.push(format!("cluster {} next points to itself", id));
        } else if !in_range(cluster.next, count) {
            issues.push(format!(
                "cluster {} next {} is out of range",
                id, cluster.next
            ));
        } else {
            let next = &clusters[cluster.next as usize];
            if next.traits.contains(ClusterTraits::START) || next.prev != id {
                issues.push(format!(
                    "cluster {} next {} does not link back to it",
                    id, cluster.next
                ));
            }
        }
    }

    let mut unpaired: Vec<String> = starts
        .keys()
        .filter(|t| !ends.contains_key(t))
        .map(|t| format!("chain with terminal {} has a start but no end", t))
        .chain(
            ends.keys()
                .filter(|t| !starts.contains_key(t))
                .map(|t| format!("chain with terminal {} has an end but no start", t)),
        )
        .collect();
    unpaired.sort();
    issues.extend(unpaired);
}

/// Walk every chain from its start. Reports cycles, broken walks, and
/// clusters reached by no chain or by more than one.
fn walk_chains(
    clusters: &[Cluster],
    issues: &mut Vec<String>,
) -> BTreeMap<ClusterId, ChainSummary> {
    let count = clusters.len();
    let starts: BTreeMap<ClusterId, ClusterId> = clusters
        .iter()
        .enumerate()
        .filter(|(_, c)| c.traits.contains(ClusterTraits::START))
        .map(|(i, c)| (c.prev, i as ClusterId))
        .collect();

    let mut owner: Vec<Option<ClusterId>> = vec![None; count];
    let mut chains = BTreeMap::new();

    for (&terminal, &start) in &starts {
        let mut visited = HashSet::new();
        let mut current = start;
        let mut length = 0u64;
        loop {
            if !visited.insert(current) {
                issues.push(format!(
                    "chain {} revisits cluster {} (cycle)",
                    terminal, current
                ));
                break;
            }
            match owner[current as usize] {
                Some(other) => issues.push(format!(
                    "cluster {} is reached from chains {} and {}",
                    current, other, terminal
                )),
                None => owner[current as usize] = Some(terminal),
            }
            length += 1;

            let cluster = &clusters[current as usize];
            if cluster.traits.contains(ClusterTraits::END) {
                if cluster.next != terminal {
                    issues.push(format!(
                        "chain {} ends at cluster {} carrying terminal {}",
                        terminal, current, cluster.next
                    ));
                } else {
                    chains.insert(
                        terminal,
                        ChainSummary {
                            start,
                            end: current,
                            length,
                        },
                    );
                }
                break;
            }
            let next = cluster.next;
            if next == current || !in_range(next, count) {
                issues.push(format!(
                    "chain {} breaks off at cluster {}",
                    terminal, current
                ));
                break;
            }
            if clusters[next as usize].traits.contains(ClusterTraits::START) {
                issues.push(format!(
                    "chain {} runs into the start of another chain at cluster {}",
                    terminal, next
                ));
                break;
            }
            current = next;
        }
    }

    for (id, owner) in owner.iter().enumerate() {
        if owner.is_none() {
            issues.push(format!("cluster {} belongs to no chain", id));
        }
    }
    chains
}

fn check_records(
    cluster_count: usize,
    chains: &BTreeMap<ClusterId, ChainSummary>,
    records: &[StreamRecord],
    cluster_size: Option<u64>,
    issues: &mut Vec<String>,
) {
    let mut seen_starts: HashMap<ClusterId, usize> = HashMap::new();
    let mut seen_ends: HashMap<ClusterId, usize> = HashMap::new();

    for (index, record) in records.iter().enumerate() {
        let start_null = record.start == NULL_CLUSTER;
        let end_null = record.end == NULL_CLUSTER;
        if start_null != end_null {
            issues.push(format!(
                "record {} has start {} but end {}",
                index, record.start, record.end
            ));
            continue;
        }
        if (record.size == 0) != start_null {
            issues.push(format!(
                "record {} has size {} with start {}",
                index, record.size, record.start
            ));
            continue;
        }
        if start_null {
            continue;
        }
        if !in_range(record.start, cluster_count) || !in_range(record.end, cluster_count) {
            issues.push(format!(
                "record {} references clusters {}..{} out of range",
                index, record.start, record.end
            ));
            continue;
        }
        if let Some(other) = seen_starts.insert(record.start, index) {
            issues.push(format!(
                "records {} and {} share start cluster {}",
                other, index, record.start
            ));
        }
        if let Some(other) = seen_ends.insert(record.end, index) {
            issues.push(format!(
                "records {} and {} share end cluster {}",
                other, index, record.end
            ));
        }

        match chains.get(&(index as ClusterId)) {
            None => issues.push(format!(
                "record {} is not reachable through any chain",
                index
            )),
            Some(chain) => {
                if chain.start != record.start || chain.end != record.end {
                    issues.push(format!(
                        "record {} spans {}..{} but its chain spans {}..{}",
                        index, record.start, record.end, chain.start, chain.end
                    ));
                }
                if let Some(cs) = cluster_size {
                    let expected = record.size.div_ceil(cs);
                    if chain.length != expected {
                        issues.push(format!(
                            "record {} of {} bytes owns {} clusters, expected {}",
                            index, record.size, chain.length, expected
                        ));
                    }
                }
            }
        }
    }

    for &terminal in chains.keys() {
        if terminal == NULL_CLUSTER {
            continue;
        }
        if terminal < 0 || terminal as usize >= records.len() {
            issues.push(format!("chain {} has no record", terminal));
        } else if records[terminal as usize].is_empty() {
            issues.push(format!(
                "chain {} belongs to empty record {}",
                terminal, terminal
            ));
        }
    }
}
