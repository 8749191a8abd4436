mod cluster;
mod cluster_map;
mod error;
mod file_medium;
mod fragment_provider;
mod header;
mod medium;
mod memory_medium;
mod observer;
mod record;
mod record_table;
mod scope;
mod seeker;
mod serializer;
mod storage;
mod verify;

pub use cluster::{Cluster, ClusterId, ClusterLinks, ClusterTraits, CLUSTER_HEADER_SIZE, NULL_CLUSTER};
pub use cluster_map::{ClusterMap, ClusterMapListener, ClusterMove, NoopListener};
pub use error::StorageError;
pub use file_medium::FileMedium;
pub use fragment_provider::{FragmentProvider, StreamListener};
pub use header::{StorageHeader, StoragePolicy, HEADER_SIZE};
pub use medium::{BackingMedium, OpenMode};
pub use memory_medium::MemoryMedium;
pub use observer::{StorageEvent, StorageObserver};
pub use record::{key_checksum, RecordLayout, RecordTraits, StreamRecord};
pub use record_table::{RecordPatch, RecordTable};
pub use scope::StreamScope;
pub use seeker::{ClusterSeeker, SeekPosition};
pub use serializer::{BytesSerializer, ItemSerializer, StringSerializer};
pub use storage::{ClusteredStorage, StorageOptions, DEFAULT_CACHE_CAPACITY, DEFAULT_CLUSTER_SIZE};
pub use verify::{assert_structure, summarize_chains, verify_structure, ChainSummary};

/// Storage held entirely in memory.
pub type MemoryStorage = ClusteredStorage<MemoryMedium>;

/// Storage backed by a file on disk.
pub type FileStorage = ClusteredStorage<FileMedium>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn options(cs: u32) -> StorageOptions {
        StorageOptions {
            cluster_size: cs,
            ..StorageOptions::default()
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn add_bytes(st: &MemoryStorage, data: &[u8]) -> u64 {
        let mut scope = st.add().unwrap();
        let index = scope.index();
        scope.write_all(data).unwrap();
        scope.close().unwrap();
        index
    }

    fn read_bytes(st: &MemoryStorage, index: u64) -> Vec<u8> {
        let scope = st.open_read(index).unwrap();
        let data = scope.read_to_vec().unwrap();
        scope.close().unwrap();
        data
    }

    fn assert_clean(st: &MemoryStorage) {
        let issues = st.verify().unwrap();
        assert!(issues.is_empty(), "verifier issues: {:?}", issues);
    }

    #[test]
    fn test_round_trip_at_cluster_boundaries() {
        let st = MemoryStorage::in_memory(options(32)).unwrap();
        let lengths = [0usize, 1, 31, 32, 33, 100, 257];
        for (i, len) in lengths.iter().enumerate() {
            add_bytes(&st, &pattern(*len, i as u8));
        }
        for (i, len) in lengths.iter().enumerate() {
            assert_eq!(read_bytes(&st, i as u64), pattern(*len, i as u8));
            assert_eq!(st.record(i as u64).unwrap().size, *len as u64);
        }
        assert_clean(&st);
    }

    #[test]
    fn test_grow_then_shrink() {
        let st = MemoryStorage::in_memory(options(32)).unwrap();
        let data = pattern(100, 7);
        add_bytes(&st, &data);
        // One record cluster plus four data clusters.
        assert_eq!(st.cluster_count(), 5);

        let mut scope = st.open_write(0).unwrap();
        scope.set_len(10).unwrap();
        assert_eq!(scope.len().unwrap(), 10);
        scope.close().unwrap();

        assert_eq!(st.cluster_count(), 2);
        assert_eq!(read_bytes(&st, 0), data[..10].to_vec());

        // Regrowing exposes zeros, not the old bytes.
        let mut scope = st.open_write(0).unwrap();
        scope.set_len(40).unwrap();
        scope.close().unwrap();
        let regrown = read_bytes(&st, 0);
        assert_eq!(&regrown[..10], &data[..10]);
        assert!(regrown[10..].iter().all(|b| *b == 0));
        assert_clean(&st);
    }

    #[test]
    fn test_swap_exchanges_streams() {
        let st = MemoryStorage::in_memory(options(4)).unwrap();
        add_bytes(&st, b"AAAA");
        add_bytes(&st, b"BBBBBBBB");

        let scope = st.open_read(0).unwrap();
        assert!(matches!(st.swap(0, 1), Err(StorageError::ScopesOpen(_))));
        scope.close().unwrap();

        st.swap(0, 1).unwrap();
        assert_eq!(read_bytes(&st, 0), b"BBBBBBBB".to_vec());
        assert_eq!(read_bytes(&st, 1), b"AAAA".to_vec());
        assert_clean(&st);
    }

    #[test]
    fn test_remove_releases_chain() {
        let st = MemoryStorage::in_memory(options(32)).unwrap();
        add_bytes(&st, &pattern(10, 1));
        add_bytes(&st, &pattern(96, 2));
        add_bytes(&st, &pattern(40, 3));
        // Records: 75 bytes (3 clusters). Streams: 1 + 3 + 2.
        assert_eq!(st.cluster_count(), 9);

        st.remove(1).unwrap();
        assert_eq!(st.count(), 2);
        assert_eq!(st.cluster_count(), 5);
        assert_eq!(read_bytes(&st, 0), pattern(10, 1));
        assert_eq!(read_bytes(&st, 1), pattern(40, 3));
        assert!(matches!(st.remove(2), Err(StorageError::OutOfBounds(_))));
        assert_clean(&st);
    }

    #[test]
    fn test_insert_shifts_records() {
        let st = MemoryStorage::in_memory(StorageOptions {
            reserved_records: 1,
            ..options(16)
        })
        .unwrap();
        assert_eq!(st.count(), 1);
        add_bytes(&st, b"first stream");
        add_bytes(&st, b"second stream, longer than a cluster");

        let mut scope = st.insert(2).unwrap();
        scope.write_all(b"inserted").unwrap();
        scope.close().unwrap();

        assert_eq!(st.count(), 4);
        assert_eq!(read_bytes(&st, 1), b"first stream".to_vec());
        assert_eq!(read_bytes(&st, 2), b"inserted".to_vec());
        assert_eq!(read_bytes(&st, 3), b"second stream, longer than a cluster".to_vec());
        assert!(matches!(st.insert(0), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(st.remove(0), Err(StorageError::InvalidArgument(_))));
        assert_clean(&st);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let st = MemoryStorage::in_memory(StorageOptions {
            reserved_records: 2,
            ..options(32)
        })
        .unwrap();
        add_bytes(&st, &pattern(300, 9));
        st.clear().unwrap();
        let once = st.header();
        st.clear().unwrap();
        assert_eq!(st.header(), once);
        assert_eq!(st.count(), 2);
        // Two empty records of 25 bytes fill two clusters.
        assert_eq!(st.cluster_count(), 2);
        assert!(st.record(1).unwrap().is_empty());
        assert_clean(&st);
    }

    #[test]
    fn test_reload_from_medium() {
        let st = MemoryStorage::in_memory(StorageOptions {
            policy: StoragePolicy::TRACK_KEY | StoragePolicy::TRACK_CHECKSUMS,
            record_key_size: 8,
            ..options(64)
        })
        .unwrap();
        let mut scope = st.add().unwrap();
        scope.write_all(&pattern(500, 4)).unwrap();
        scope.set_key(b"key-0001").unwrap();
        scope.close().unwrap();
        add_bytes(&st, b"short");
        st.set_merkle_root([7u8; 32]).unwrap();
        let header = st.header();

        let medium = st.into_medium().unwrap();
        let reopened = MemoryStorage::load(medium, StorageOptions::default()).unwrap();
        assert_eq!(reopened.header(), header);
        assert_eq!(reopened.cluster_size(), 64);
        assert_eq!(read_bytes(&reopened, 0), pattern(500, 4));
        assert_eq!(read_bytes(&reopened, 1), b"short".to_vec());
        assert_eq!(reopened.record(0).unwrap().key, b"key-0001".to_vec());
        assert_eq!(reopened.merkle_root(), [7u8; 32]);
        assert_clean(&reopened);
    }

    #[test]
    fn test_file_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.cls");
        {
            let st = FileStorage::create_file(&path, options(128)).unwrap();
            st.add_item(Some(&"hello, file".to_string()), &StringSerializer)
                .unwrap();
            st.add_item::<String, _>(None, &StringSerializer).unwrap();
            st.flush().unwrap();
        }
        assert!(FileStorage::create_file(&path, options(128)).is_err());
        {
            let st = FileStorage::open_file(&path, OpenMode::Read, StorageOptions::default()).unwrap();
            assert_eq!(st.count(), 2);
            assert_eq!(
                st.load_item(0, &StringSerializer).unwrap(),
                Some("hello, file".to_string())
            );
            assert_eq!(st.load_item(1, &StringSerializer).unwrap(), None);
            assert!(st.verify().unwrap().is_empty());
            assert!(matches!(st.add(), Err(StorageError::ReadOnly(_))));
        }
    }

    #[test]
    fn test_item_helpers() {
        let st = MemoryStorage::in_memory(StorageOptions {
            policy: StoragePolicy::FAST_ALLOCATE | StoragePolicy::CACHE_RECORDS,
            ..options(8)
        })
        .unwrap();
        let index = st.add_item(Some(&b"0123456789abcdef".to_vec()), &BytesSerializer).unwrap();
        st.save_item(index, Some(&b"tiny".to_vec()), &BytesSerializer).unwrap();
        assert_eq!(
            st.load_item(index, &BytesSerializer).unwrap(),
            Some(b"tiny".to_vec())
        );

        let mut scope = st
            .enter_save_item_scope(index, None::<&Vec<u8>>, &BytesSerializer)
            .unwrap();
        assert!(scope.record().unwrap().is_null());
        scope.set_null(false).unwrap();
        scope.close().unwrap();

        let (item, scope) = st.enter_load_item_scope(index, &BytesSerializer).unwrap();
        assert_eq!(item, Some(Vec::new()));
        assert!(matches!(st.open_write(index), Err(StorageError::LockConflict(_))));
        scope.close().unwrap();
        assert_clean(&st);
    }

    #[test]
    fn test_observer_sees_events() {
        let st = MemoryStorage::in_memory(options(16)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        st.set_observer(Some(Box::new(move |event: &StorageEvent| {
            sink.lock().push(event.clone())
        })));

        add_bytes(&st, b"twenty bytes of data");
        {
            let events = log.lock();
            assert!(events.contains(&StorageEvent::RecordAdded(0)));
            assert!(events.contains(&StorageEvent::StreamLengthChanged {
                terminal: 0,
                old_len: 0,
                new_len: 20,
            }));
            assert!(events.contains(&StorageEvent::ChainCreated {
                terminal: NULL_CLUSTER,
                start: 0,
                end: 0,
            }));
        }

        // Structural operations report only their own outcome.
        log.lock().clear();
        st.insert(0).unwrap().close().unwrap();
        assert_eq!(*log.lock(), vec![StorageEvent::RecordInserted(0)]);
    }

    /// Memory medium whose resizes fail while `fail` is set.
    struct FlakyMedium {
        inner: MemoryMedium,
        fail: Arc<AtomicBool>,
    }

    impl BackingMedium for FlakyMedium {
        fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
            self.inner.read(offset, buf)
        }

        fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
            self.inner.write(offset, data)
        }

        fn len(&self) -> Result<u64, StorageError> {
            self.inner.len()
        }

        fn set_len(&self, len: u64) -> Result<(), StorageError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StorageError::Io(format!("injected failure resizing to {}", len)));
            }
            self.inner.set_len(len)
        }
    }

    #[test]
    fn test_failed_insert_restores_cluster_events() {
        let fail = Arc::new(AtomicBool::new(false));
        let medium = FlakyMedium {
            inner: MemoryMedium::new(),
            fail: Arc::clone(&fail),
        };
        let st = ClusteredStorage::load(medium, options(16)).unwrap();
        st.add().unwrap().close().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        st.set_observer(Some(Box::new(move |event: &StorageEvent| {
            sink.lock().push(event.clone())
        })));

        // Growing the record chain needs new clusters, so the insert fails
        // before touching any record.
        fail.store(true, Ordering::SeqCst);
        assert!(matches!(st.insert(0), Err(StorageError::Io(_))));
        fail.store(false, Ordering::SeqCst);
        assert_eq!(st.count(), 1);
        assert_eq!(st.open_scope_count(), 0);

        log.lock().clear();
        let mut scope = st.add().unwrap();
        scope.write_all(b"after the failure").unwrap();
        scope.close().unwrap();
        let events = log.lock();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, StorageEvent::ClusterCountChanged { .. })),
            "cluster events still suppressed: {:?}",
            *events
        );
        assert!(events.contains(&StorageEvent::RecordAdded(1)));
        drop(events);

        let issues = st.verify().unwrap();
        assert!(issues.is_empty(), "verifier issues: {:?}", issues);
    }

    #[test]
    fn test_load_rejects_overflowing_header_counts() {
        let st = MemoryStorage::in_memory(options(16)).unwrap();
        add_bytes(&st, &pattern(40, 2));
        let bytes = st.into_medium().unwrap().to_bytes();

        let corrupt = |offset: usize, value: u64| {
            let mut bytes = bytes.clone();
            bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
            MemoryStorage::load(MemoryMedium::from_bytes(bytes), StorageOptions::default())
        };
        // records_count lives at byte 5, total_clusters at byte 35.
        for value in [u64::MAX, u64::MAX / 2, 1 << 62] {
            assert!(matches!(corrupt(5, value), Err(StorageError::Corruption(_))));
            assert!(matches!(corrupt(35, value), Err(StorageError::Corruption(_))));
        }
        assert!(matches!(corrupt(35, 1 << 40), Err(StorageError::Corruption(_))));
        assert!(MemoryStorage::load(MemoryMedium::from_bytes(bytes), StorageOptions::default()).is_ok());
    }

    #[test]
    fn test_integrity_checks_policy() {
        let st = MemoryStorage::in_memory(StorageOptions {
            policy: StoragePolicy::INTEGRITY_CHECKS
                | StoragePolicy::CACHE_RECORD_CLUSTERS
                | StoragePolicy::CACHE_RECORDS,
            cache_capacity: 8,
            ..options(16)
        })
        .unwrap();
        for i in 0..6 {
            add_bytes(&st, &pattern(i * 13, i as u8));
        }
        st.remove(2).unwrap();
        st.swap(0, 4).unwrap();
        st.insert(3).unwrap().close().unwrap();
        st.check_integrity().unwrap();
        assert!(matches!(st.optimize(), Err(StorageError::Unsupported(_))));
    }

    #[test]
    fn test_concurrent_readers() {
        let st = MemoryStorage::in_memory(options(32)).unwrap();
        let data = pattern(1000, 5);
        add_bytes(&st, &data);
        add_bytes(&st, &pattern(10, 6));

        std::thread::scope(|s| {
            for t in 0..4 {
                let st = &st;
                let data = &data;
                s.spawn(move || {
                    for _ in 0..20 {
                        let mut scope = st.open_read(t % 2).unwrap();
                        let mut buf = Vec::new();
                        scope.read_to_end(&mut buf).unwrap();
                        if t % 2 == 0 {
                            assert_eq!(&buf, data);
                        } else {
                            assert_eq!(buf.len(), 10);
                        }
                        scope.close().unwrap();
                    }
                });
            }
        });
        assert_eq!(st.open_scope_count(), 0);
    }

    #[test]
    fn test_random_operations_keep_structure_valid() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let st = MemoryStorage::in_memory(options(16)).unwrap();
        let mut model: Vec<Vec<u8>> = Vec::new();

        for step in 0..300 {
            let op = if model.is_empty() { 0 } else { rng.gen_range(0..5) };
            match op {
                0 => {
                    let data = pattern(rng.gen_range(0..120), step as u8);
                    add_bytes(&st, &data);
                    model.push(data);
                }
                1 => {
                    let i = rng.gen_range(0..model.len());
                    let new_len = rng.gen_range(0..120);
                    let mut scope = st.open_write(i as u64).unwrap();
                    scope.set_len(new_len as u64).unwrap();
                    model[i].resize(new_len, 0);
                    if new_len > 0 {
                        let pos = rng.gen_range(0..new_len);
                        let patch = pattern(rng.gen_range(1..40), step as u8);
                        scope.write_at(pos as u64, &patch).unwrap();
                        let end = pos + patch.len();
                        if end > model[i].len() {
                            model[i].resize(end, 0);
                        }
                        model[i][pos..end].copy_from_slice(&patch);
                    }
                    scope.close().unwrap();
                }
                2 => {
                    let i = rng.gen_range(0..model.len());
                    st.remove(i as u64).unwrap();
                    model.remove(i);
                }
                3 => {
                    let a = rng.gen_range(0..model.len());
                    let b = rng.gen_range(0..model.len());
                    st.swap(a as u64, b as u64).unwrap();
                    model.swap(a, b);
                }
                _ => {
                    let i = rng.gen_range(0..=model.len());
                    let data = pattern(rng.gen_range(0..60), step as u8);
                    let mut scope = st.insert(i as u64).unwrap();
                    scope.write_all(&data).unwrap();
                    scope.close().unwrap();
                    model.insert(i, data);
                }
            }
            assert_clean(&st);
        }

        assert_eq!(st.count(), model.len() as u64);
        for (i, data) in model.iter().enumerate() {
            assert_eq!(&read_bytes(&st, i as u64), data, "record {}", i);
        }
    }
}
