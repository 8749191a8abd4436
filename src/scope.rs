use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::warn;

use crate::medium::{BackingMedium, OpenMode};
use crate::record::StreamRecord;
use crate::storage::ClusteredStorage;
use crate::StorageError;

/// A read or write view of one record's stream.
///
/// Holds a cursor for the `Read`/`Write`/`Seek` impls; `read_at` and
/// `write_at` ignore it. Key, checksum and null changes are buffered and
/// written to the record when the scope closes. Dropping an unclosed scope
/// closes it and logs any failure.
pub struct StreamScope<'a, M: BackingMedium> {
    storage: &'a ClusteredStorage<M>,
    id: u64,
    index: u64,
    mode: OpenMode,
    position: u64,
    closed: bool,
}

impl<'a, M: BackingMedium> StreamScope<'a, M> {
    pub(crate) fn new(storage: &'a ClusteredStorage<M>, id: u64, index: u64, mode: OpenMode) -> Self {
        StreamScope {
            storage,
            id,
            index,
            mode,
            position: 0,
            closed: false,
        }
    }

    /// Index of the record this scope is bound to.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> Result<u64, StorageError> {
        self.storage.scope_len(self.id)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Resize the stream. The cursor is left where it is, even past the end.
    pub fn set_len(&mut self, len: u64) -> Result<(), StorageError> {
        self.storage.scope_set_len(self.id, len)
    }

    /// The record as it will be persisted when the scope closes.
    pub fn record(&self) -> Result<StreamRecord, StorageError> {
        self.storage.scope_record(self.id)
    }

    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.storage.scope_read(self.id, position, buf)
    }

    /// Write `data` at `position`, growing the stream when the write runs
    /// past its end.
    pub fn write_at(&mut self, position: u64, data: &[u8]) -> Result<(), StorageError> {
        self.storage.scope_write(self.id, position, data)
    }

    /// The whole stream.
    pub fn read_to_vec(&self) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0u8; self.len()? as usize];
        let n = self.read_at(0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn set_key(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.storage.scope_set_key(self.id, key)
    }

    pub fn set_key_checksum(&mut self, checksum: u32) -> Result<(), StorageError> {
        self.storage.scope_set_key_checksum(self.id, checksum)
    }

    pub fn set_null(&mut self, null: bool) -> Result<(), StorageError> {
        self.storage.scope_set_null(self.id, null)
    }

    /// Persist pending record changes and release the record lock.
    pub fn close(mut self) -> Result<(), StorageError> {
        self.closed = true;
        self.storage.close_scope(self.id)
    }
}

impl<M: BackingMedium> Read for StreamScope<'_, M> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.storage.scope_read(self.id, self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<M: BackingMedium> Write for StreamScope<'_, M> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.storage.scope_write(self.id, self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.storage.flush()?;
        Ok(())
    }
}

impl<M: BackingMedium> Seek for StreamScope<'_, M> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(n) => {
                self.position = n;
                return Ok(n);
            }
            SeekFrom::End(offset) => (self.len()?, offset),
            SeekFrom::Current(offset) => (self.position, offset),
        };
        let target = base.checked_add_signed(offset).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {}{:+} is out of range", base, offset),
            )
        })?;
        self.position = target;
        Ok(target)
    }
}

impl<M: BackingMedium> Drop for StreamScope<'_, M> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.storage.close_scope(self.id) {
                warn!(index = self.index, scope = self.id, error = %e, "failed to close stream scope on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::StoragePolicy;
    use crate::storage::StorageOptions;

    fn storage(cs: u32) -> ClusteredStorage<crate::MemoryMedium> {
        ClusteredStorage::in_memory(StorageOptions {
            cluster_size: cs,
            policy: StoragePolicy::TRACK_KEY | StoragePolicy::TRACK_CHECKSUMS,
            record_key_size: 4,
            ..StorageOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn io_traits_follow_cursor() {
        let st = storage(16);
        let mut scope = st.add().unwrap();
        scope.write_all(b"hello, clustered world").unwrap();
        assert_eq!(scope.position(), 22);
        assert_eq!(scope.seek(SeekFrom::End(-5)).unwrap(), 17);
        let mut tail = String::new();
        scope.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "world");
        assert!(scope.seek(SeekFrom::Current(-100)).is_err());
        scope.close().unwrap();
    }

    #[test]
    fn write_past_end_zero_fills_gap() {
        let st = storage(8);
        let mut scope = st.add().unwrap();
        scope.seek(SeekFrom::Start(10)).unwrap();
        scope.write_all(b"xy").unwrap();
        assert_eq!(scope.read_to_vec().unwrap(), [&[0u8; 10][..], b"xy"].concat());
        scope.close().unwrap();
        assert_eq!(st.record(0).unwrap().size, 12);
    }

    #[test]
    fn write_at_max_offset_is_rejected() {
        let st = storage(16);
        let mut scope = st.add().unwrap();
        scope.write_all(b"abc").unwrap();
        assert_eq!(scope.seek(SeekFrom::Start(u64::MAX)).unwrap(), u64::MAX);
        assert!(scope.write(b"x").is_err());
        assert_eq!(scope.position(), u64::MAX);
        assert!(matches!(
            scope.write_at(u64::MAX, b"xy"),
            Err(StorageError::OutOfBounds(_))
        ));
        assert!(matches!(
            scope.write_at(u64::MAX - 1, b""),
            Err(StorageError::OutOfBounds(_))
        ));
        assert_eq!(scope.read_to_vec().unwrap(), b"abc".to_vec());
        scope.close().unwrap();
        assert!(st.verify().unwrap().is_empty());
    }

    #[test]
    fn key_is_persisted_on_close() {
        let st = storage(16);
        let mut scope = st.add().unwrap();
        scope.set_key(b"abcd").unwrap();
        assert!(scope.set_key(b"abc").is_err());
        assert_eq!(st.record(0).unwrap().key, vec![0; 4]);
        assert_eq!(scope.record().unwrap().key, b"abcd".to_vec());
        scope.close().unwrap();

        let record = st.record(0).unwrap();
        assert_eq!(record.key, b"abcd".to_vec());
        assert_eq!(record.key_checksum, crate::record::key_checksum(b"abcd"));
    }

    #[test]
    fn read_scope_rejects_mutation() {
        let st = storage(16);
        st.add().unwrap().close().unwrap();
        let mut scope = st.open_read(0).unwrap();
        assert!(matches!(scope.set_len(3), Err(StorageError::ReadOnly(_))));
        assert!(scope.write(b"x").is_err());
        assert!(matches!(scope.set_null(true), Err(StorageError::ReadOnly(_))));
    }

    #[test]
    fn drop_releases_lock() {
        let st = storage(16);
        st.add().unwrap().close().unwrap();
        {
            let _writer = st.open_write(0).unwrap();
            assert!(matches!(st.open_read(0), Err(StorageError::LockConflict(_))));
        }
        assert_eq!(st.open_scope_count(), 0);
        st.open_write(0).unwrap().close().unwrap();
    }
}
