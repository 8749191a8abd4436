use crate::StorageError;

/// How a backing medium is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Backing medium abstraction.
///
/// A seekable, resizable byte sink holding the whole storage:
/// `[256-byte header][cluster array]`. The cluster map and the header codec
/// are the only components that touch it directly.
///
/// All methods take `&self` (not `&mut self`) so that one medium can be read
/// from several threads while the storage holds only a read lock.
/// Implementations use interior mutability to protect their state.
pub trait BackingMedium: Send + Sync {
    /// Read bytes at the given absolute offset.
    /// Returns the number of bytes actually read (short at end of medium).
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Read exactly `buf.len()` bytes at the given offset.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(offset + done as u64, &mut buf[done..])?;
            if n == 0 {
                return Err(StorageError::Io(format!(
                    "unexpected end of medium reading {} bytes at offset {}",
                    buf.len(),
                    offset
                )));
            }
            done += n;
        }
        Ok(())
    }

    /// Write bytes at the given absolute offset, growing the medium if needed.
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    /// Current length in bytes.
    fn len(&self) -> Result<u64, StorageError>;

    /// Check whether the medium is empty (length == 0).
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Set the medium length. Growth must zero-fill the new bytes.
    fn set_len(&self, len: u64) -> Result<(), StorageError>;

    /// Flush buffered writes to durable storage. No-op by default.
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
