use parking_lot::Mutex;

use crate::medium::BackingMedium;
use crate::StorageError;

/// In-memory backing medium. Used for tests and for transient storages.
#[derive(Default)]
pub struct MemoryMedium {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing image, e.g. bytes previously taken with `to_bytes`.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        MemoryMedium {
            bytes: Mutex::new(bytes),
        }
    }

    /// Copy of the current contents.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl BackingMedium for MemoryMedium {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let bytes = self.bytes.lock();
        let len = bytes.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut bytes = self.bytes.lock();
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> Result<u64, StorageError> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<(), StorageError> {
        self.bytes.lock().resize(len as usize, 0);
        Ok(())
    }
}
