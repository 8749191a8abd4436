use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use parking_lot::Mutex;

use crate::medium::{BackingMedium, OpenMode};
use crate::StorageError;

/// Backing medium that wraps a real file on disk.
///
/// Creates or opens a single file, acquires a process-level lock (shared for
/// readers, exclusive for writers) and provides random-access I/O.
pub struct FileMedium {
    state: Mutex<fs::File>,
    mode: OpenMode,
}

impl FileMedium {
    /// Create a new, empty storage file. Fails if the path already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(StorageError::InvalidArgument(format!(
                "file already exists: {}",
                path.display()
            )));
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| StorageError::Io(format!("failed to create storage file: {}", e)))?;

        FileExt::try_lock_exclusive(&file).map_err(|e| {
            StorageError::Io(format!("storage file is locked by another process: {}", e))
        })?;

        Ok(FileMedium {
            state: Mutex::new(file),
            mode: OpenMode::Write,
        })
    }

    /// Open an existing storage file.
    ///
    /// Acquires a shared process lock for `Read` mode or an exclusive lock
    /// for `Write` mode.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self, StorageError> {
        let file = match mode {
            OpenMode::Read => fs::OpenOptions::new().read(true).open(path.as_ref()),
            OpenMode::Write => fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path.as_ref()),
        }
        .map_err(|e| StorageError::Io(format!("failed to open storage file: {}", e)))?;

        // Acquire process lock: shared for readers, exclusive for writers
        match mode {
            OpenMode::Read => FileExt::try_lock_shared(&file).map_err(|e| {
                StorageError::Io(format!("storage file is locked by another process: {}", e))
            })?,
            OpenMode::Write => FileExt::try_lock_exclusive(&file).map_err(|e| {
                StorageError::Io(format!("storage file is locked by another process: {}", e))
            })?,
        };

        Ok(FileMedium {
            state: Mutex::new(file),
            mode,
        })
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    fn ensure_writable(&self) -> Result<(), StorageError> {
        if self.mode == OpenMode::Read {
            return Err(StorageError::ReadOnly(
                "storage file was opened for reading".to_string(),
            ));
        }
        Ok(())
    }
}

impl BackingMedium for FileMedium {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let mut file = self.state.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut done = 0;
        while done < buf.len() {
            let n = file.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.ensure_writable()?;
        let mut file = self.state.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> Result<u64, StorageError> {
        let file = self.state.lock();
        Ok(file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<(), StorageError> {
        self.ensure_writable()?;
        let file = self.state.lock();
        file.set_len(len)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        if self.mode == OpenMode::Read {
            return Ok(());
        }
        let file = self.state.lock();
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exists.cls");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            FileMedium::create(&path),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn read_write_and_resize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("medium.cls");
        let medium = FileMedium::create(&path).unwrap();
        assert!(medium.is_empty().unwrap());

        medium.write(10, b"hello").unwrap();
        assert_eq!(medium.len().unwrap(), 15);

        let mut buf = [0xFFu8; 15];
        medium.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..10], &[0u8; 10]);
        assert_eq!(&buf[10..], b"hello");

        medium.set_len(12).unwrap();
        let mut tail = [0u8; 8];
        assert_eq!(medium.read(10, &mut tail).unwrap(), 2);
        assert!(medium.read_exact_at(10, &mut tail).is_err());
    }

    #[test]
    fn read_mode_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.cls");
        {
            let medium = FileMedium::create(&path).unwrap();
            medium.write(0, b"abc").unwrap();
        }
        let medium = FileMedium::open(&path, OpenMode::Read).unwrap();
        let mut buf = [0u8; 3];
        medium.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert!(matches!(
            medium.write(0, b"z"),
            Err(StorageError::ReadOnly(_))
        ));
        assert!(matches!(medium.set_len(0), Err(StorageError::ReadOnly(_))));
    }
}
