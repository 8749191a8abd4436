use clustream::{FileStorage, OpenMode, StorageOptions};

use crate::error::{CliError, CliResult};

/// Validate that `args` has exactly `expected` elements.
pub fn expect_args(args: &[String], expected: usize, usage: &str) -> Result<(), CliError> {
    if args.len() != expected {
        Err(CliError::new(format!("Usage: {}", usage)))
    } else {
        Ok(())
    }
}

/// Parse a record index argument.
pub fn parse_index(arg: &str) -> Result<u64, CliError> {
    arg.parse()
        .map_err(|_| CliError::new(format!("Invalid record index: {}", arg)))
}

/// Parse a byte count, accepting `k`/`m` suffixes (powers of 1024).
pub fn parse_size(arg: &str) -> Result<u64, CliError> {
    let (digits, shift) = match arg.chars().last() {
        Some('k') | Some('K') => (&arg[..arg.len() - 1], 10),
        Some('m') | Some('M') => (&arg[..arg.len() - 1], 20),
        _ => (arg, 0),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(1u64 << shift))
        .ok_or_else(|| CliError::new(format!("Invalid size: {}", arg)))
}

/// Open an existing storage file.
pub fn open_storage(path: &str, mode: OpenMode) -> Result<FileStorage, CliError> {
    FileStorage::open_file(path, mode, StorageOptions::default())
        .map_err(|e| CliError::new(format!("Error opening storage file: {}", e)))
}

/// Flush and release a storage file.
pub fn close_storage(storage: FileStorage) -> CliResult {
    storage
        .into_medium()
        .map(|_| ())
        .map_err(|e| CliError::new(format!("Error closing storage file: {}", e)))
}

/// Open a record, read its entire stream, close the scope.
pub fn read_record_fully(storage: &FileStorage, index: u64) -> Result<Vec<u8>, CliError> {
    let scope = storage
        .open_read(index)
        .map_err(|e| CliError::new(format!("Error opening record {}: {}", index, e)))?;
    let data = scope
        .read_to_vec()
        .map_err(|e| CliError::new(format!("Error reading record {}: {}", index, e)))?;
    scope
        .close()
        .map_err(|e| CliError::new(format!("Error closing record {}: {}", index, e)))?;
    Ok(data)
}
