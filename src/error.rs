use thiserror::Error;

/// Errors raised by the clustered storage.
///
/// `Corruption` marks a structural fault found while walking chains or
/// reading records; the affected storage must be treated as invalid.
/// `OutOfBounds`, `ScopesOpen`, `ReadOnly`, `LockConflict` and
/// `InvalidArgument` are caller contract violations. `Integrity` carries the
/// full list of issues found by the diagnostics verifier.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("out of bounds: {0}")]
    OutOfBounds(String),
    #[error("scopes open: {0}")]
    ScopesOpen(String),
    #[error("read-only: {0}")]
    ReadOnly(String),
    #[error("lock conflict: {0}")]
    LockConflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("integrity check failed with {} issue(s): {}", .0.len(), .0.join("; "))]
    Integrity(Vec<String>),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<StorageError> for std::io::Error {
    fn from(e: StorageError) -> Self {
        let kind = match &e {
            StorageError::OutOfBounds(_) | StorageError::InvalidArgument(_) => {
                std::io::ErrorKind::InvalidInput
            }
            StorageError::ReadOnly(_) | StorageError::LockConflict(_) => {
                std::io::ErrorKind::PermissionDenied
            }
            StorageError::NotFound(_) => std::io::ErrorKind::NotFound,
            StorageError::Corruption(_) | StorageError::Integrity(_) => {
                std::io::ErrorKind::InvalidData
            }
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}
