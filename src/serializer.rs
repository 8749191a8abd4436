use crate::StorageError;

/// Converts items to and from the bytes of one stream.
pub trait ItemSerializer<T> {
    fn serialize(&self, item: &T) -> Result<Vec<u8>, StorageError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<T, StorageError>;
}

/// Stores raw bytes unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl ItemSerializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, item: &Vec<u8>) -> Result<Vec<u8>, StorageError> {
        Ok(item.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>, StorageError> {
        Ok(bytes.to_vec())
    }
}

/// Stores strings as UTF-8.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl ItemSerializer<String> for StringSerializer {
    fn serialize(&self, item: &String) -> Result<Vec<u8>, StorageError> {
        Ok(item.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String, StorageError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StorageError::Serialization(format!("invalid UTF-8 string: {}", e)))
    }
}
