// Storage abstraction for persisted mesh settings
//
// Keys are slash-separated paths under `bt_mesh/`; values are opaque bytes
// (bincode-encoded records). Saving `None` deletes the key.

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Backend failure: {0}")]
    Backend(String),
    #[error("Unable to encode record: {0}")]
    Encode(String),
    #[error("Unable to decode record: {0}")]
    Decode(String),
    #[error("Invalid key path: {0}")]
    InvalidKey(String),
}

/// Persistent key/value capability consumed by the settings layer
pub trait SettingsStore: Send + Sync {
    fn save(&self, key: &str, value: Option<&[u8]>) -> Result<(), StoreError>;
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn load_all(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
}

pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Encode(e.to_string()))
}

/// Decode a record, rejecting trailing bytes so a stored value of the wrong
/// shape is never silently accepted.
pub fn decode_record<T: DeserializeOwned + Serialize>(bytes: &[u8]) -> Result<T, StoreError> {
    let value: T = bincode::deserialize(bytes).map_err(|e| StoreError::Decode(e.to_string()))?;
    let used = bincode::serialized_size(&value).map_err(|e| StoreError::Decode(e.to_string()))?;
    if used as usize != bytes.len() {
        return Err(StoreError::Decode(format!(
            "unexpected value length ({} != {})",
            bytes.len(),
            used
        )));
    }
    Ok(value)
}

/// In-memory store useful for testing; clones share the same map
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }
}

impl SettingsStore for MemoryStore {
    fn save(&self, key: &str, value: Option<&[u8]>) -> Result<(), StoreError> {
        let mut data = self.data.write();
        match value {
            Some(value) => {
                data.insert(key.to_string(), value.to_vec());
            }
            None => {
                data.remove(key);
            }
        }
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn load_all(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

impl SettingsStore for SledStore {
    fn save(&self, key: &str, value: Option<&[u8]>) -> Result<(), StoreError> {
        match value {
            Some(value) => self.db.insert(key.as_bytes(), value).map(|_| ()),
            None => self.db.remove(key.as_bytes()).map(|_| ()),
        }
        .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn load_all(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (k, v) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            let key = String::from_utf8(k.to_vec())
                .map_err(|e| StoreError::InvalidKey(e.to_string()))?;
            results.push((key, v.to_vec()));
        }
        Ok(results)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}
