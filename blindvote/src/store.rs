use crate::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Secure key-value storage provided by the platform.
///
/// Nothing here assumes encryption at rest beyond what the implementation
/// guarantees.
pub trait SecureStore: Send + Sync {
    fn write(&self, key: &str, value: &[u8]) -> Result<(), Error>;

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    fn delete(&self, key: &str) -> Result<(), Error>;

    /// Write a value as JSON
    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error>
    where
        Self: Sized,
    {
        let bytes = serde_json::to_vec(value)?;
        self.write(key, &bytes)
    }

    /// Read a JSON value, if present
    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error>
    where
        Self: Sized,
    {
        match self.read(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// A simple store that uses an in-memory BTreeMap.
///
/// Clones share the same map.
#[derive(Default, Clone)]
pub struct MemStore {
    inner: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemStore {
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecureStore for MemStore {
    fn write(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner.remove(key);
        Ok(())
    }
}

fn poisoned() -> Error {
    Error::Storage("store lock poisoned".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store() {
        let store = MemStore::default();
        assert!(store.read("missing").unwrap().is_none());

        store.write("a", b"one").unwrap();
        let shared = store.clone();
        assert_eq!(shared.read("a").unwrap().unwrap(), b"one");

        store.write_json("b", &vec![1u32, 2, 3]).unwrap();
        let b: Vec<u32> = store.read_json("b").unwrap().unwrap();
        assert_eq!(b, vec![1, 2, 3]);
        assert_eq!(store.len(), 2);

        shared.delete("a").unwrap();
        assert!(store.read("a").unwrap().is_none());

        store.write("c", b"not json").unwrap();
        assert!(store.read_json::<Vec<u32>>("c").is_err());
    }
}
