use crate::error::{Error, Result};
use crate::key::StoredKeyVersion;
use crate::Metastore;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// An in-memory implementation of the Metastore trait
///
/// Key versions are lost when the process terminates.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetastore {
    /// Storage for key versions: version -> record
    store: Arc<RwLock<BTreeMap<u32, StoredKeyVersion>>>,
}

impl InMemoryMetastore {
    /// Creates a new InMemoryMetastore
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored key versions
    pub fn len(&self) -> usize {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Metastore for InMemoryMetastore {
    async fn load_all(&self) -> Result<Vec<StoredKeyVersion>> {
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        Ok(store.values().cloned().collect())
    }

    async fn store(&self, key: &StoredKeyVersion) -> Result<bool> {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);

        if store.contains_key(&key.record.version) {
            return Ok(false);
        }

        store.insert(key.record.version, key.clone());
        Ok(true)
    }

    async fn update(&self, key: &StoredKeyVersion) -> Result<()> {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);

        match store.get_mut(&key.record.version) {
            Some(existing) => {
                *existing = key.clone();
                Ok(())
            }
            None => Err(Error::Metastore(format!(
                "cannot update unknown key version {}",
                key.record.version
            ))),
        }
    }
}
