//! Append-only key version history with a single active pointer

use crate::error::{Error, Result};
use crate::key::{KeyStatus, KeyVersionRecord, StoredKeyVersion, VersionedKey};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Every key version ever issued, keyed by version number
///
/// Versions are never removed. `active` always names the highest version
/// once the history is non-empty.
#[derive(Debug, Default)]
pub(crate) struct VersionHistory {
    versions: BTreeMap<u32, Arc<VersionedKey>>,
    active: Option<u32>,
}

impl VersionHistory {
    /// Rebuilds the history from persisted versions
    ///
    /// An interrupted rotation can leave an older version still marked
    /// active next to its successor; the newest one wins and the others are
    /// deprecated. Those deprecations are returned so the caller can write
    /// them back.
    pub(crate) fn from_stored(
        stored: Vec<StoredKeyVersion>,
    ) -> Result<(Self, Vec<StoredKeyVersion>)> {
        let mut history = Self::default();
        for key in stored {
            let version = key.record.version;
            if version == 0 {
                return Err(Error::Metastore("key version 0 is not valid".into()));
            }
            if history
                .versions
                .insert(version, Arc::new(VersionedKey::from_stored(key)))
                .is_some()
            {
                return Err(Error::Metastore(format!("duplicate key version {}", version)));
            }
        }

        let active: Vec<u32> = history
            .versions
            .values()
            .filter(|k| k.status() == KeyStatus::Active)
            .map(|k| k.version())
            .collect();

        let mut repaired = Vec::new();
        match active.last() {
            Some(&newest) => {
                for &stale in &active[..active.len() - 1] {
                    log::warn!(
                        "key version {} still marked active behind version {}; treating as deprecated",
                        stale,
                        newest
                    );
                    if let Some(key) = history.versions.get(&stale) {
                        let deprecated = key.deprecated_record(Utc::now())?;
                        key.apply(&deprecated.record);
                        repaired.push(deprecated);
                    }
                }
                if history.versions.keys().next_back() != Some(&newest) {
                    return Err(Error::Metastore(format!(
                        "active key version {} is not the newest version",
                        newest
                    )));
                }
                history.active = Some(newest);
            }
            None if !history.versions.is_empty() => {
                return Err(Error::Metastore(
                    "persisted key history has no active version".into(),
                ));
            }
            None => {}
        }

        Ok((history, repaired))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub(crate) fn active_version(&self) -> Option<u32> {
        self.active
    }

    pub(crate) fn active(&self) -> Option<Arc<VersionedKey>> {
        self.active.and_then(|v| self.get(v))
    }

    pub(crate) fn get(&self, version: u32) -> Option<Arc<VersionedKey>> {
        self.versions.get(&version).cloned()
    }

    /// Version number the next issued key receives
    pub(crate) fn next_version(&self) -> u32 {
        self.versions.keys().next_back().map_or(1, |v| v + 1)
    }

    /// Adds a newly issued key and makes it the active one
    ///
    /// The caller must already have deprecated the previous active version.
    pub(crate) fn push_active(&mut self, key: Arc<VersionedKey>) -> Result<()> {
        let version = key.version();
        if version != self.next_version() {
            return Err(Error::Internal(format!(
                "key version {} issued out of order, expected {}",
                version,
                self.next_version()
            )));
        }
        if let Some(previous) = self.active() {
            if previous.status() == KeyStatus::Active {
                return Err(Error::Internal(format!(
                    "version {} is still active",
                    previous.version()
                )));
            }
        }
        self.versions.insert(version, key);
        self.active = Some(version);
        Ok(())
    }

    /// Public records, most recent version first
    pub(crate) fn records(&self) -> Vec<KeyVersionRecord> {
        self.versions.values().rev().map(|k| k.record()).collect()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &Arc<VersionedKey>> {
        self.versions.values()
    }
}
