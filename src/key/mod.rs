//! Key versions and their lifecycle state machine
//!
//! A key version moves `Active -> Deprecated -> Revoked`. The first transition
//! only happens when a rotation issues a newer version; the second is an
//! explicit, terminal revocation.

use crate::error::{Error, Result};
use crate::KeyEncryptionService;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use zeroize::Zeroizing;

/// Lifecycle status of a key version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Used for all new encryptions; exactly one version is active
    Active,
    /// Retired by a rotation; still decrypts historical data
    Deprecated,
    /// Permanently disabled for decryption
    Revoked,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Active => write!(f, "active"),
            KeyStatus::Deprecated => write!(f, "deprecated"),
            KeyStatus::Revoked => write!(f, "revoked"),
        }
    }
}

/// Public view of a key version, as returned by the version history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyVersionRecord {
    pub version: u32,
    pub key_id: String,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    pub status: KeyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_reason: Option<String>,
}

/// Persisted form of a key version: the record plus its wrapped data key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeyVersion {
    #[serde(flatten)]
    pub record: KeyVersionRecord,
    #[serde(with = "crate::util::base64_bytes")]
    pub wrapped_key: Vec<u8>,
}

/// Mutable part of a key version
#[derive(Debug, Clone)]
struct KeyState {
    status: KeyStatus,
    deprecated_at: Option<DateTime<Utc>>,
    revoked_at: Option<DateTime<Utc>>,
    revoked_reason: Option<String>,
}

/// Unwrapped data key cache of a key version
enum CachedDataKey {
    Empty,
    Unwrapped(Zeroizing<Vec<u8>>),
    /// Wiped for good; later unwraps are handed out but never cached
    Wiped,
}

/// An issued key version held by the service
///
/// Everything except the lifecycle state is immutable after issuance. The
/// unwrapped data key is cached on first use and wiped on drop or `wipe`.
/// A revoked or wiped version never caches its data key again.
pub struct VersionedKey {
    version: u32,
    key_id: String,
    algorithm: String,
    created_at: DateTime<Utc>,
    wrapped_key: Vec<u8>,
    state: RwLock<KeyState>,
    data_key: RwLock<CachedDataKey>,
}

impl fmt::Debug for VersionedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedKey")
            .field("version", &self.version)
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .field("status", &self.status())
            .field("data_key", &"<hidden>")
            .finish()
    }
}

impl VersionedKey {
    /// Creates a newly issued, active key version
    pub fn issue(
        version: u32,
        key_id: String,
        algorithm: String,
        created_at: DateTime<Utc>,
        wrapped_key: Vec<u8>,
        data_key: Zeroizing<Vec<u8>>,
    ) -> Self {
        Self {
            version,
            key_id,
            algorithm,
            created_at,
            wrapped_key,
            state: RwLock::new(KeyState {
                status: KeyStatus::Active,
                deprecated_at: None,
                revoked_at: None,
                revoked_reason: None,
            }),
            data_key: RwLock::new(CachedDataKey::Unwrapped(data_key)),
        }
    }

    /// Restores a key version from its persisted form; the data key is
    /// unwrapped lazily on first use
    pub fn from_stored(stored: StoredKeyVersion) -> Self {
        let StoredKeyVersion {
            record,
            wrapped_key,
        } = stored;
        Self {
            version: record.version,
            key_id: record.key_id,
            algorithm: record.algorithm,
            created_at: record.created_at,
            wrapped_key,
            state: RwLock::new(KeyState {
                status: record.status,
                deprecated_at: record.deprecated_at,
                revoked_at: record.revoked_at,
                revoked_reason: record.revoked_reason,
            }),
            data_key: RwLock::new(CachedDataKey::Empty),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> KeyStatus {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    /// Snapshot of the public record
    pub fn record(&self) -> KeyVersionRecord {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        KeyVersionRecord {
            version: self.version,
            key_id: self.key_id.clone(),
            algorithm: self.algorithm.clone(),
            created_at: self.created_at,
            status: state.status,
            deprecated_at: state.deprecated_at,
            revoked_at: state.revoked_at,
            revoked_reason: state.revoked_reason.clone(),
        }
    }

    /// Snapshot of the persisted form
    pub fn stored(&self) -> StoredKeyVersion {
        StoredKeyVersion {
            record: self.record(),
            wrapped_key: self.wrapped_key.clone(),
        }
    }

    /// The record this version would have after being deprecated at `at`
    pub fn deprecated_record(&self, at: DateTime<Utc>) -> Result<StoredKeyVersion> {
        let mut stored = self.stored();
        if stored.record.status != KeyStatus::Active {
            return Err(Error::InvalidKeyState(format!(
                "version {} is {}, only an active version can be deprecated",
                self.version, stored.record.status
            )));
        }
        stored.record.status = KeyStatus::Deprecated;
        stored.record.deprecated_at = Some(at);
        Ok(stored)
    }

    /// The record this version would have after being revoked at `at`
    pub fn revoked_record(&self, at: DateTime<Utc>, reason: &str) -> Result<StoredKeyVersion> {
        let mut stored = self.stored();
        match stored.record.status {
            KeyStatus::Deprecated => {
                stored.record.status = KeyStatus::Revoked;
                stored.record.revoked_at = Some(at);
                stored.record.revoked_reason = Some(reason.to_string());
                Ok(stored)
            }
            KeyStatus::Active => Err(Error::CannotRevokeActiveKey(self.version)),
            KeyStatus::Revoked => Err(Error::InvalidKeyState(format!(
                "version {} is already revoked",
                self.version
            ))),
        }
    }

    /// Applies a transition previously computed by `deprecated_record` or
    /// `revoked_record`
    pub fn apply(&self, record: &KeyVersionRecord) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.status = record.status;
        state.deprecated_at = record.deprecated_at;
        state.revoked_at = record.revoked_at;
        state.revoked_reason = record.revoked_reason.clone();
    }

    /// Returns the unwrapped data key, unwrapping it through the root key
    /// service on first use
    pub async fn data_key(&self, kms: &dyn KeyEncryptionService) -> Result<Zeroizing<Vec<u8>>> {
        let cached = match &*self.data_key.read().unwrap_or_else(PoisonError::into_inner) {
            CachedDataKey::Unwrapped(key) => Some(key.clone()),
            CachedDataKey::Empty | CachedDataKey::Wiped => None,
        };
        if let Some(key) = cached {
            return Ok(key);
        }

        let key = Zeroizing::new(kms.decrypt_key(&self.wrapped_key).await?);

        let mut cache = self.data_key.write().unwrap_or_else(PoisonError::into_inner);
        match &*cache {
            CachedDataKey::Unwrapped(existing) => Ok(existing.clone()),
            CachedDataKey::Wiped => Ok(key),
            CachedDataKey::Empty if self.status() == KeyStatus::Revoked => Ok(key),
            CachedDataKey::Empty => {
                *cache = CachedDataKey::Unwrapped(key.clone());
                Ok(key)
            }
        }
    }

    /// Wipes the cached data key from memory and stops it from being cached again
    pub fn wipe(&self) {
        *self.data_key.write().unwrap_or_else(PoisonError::into_inner) = CachedDataKey::Wiped;
    }

    /// Checks if the data key is currently held unwrapped in memory
    pub fn is_unwrapped(&self) -> bool {
        let cache = self
            .data_key
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        matches!(*cache, CachedDataKey::Unwrapped(_))
    }
}
