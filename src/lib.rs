//! # Wallet Key Management Service
//!
//! Envelope encryption for wallet private keys, card data and other
//! sensitive payloads, with versioned key rotation and revocation.
//!
//! Every key version owns a random 256-bit data key which is wrapped by a
//! root key through a `KeyEncryptionService` and persisted in a `Metastore`.
//! Payloads are sealed with AES-256-GCM under the active version's data key
//! and carry the version number, so ciphertexts produced before a rotation
//! stay decryptable until their version is revoked.
//!
//! Key versions move through `Active -> Deprecated -> Revoked`. Exactly one
//! version is active once the first key has been issued, version numbers
//! only grow, and a revoked version is never used again.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use walletkms::kms::StaticKeyEncryptionService;
//! use walletkms::registry::{KeyMaterial, StaticKeyRegistry};
//! use walletkms::{KmsService, RotationReason};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(StaticKeyRegistry::with_key(KeyMaterial::new("wallet-master")));
//! let master_key = vec![0u8; 32]; // In production, use a real master key
//!
//! let service = KmsService::builder()
//!     .with_registry(registry)
//!     .with_key_encryption(Arc::new(StaticKeyEncryptionService::new(master_key)))
//!     .build()?;
//!
//! let encrypted = service.encrypt_data("4111 1111 1111 1111").await?;
//!
//! // Older ciphertexts remain readable after a rotation
//! service.rotate_keys(RotationReason::Manual).await?;
//! assert_eq!(service.decrypt_data(&encrypted).await?, "4111 1111 1111 1111");
//!
//! // Once deprecated, version 1 can be revoked for good
//! service.revoke_key_version(encrypted.key_version, "device compromised").await?;
//! assert!(service.decrypt_data(&encrypted).await.is_err());
//!
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Local Key Storage
//!
//! When `KMS_ENDPOINT` or `KMS_MASTER_KEY_ID` is not set, `KmsService::from_config`
//! falls back to a master keyfile and a file metastore under the key store path:
//!
//! ```rust,no_run
//! use walletkms::registry::FileKeyRegistry;
//! use walletkms::schedule::RotationScheduler;
//! use walletkms::{KmsConfig, KmsService};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = KmsConfig::from_env()?;
//! let registry = Arc::new(FileKeyRegistry::new("registry.json"));
//! let interval = config.rotation_check_interval;
//!
//! let service = Arc::new(KmsService::from_config(config, registry).await?);
//! service.initialize().await?;
//!
//! let scheduler = RotationScheduler::new(service.clone(), interval).spawn();
//! // ... serve requests ...
//! scheduler.shutdown().await?;
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
mod history;
pub mod key;
pub mod kms;
pub mod metastore;
pub mod registry;
pub mod schedule;
pub mod service;
pub mod util;

// Re-export key types
pub use crate::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
pub use crate::config::KmsConfig;
pub use crate::envelope::{EncryptionContext, EncryptionResult};
pub use crate::error::{Error, Result};
pub use crate::key::{KeyStatus, KeyVersionRecord, StoredKeyVersion};
pub use crate::registry::{KeyMaterial, KeyRegistry};
pub use crate::schedule::RotationSchedule;
pub use crate::service::{KmsService, KmsServiceBuilder, RotationReason, RotationResult};

/// Size of AES-256 key in bytes
pub const AES256_KEY_SIZE: usize = 32;

use async_trait::async_trait;
use std::fmt;

/// Root key service interface for wrapping and unwrapping data keys
#[async_trait]
pub trait KeyEncryptionService: Send + Sync + fmt::Debug {
    /// Encrypts a data key using the root key
    async fn encrypt_key(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts a data key using the root key
    async fn decrypt_key(&self, encrypted_key: &[u8]) -> Result<Vec<u8>>;
}

/// Metastore interface for persisting wrapped key versions
#[async_trait]
pub trait Metastore: Send + Sync + fmt::Debug {
    /// Loads every persisted key version, oldest first
    async fn load_all(&self) -> Result<Vec<StoredKeyVersion>>;

    /// Stores a new key version
    ///
    /// Returns true if the key was stored, false if the version already exists
    async fn store(&self, key: &StoredKeyVersion) -> Result<bool>;

    /// Replaces the lifecycle state of an existing key version
    async fn update(&self, key: &StoredKeyVersion) -> Result<()>;
}

/// AEAD (Authenticated Encryption with Associated Data) interface
pub trait Aead: Send + Sync + fmt::Debug {
    /// Identifier recorded on key versions sealed with this cipher
    fn algorithm(&self) -> &'static str;

    /// Encrypts data with an explicit nonce and associated data
    fn seal(&self, data: &[u8], key: &[u8], nonce: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts and authenticates data sealed by `seal`
    fn open(&self, data: &[u8], key: &[u8], nonce: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Encrypts data using the provided key, prefixing a random nonce
    fn encrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts nonce-prefixed data produced by `encrypt`
    fn decrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>>;
}
