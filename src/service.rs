//! The key management service
//!
//! `KmsService` encrypts payloads under the active key version, decrypts them
//! under whichever version they name, and drives rotation and revocation.
//!
//! Writers (bootstrap, rotation, revocation) are serialized on an async
//! writer lock. Readers only take the history read lock long enough to clone
//! the key version they need, so encryption observes either the old or the
//! new active version and decryption never waits on a rotation's I/O.

use crate::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink, LogAuditSink};
use crate::config::KmsConfig;
use crate::crypto::{fill_random, new_nonce, Aes256GcmAead, AES_256_GCM};
use crate::envelope::{associated_data, EncryptionContext, EncryptionResult};
use crate::error::{Error, Result};
use crate::history::VersionHistory;
use crate::key::{KeyStatus, KeyVersionRecord, StoredKeyVersion, VersionedKey};
use crate::kms::StaticKeyEncryptionService;
use crate::metastore::{FileMetastore, InMemoryMetastore};
use crate::registry::KeyRegistry;
use crate::schedule::is_rotation_due;
use crate::{Aead, KeyEncryptionService, Metastore, AES256_KEY_SIZE};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Why a rotation was performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationReason {
    #[default]
    Manual,
    Scheduled,
    Emergency,
}

impl fmt::Display for RotationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationReason::Manual => write!(f, "manual"),
            RotationReason::Scheduled => write!(f, "scheduled"),
            RotationReason::Emergency => write!(f, "emergency"),
        }
    }
}

/// Outcome of a successful rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationResult {
    pub new_key_id: String,
    pub new_version: u32,
    pub rotated_at: DateTime<Utc>,
    pub previous_key_id: String,
    pub reason: RotationReason,
}

/// Builder for KmsService
#[derive(Default)]
pub struct KmsServiceBuilder {
    registry: Option<Arc<dyn KeyRegistry>>,
    kms: Option<Arc<dyn KeyEncryptionService>>,
    metastore: Option<Arc<dyn Metastore>>,
    audit: Option<Arc<dyn AuditSink>>,
    crypto: Option<Arc<dyn Aead>>,
    config: Option<KmsConfig>,
}

impl KmsServiceBuilder {
    /// Creates a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key registry
    pub fn with_registry(mut self, registry: Arc<dyn KeyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the root key service used to wrap data keys
    pub fn with_key_encryption(mut self, kms: Arc<dyn KeyEncryptionService>) -> Self {
        self.kms = Some(kms);
        self
    }

    /// Sets the metastore; defaults to an in-memory one
    pub fn with_metastore(mut self, metastore: Arc<dyn Metastore>) -> Self {
        self.metastore = Some(metastore);
        self
    }

    /// Sets the audit sink; defaults to `LogAuditSink`
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Sets the AEAD implementation; defaults to AES-256-GCM
    pub fn with_crypto(mut self, crypto: Arc<dyn Aead>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Sets the configuration; defaults to `KmsConfig::default()`
    pub fn with_config(mut self, config: KmsConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Builds the KmsService
    pub fn build(self) -> Result<KmsService> {
        let registry = self
            .registry
            .ok_or_else(|| Error::InvalidArgument("registry is required".to_string()))?;
        let kms = self.kms.ok_or_else(|| {
            Error::InvalidArgument("key encryption service is required".to_string())
        })?;
        let crypto = self
            .crypto
            .unwrap_or_else(|| Arc::new(Aes256GcmAead::new()));
        if crypto.algorithm() != AES_256_GCM {
            return Err(Error::InvalidArgument(format!(
                "unsupported algorithm {}",
                crypto.algorithm()
            )));
        }

        Ok(KmsService {
            registry,
            kms,
            metastore: self
                .metastore
                .unwrap_or_else(|| Arc::new(InMemoryMetastore::new())),
            audit: self.audit.unwrap_or_else(|| Arc::new(LogAuditSink::new())),
            crypto,
            config: self.config.unwrap_or_default(),
            history: RwLock::new(VersionHistory::default()),
            writer: Mutex::new(()),
            loaded: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Envelope encryption service with versioned key rotation and revocation
pub struct KmsService {
    registry: Arc<dyn KeyRegistry>,
    kms: Arc<dyn KeyEncryptionService>,
    metastore: Arc<dyn Metastore>,
    audit: Arc<dyn AuditSink>,
    crypto: Arc<dyn Aead>,
    config: KmsConfig,
    /// Version map and active pointer; never held across an await
    history: RwLock<VersionHistory>,
    /// Serializes bootstrap, rotation and revocation
    writer: Mutex<()>,
    /// Set once persisted history has been loaded from the metastore
    loaded: OnceCell<()>,
    closed: AtomicBool,
}

impl fmt::Debug for KmsService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsService")
            .field("registry", &self.registry)
            .field("metastore", &self.metastore)
            .field("active_version", &self.active_version())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl KmsService {
    /// Creates a new KmsService using the builder pattern
    pub fn builder() -> KmsServiceBuilder {
        KmsServiceBuilder::new()
    }

    /// Creates a service using the local fallback described by `config`: a
    /// master keyfile and a file metastore under the key store path
    pub async fn from_config(config: KmsConfig, registry: Arc<dyn KeyRegistry>) -> Result<Self> {
        if !config.uses_local_fallback() {
            return Err(Error::Config(
                "a remote KMS endpoint is configured; supply its KeyEncryptionService through the builder".into(),
            ));
        }

        let kms = StaticKeyEncryptionService::from_keyfile(config.master_keyfile()).await?;
        let metastore = FileMetastore::open(config.versions_dir()).await?;

        Self::builder()
            .with_registry(registry)
            .with_key_encryption(Arc::new(kms))
            .with_metastore(Arc::new(metastore))
            .with_config(config)
            .build()
    }

    pub fn config(&self) -> &KmsConfig {
        &self.config
    }

    /// The currently active key version, if any has been issued
    pub fn active_version(&self) -> Option<u32> {
        self.read_history().active_version()
    }

    /// Loads persisted history and makes sure an active key exists
    pub async fn initialize(&self) -> Result<KeyVersionRecord> {
        let result = async {
            self.ensure_open()?;
            Ok(self.active_key().await?.record())
        }
        .await;

        let version = result.as_ref().ok().map(|r| r.version);
        self.audit(AuditOperation::Initialize, &result, version, None);
        result
    }

    /// Encrypts `plaintext` under the active key version
    pub async fn encrypt_data(&self, plaintext: &str) -> Result<EncryptionResult> {
        self.encrypt_data_with_context(plaintext, &EncryptionContext::new())
            .await
    }

    /// Encrypts `plaintext`, binding `context` as associated data
    pub async fn encrypt_data_with_context(
        &self,
        plaintext: &str,
        context: &EncryptionContext,
    ) -> Result<EncryptionResult> {
        let start = Instant::now();
        counter!("kms.encrypt", 1);

        let result = self.encrypt(plaintext.as_bytes(), context).await;

        histogram!("kms.encrypt.time", start.elapsed());
        let version = result.as_ref().ok().map(|r| r.key_version);
        self.audit(AuditOperation::Encrypt, &result, version, None);
        result
    }

    /// Decrypts a result produced by `encrypt_data`
    pub async fn decrypt_data(&self, result: &EncryptionResult) -> Result<String> {
        self.decrypt_data_with_context(result, &EncryptionContext::new())
            .await
    }

    /// Decrypts a result produced by `encrypt_data_with_context` with the same context
    pub async fn decrypt_data_with_context(
        &self,
        result: &EncryptionResult,
        context: &EncryptionContext,
    ) -> Result<String> {
        let start = Instant::now();
        counter!("kms.decrypt", 1);

        let plaintext = self.decrypt(result, context).await;

        histogram!("kms.decrypt.time", start.elapsed());
        self.audit(
            AuditOperation::Decrypt,
            &plaintext,
            Some(result.key_version),
            None,
        );
        plaintext
    }

    /// Issues a new active key version and deprecates the previous one
    pub async fn rotate_keys(&self, reason: RotationReason) -> Result<RotationResult> {
        let result = self.rotate(reason).await;

        let version = result.as_ref().ok().map(|r| r.new_version);
        self.audit(
            AuditOperation::Rotate,
            &result,
            version,
            Some(reason.to_string()),
        );
        result
    }

    /// Permanently revokes a deprecated key version
    pub async fn revoke_key_version(&self, version: u32, reason: &str) -> Result<()> {
        let result = self.revoke(version, reason).await;

        self.audit(
            AuditOperation::Revoke,
            &result,
            Some(version),
            Some(reason.to_string()),
        );
        result
    }

    /// Checks the registry's daily schedule against the active key's age
    ///
    /// Never fails: any missing input means no rotation is due.
    pub async fn check_rotation_needed(&self) -> bool {
        if self.ensure_open().is_err() || self.ensure_loaded().await.is_err() {
            return false;
        }
        let active = self.read_history().active();
        let Some(active) = active else {
            return false;
        };

        let schedule = match self
            .call_registry("get_rotation_schedule", || {
                self.registry.get_rotation_schedule()
            })
            .await
        {
            Ok(schedule) => schedule,
            Err(e) => {
                log::warn!("rotation check skipped, schedule unavailable: {}", e);
                return false;
            }
        };

        is_rotation_due(schedule.as_ref(), active.created_at(), Utc::now())
    }

    /// Rotates immediately if `trigger` is on the registry's emergency allow-list
    pub async fn emergency_rotation(&self, trigger: &str) -> Result<RotationResult> {
        let result = async {
            self.ensure_open()?;
            let schedule = self
                .call_registry("get_rotation_schedule", || {
                    self.registry.get_rotation_schedule()
                })
                .await?;

            if !schedule.is_some_and(|s| s.allows_trigger(trigger)) {
                return Err(Error::TriggerNotAllowed(trigger.to_string()));
            }

            log::warn!("emergency key rotation requested by trigger {:?}", trigger);
            self.rotate(RotationReason::Emergency).await
        }
        .await;

        let version = result.as_ref().ok().map(|r| r.new_version);
        self.audit(
            AuditOperation::EmergencyRotation,
            &result,
            version,
            Some(trigger.to_string()),
        );
        result
    }

    /// All key versions ever issued, most recent first
    pub async fn get_key_version_history(&self) -> Result<Vec<KeyVersionRecord>> {
        self.ensure_loaded().await?;
        Ok(self.read_history().records())
    }

    /// Flushes pending audit events and wipes unwrapped key material
    ///
    /// Every later operation fails with `ServiceUnavailable`.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Wait for an in-flight rotation or revocation to commit
        let _writer = self.writer.lock().await;
        let flushed = self.audit.flush();

        for key in self.read_history().keys() {
            key.wipe();
        }
        log::info!("key management service shut down");
        flushed
    }

    async fn encrypt(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<EncryptionResult> {
        self.ensure_open()?;
        let key = self.active_key().await?;
        let data_key = key.data_key(self.kms.as_ref()).await?;

        let nonce = new_nonce();
        let aad = associated_data(key.version(), key.algorithm(), context)?;
        let ciphertext = self.crypto.seal(plaintext, &data_key, &nonce, &aad)?;

        Ok(EncryptionResult {
            ciphertext,
            key_version: key.version(),
            algorithm: key.algorithm().to_string(),
            iv: nonce.to_vec(),
        })
    }

    async fn decrypt(
        &self,
        result: &EncryptionResult,
        context: &EncryptionContext,
    ) -> Result<String> {
        self.ensure_open()?;
        self.ensure_loaded().await?;

        let key = self
            .read_history()
            .get(result.key_version)
            .ok_or(Error::KeyVersionNotFound(result.key_version))?;

        if key.status() == KeyStatus::Revoked {
            return Err(Error::KeyRevoked(key.version()));
        }
        if key.algorithm() != result.algorithm {
            return Err(Error::Crypto(format!(
                "algorithm {} does not match key version {} ({})",
                result.algorithm,
                key.version(),
                key.algorithm()
            )));
        }

        let data_key = key.data_key(self.kms.as_ref()).await?;
        let aad = associated_data(key.version(), key.algorithm(), context)?;
        let plaintext = Zeroizing::new(self.crypto.open(
            &result.ciphertext,
            &data_key,
            &result.iv,
            &aad,
        )?);

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| Error::Crypto("decrypted payload is not valid UTF-8".into()))
    }

    async fn rotate(&self, reason: RotationReason) -> Result<RotationResult> {
        self.ensure_open()?;
        self.ensure_loaded().await?;

        // Generate and wrap outside the writer lock
        let (data_key, wrapped_key) = self.new_data_key().await?;

        let writer = self.writer.lock().await;
        self.ensure_open()?;

        let existing = self.read_history().active();
        let current = match existing {
            Some(current) => current,
            None => self.bootstrap(&writer).await.map_err(|e| match e {
                Error::NoActiveKey => Error::NoCurrentKey,
                other => other,
            })?,
        };

        let rotated_at = Utc::now();
        let new_version = current.version() + 1;
        let new_key = Arc::new(VersionedKey::issue(
            new_version,
            new_key_id(),
            current.algorithm().to_string(),
            rotated_at,
            wrapped_key,
            data_key,
        ));
        let deprecated = current.deprecated_record(rotated_at)?;

        if let Err(e) = self.commit_rotation(&new_key, &deprecated).await {
            log::error!("rotation to key version {} failed: {}", new_version, e);
            self.reconcile(&writer).await;
            return Err(e);
        }

        {
            let mut history = self.write_history();
            current.apply(&deprecated.record);
            history.push_active(new_key.clone())?;
        }
        drop(writer);

        counter!("kms.rotate", 1);
        log::info!(
            "rotated keys ({}): version {} -> {}",
            reason,
            current.version(),
            new_version
        );

        Ok(RotationResult {
            new_key_id: new_key.key_id().to_string(),
            new_version,
            rotated_at,
            previous_key_id: current.key_id().to_string(),
            reason,
        })
    }

    async fn revoke(&self, version: u32, reason: &str) -> Result<()> {
        self.ensure_open()?;
        self.ensure_loaded().await?;

        let _writer = self.writer.lock().await;

        // Compare against the active pointer under the writer lock so no
        // rotation can interleave between the check and the transition
        let key = {
            let history = self.read_history();
            if history.active_version() == Some(version) {
                return Err(Error::CannotRevokeActiveKey(version));
            }
            history
                .get(version)
                .ok_or(Error::KeyVersionNotFound(version))?
        };

        let revoked = key.revoked_record(Utc::now(), reason)?;
        self.metastore.update(&revoked).await?;

        {
            let _history = self.write_history();
            key.apply(&revoked.record);
        }
        key.wipe();

        counter!("kms.revoke", 1);
        log::warn!("revoked key version {}: {}", version, reason);
        Ok(())
    }

    /// Returns the active key, bootstrapping version 1 from the registry if
    /// nothing has been issued yet
    async fn active_key(&self) -> Result<Arc<VersionedKey>> {
        self.ensure_loaded().await?;
        let existing = self.read_history().active();
        if let Some(key) = existing {
            return Ok(key);
        }

        let writer = self.writer.lock().await;
        self.ensure_open()?;
        let existing = self.read_history().active();
        match existing {
            Some(key) => Ok(key),
            None => self.bootstrap(&writer).await,
        }
    }

    /// Issues version 1 from the registry's active key. The caller holds the writer lock.
    async fn bootstrap(&self, writer: &MutexGuard<'_, ()>) -> Result<Arc<VersionedKey>> {
        let material = self
            .call_registry("get_active_key", || self.registry.get_active_key())
            .await?
            .ok_or(Error::NoActiveKey)?;

        if material.algorithm != AES_256_GCM {
            return Err(Error::Config(format!(
                "registry key {} uses unsupported algorithm {}",
                material.key_id, material.algorithm
            )));
        }

        let (data_key, wrapped_key) = self.new_data_key().await?;
        let version = self.read_history().next_version();
        let key = Arc::new(VersionedKey::issue(
            version,
            material.key_id,
            material.algorithm,
            material.created_at,
            wrapped_key,
            data_key,
        ));

        if let Err(e) = self.persist_new(&key).await {
            self.reconcile(writer).await;
            return Err(e);
        }
        self.write_history().push_active(key.clone())?;

        log::info!(
            "bootstrapped key version {} from registry key {}",
            key.version(),
            key.key_id()
        );
        Ok(key)
    }

    /// Persists a rotation: the new version first, then the deprecation of
    /// its predecessor
    async fn commit_rotation(
        &self,
        new_key: &VersionedKey,
        deprecated: &StoredKeyVersion,
    ) -> Result<()> {
        self.persist_new(new_key).await?;
        self.metastore.update(deprecated).await
    }

    /// Rebuilds the in-memory history from the metastore after a failed
    /// write. The caller holds the writer lock.
    ///
    /// A rotation whose new version was stored but whose deprecation write
    /// failed is completed here, so the next rotation continues from the
    /// persisted state instead of reissuing an existing version.
    async fn reconcile(&self, _writer: &MutexGuard<'_, ()>) {
        let loaded = match self.load_persisted().await {
            Ok(loaded) => loaded,
            Err(e) => {
                log::error!("could not reload key history from the metastore: {}", e);
                return;
            }
        };

        let previous = std::mem::replace(&mut *self.write_history(), loaded);
        for key in previous.keys() {
            key.wipe();
        }
        log::warn!(
            "reloaded key history from the metastore, active version {:?}",
            self.active_version()
        );
    }

    /// Loads persisted history, writing back any repair it needed
    async fn load_persisted(&self) -> Result<VersionHistory> {
        let stored = self.metastore.load_all().await?;
        let (loaded, repaired) = VersionHistory::from_stored(stored)?;

        for record in &repaired {
            if let Err(e) = self.metastore.update(record).await {
                log::warn!(
                    "could not persist repaired state of key version {}: {}",
                    record.record.version,
                    e
                );
            }
        }
        Ok(loaded)
    }

    async fn persist_new(&self, key: &VersionedKey) -> Result<()> {
        if !self.metastore.store(&key.stored()).await? {
            return Err(Error::Metastore(format!(
                "key version {} already exists in the metastore",
                key.version()
            )));
        }
        Ok(())
    }

    async fn new_data_key(&self) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>)> {
        let mut data_key = Zeroizing::new(vec![0_u8; AES256_KEY_SIZE]);
        fill_random(&mut data_key);
        let wrapped_key = self.kms.encrypt_key(&data_key).await?;
        Ok((data_key, wrapped_key))
    }

    async fn ensure_loaded(&self) -> Result<()> {
        self.loaded
            .get_or_try_init(|| async {
                let loaded = self.load_persisted().await?;
                if loaded.is_empty() {
                    return Ok(());
                }

                let mut history = self.write_history();
                // Keys issued before the load finished are already persisted
                // and therefore part of `loaded`
                if history.is_empty() {
                    log::debug!(
                        "loaded key history, active version {:?}",
                        loaded.active_version()
                    );
                    *history = loaded;
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ServiceUnavailable(
                "key management service has been shut down".into(),
            ));
        }
        Ok(())
    }

    /// Calls the registry with a bounded timeout, retrying transient failures
    async fn call_registry<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;

        loop {
            let outcome = match tokio::time::timeout(self.config.registry_timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::ServiceUnavailable(format!(
                    "key registry {} timed out after {:?}",
                    operation, self.config.registry_timeout
                ))),
            };

            match outcome {
                Err(e) if e.is_retryable() && attempt < self.config.registry_retries => {
                    attempt += 1;
                    log::warn!(
                        "key registry {} failed (attempt {}), retrying in {:?}: {}",
                        operation,
                        attempt,
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                other => return other,
            }
        }
    }

    fn audit<T>(
        &self,
        operation: AuditOperation,
        result: &Result<T>,
        key_version: Option<u32>,
        reason: Option<String>,
    ) {
        let outcome = match result {
            Ok(_) => AuditOutcome::Success,
            Err(e) => {
                counter!("kms.error", 1, "operation" => operation.to_string());
                AuditOutcome::from(e)
            }
        };

        self.audit.record(
            AuditEvent::new(operation, outcome)
                .with_key_version(key_version)
                .with_reason(reason)
                .with_actor(self.config.service_name.clone()),
        );
    }

    fn read_history(&self) -> RwLockReadGuard<'_, VersionHistory> {
        self.history.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_history(&self) -> RwLockWriteGuard<'_, VersionHistory> {
        self.history.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn new_key_id() -> String {
    format!("wallet-key-{}", Uuid::new_v4().simple())
}
