// Module for common test utilities and fixtures used across integration tests

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use walletkms::{
    audit::MemoryAuditSink,
    crypto::AES_256_GCM,
    kms::StaticKeyEncryptionService,
    metastore::InMemoryMetastore,
    registry::StaticKeyRegistry,
    Error, KeyMaterial, KeyRegistry, KmsConfig, KmsService, Metastore, Result, RotationSchedule,
    StoredKeyVersion,
};

// Constants for tests
pub const MASTER_KEY_ID: &str = "wallet-master-2026";
pub const SERVICE_NAME: &str = "wallet-api";
pub const ORIGINAL_DATA: &str = "xprv9s21ZrQH143K3GJpoapnV8SFfukcVBSfeCficPSGfubmSFDxo1kuHnLisriDvSnRRuL2Qrg5ggqHKNVpxR86QEC8w35uxmGoggxtQTPvfUu";
pub const CARD_DATA: &str = "4111111111111111|12/29|123";
pub const STATIC_KEY: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// Route library logs to the test harness; safe to call from every test
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Create a static root key service for testing
pub fn create_static_kms() -> Arc<StaticKeyEncryptionService> {
    // Convert the hex string to bytes
    let key_bytes = hex::decode(STATIC_KEY).expect("Invalid hex key");
    Arc::new(StaticKeyEncryptionService::new(key_bytes))
}

// Master key material as published by the registry
pub fn master_key(age: Duration) -> KeyMaterial {
    KeyMaterial {
        key_id: MASTER_KEY_ID.to_string(),
        algorithm: AES_256_GCM.to_string(),
        created_at: Utc::now() - age,
    }
}

// A registry with an active key and no schedule
pub fn create_registry() -> Arc<StaticKeyRegistry> {
    Arc::new(StaticKeyRegistry::with_key(master_key(Duration::zero())))
}

pub fn create_config() -> KmsConfig {
    KmsConfig::new()
        .with_service_name(SERVICE_NAME)
        .with_registry_timeout(std::time::Duration::from_millis(200))
        .with_registry_retries(1, std::time::Duration::from_millis(5))
}

// Service over the given registry with in-memory storage and audit capture
pub fn create_service_with(
    registry: Arc<dyn KeyRegistry>,
    metastore: Arc<dyn Metastore>,
) -> (KmsService, Arc<MemoryAuditSink>) {
    init_logging();
    let audit = Arc::new(MemoryAuditSink::new());
    let service = KmsService::builder()
        .with_registry(registry)
        .with_key_encryption(create_static_kms())
        .with_metastore(metastore)
        .with_audit_sink(audit.clone())
        .with_config(create_config())
        .build()
        .expect("Failed to build service");
    (service, audit)
}

pub fn create_service() -> (KmsService, Arc<MemoryAuditSink>) {
    create_service_with(create_registry(), Arc::new(InMemoryMetastore::new()))
}

// Registry that answers after a fixed delay
#[derive(Debug)]
pub struct SlowKeyRegistry {
    pub delay: std::time::Duration,
}

#[async_trait]
impl KeyRegistry for SlowKeyRegistry {
    async fn get_active_key(&self) -> Result<Option<KeyMaterial>> {
        tokio::time::sleep(self.delay).await;
        Ok(Some(master_key(Duration::zero())))
    }

    async fn get_rotation_schedule(&self) -> Result<Option<RotationSchedule>> {
        tokio::time::sleep(self.delay).await;
        Ok(Some(RotationSchedule::daily("00:00").with_emergency_triggers(["security_breach"])))
    }
}

// Registry that is unavailable for the first `failures` calls
#[derive(Debug)]
pub struct FlakyKeyRegistry {
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyKeyRegistry {
    pub fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn attempt(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::ServiceUnavailable("registry connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyRegistry for FlakyKeyRegistry {
    async fn get_active_key(&self) -> Result<Option<KeyMaterial>> {
        self.attempt()?;
        Ok(Some(master_key(Duration::zero())))
    }

    async fn get_rotation_schedule(&self) -> Result<Option<RotationSchedule>> {
        self.attempt()?;
        Ok(None)
    }
}

// Metastore that refuses the first `store_failures` stores and
// `update_failures` updates
#[derive(Debug, Default)]
pub struct FlakyMetastore {
    inner: InMemoryMetastore,
    store_failures: AtomicU32,
    update_failures: AtomicU32,
}

impl FlakyMetastore {
    pub fn new(store_failures: u32, update_failures: u32) -> Self {
        Self {
            inner: InMemoryMetastore::new(),
            store_failures: AtomicU32::new(store_failures),
            update_failures: AtomicU32::new(update_failures),
        }
    }

    fn refuse(failures: &AtomicU32) -> Result<()> {
        let remaining = failures.load(Ordering::SeqCst);
        if remaining > 0 {
            failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::ServiceUnavailable("metastore write refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Metastore for FlakyMetastore {
    async fn load_all(&self) -> Result<Vec<StoredKeyVersion>> {
        self.inner.load_all().await
    }

    async fn store(&self, key: &StoredKeyVersion) -> Result<bool> {
        Self::refuse(&self.store_failures)?;
        self.inner.store(key).await
    }

    async fn update(&self, key: &StoredKeyVersion) -> Result<()> {
        Self::refuse(&self.update_failures)?;
        self.inner.update(key).await
    }
}
