// Tests for registry timeouts and transient failures

use crate::integration::common::{
    create_service_with, FlakyKeyRegistry, SlowKeyRegistry, CARD_DATA,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walletkms::{metastore::InMemoryMetastore, Error, RotationReason};

#[tokio::test]
async fn test_slow_registry_times_out() {
    let (service, audit) = create_service_with(
        Arc::new(SlowKeyRegistry {
            delay: Duration::from_secs(10),
        }),
        Arc::new(InMemoryMetastore::new()),
    );

    let start = Instant::now();
    assert!(matches!(
        service.encrypt_data(CARD_DATA).await,
        Err(Error::ServiceUnavailable(_))
    ));
    assert!(matches!(
        service.emergency_rotation("security_breach").await,
        Err(Error::ServiceUnavailable(_))
    ));
    assert!(!service.check_rotation_needed().await);
    // Bounded by timeout and retries, far below the registry delay
    assert!(start.elapsed() < Duration::from_secs(5));

    assert_eq!(audit.events().len(), 2);
    assert!(audit.events().iter().all(|e| !e.outcome.is_success()));
    assert_eq!(service.active_version(), None);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let registry = Arc::new(FlakyKeyRegistry::new(1));
    let (service, _) = create_service_with(registry.clone(), Arc::new(InMemoryMetastore::new()));

    let result = service.encrypt_data(CARD_DATA).await.unwrap();
    assert_eq!(result.key_version, 1);
    assert_eq!(registry.calls(), 2);
}

#[tokio::test]
async fn test_persistent_failure_gives_up() {
    let registry = Arc::new(FlakyKeyRegistry::new(10));
    let (service, _) = create_service_with(registry.clone(), Arc::new(InMemoryMetastore::new()));

    assert!(matches!(
        service.rotate_keys(RotationReason::Manual).await,
        Err(Error::ServiceUnavailable(_))
    ));
    // One call plus the configured single retry
    assert_eq!(registry.calls(), 2);
}

#[tokio::test]
async fn test_decrypt_does_not_need_registry() {
    let registry = Arc::new(FlakyKeyRegistry::new(0));
    let (service, _) = create_service_with(registry.clone(), Arc::new(InMemoryMetastore::new()));

    let result = service.encrypt_data(CARD_DATA).await.unwrap();
    let calls = registry.calls();
    for _ in 0..3 {
        assert_eq!(service.decrypt_data(&result).await.unwrap(), CARD_DATA);
    }
    assert_eq!(registry.calls(), calls);
}
