// Tests for rotation when metastore writes fail

use crate::integration::common::{create_registry, create_service_with, FlakyMetastore, CARD_DATA};
use std::sync::Arc;
use walletkms::{Error, KeyStatus, Metastore, RotationReason};

async fn persisted_actives(metastore: &FlakyMetastore) -> Vec<u32> {
    metastore
        .load_all()
        .await
        .unwrap()
        .iter()
        .filter(|k| k.record.status == KeyStatus::Active)
        .map(|k| k.record.version)
        .collect()
}

#[tokio::test]
async fn test_rotation_recovers_after_failed_deprecation_update() {
    let metastore = Arc::new(FlakyMetastore::new(0, 1));
    let (service, audit) = create_service_with(create_registry(), metastore.clone());
    let result = service.encrypt_data(CARD_DATA).await.unwrap();

    assert!(matches!(
        service.rotate_keys(RotationReason::Manual).await,
        Err(Error::ServiceUnavailable(_))
    ));
    assert!(!audit.events().pop().unwrap().outcome.is_success());

    // The stored version 2 is adopted and its predecessor deprecated
    assert_eq!(service.active_version(), Some(2));
    assert_eq!(persisted_actives(&metastore).await, vec![2]);

    let rotation = service.rotate_keys(RotationReason::Manual).await.unwrap();
    assert_eq!(rotation.new_version, 3);
    assert_eq!(persisted_actives(&metastore).await, vec![3]);

    let history = service.get_key_version_history().await.unwrap();
    assert_eq!(history.iter().filter(|r| r.status == KeyStatus::Active).count(), 1);
    assert_eq!(service.decrypt_data(&result).await.unwrap(), CARD_DATA);
}

#[tokio::test]
async fn test_failed_store_leaves_history_unchanged() {
    let metastore = Arc::new(FlakyMetastore::new(1, 0));
    let (service, _) = create_service_with(create_registry(), metastore.clone());

    assert!(matches!(
        service.initialize().await,
        Err(Error::ServiceUnavailable(_))
    ));
    assert_eq!(service.active_version(), None);

    // Nothing was persisted, so the retry bootstraps version 1
    service.initialize().await.unwrap();
    let result = service.encrypt_data(CARD_DATA).await.unwrap();
    assert_eq!(result.key_version, 1);

    let rotation = service.rotate_keys(RotationReason::Manual).await.unwrap();
    assert_eq!(rotation.new_version, 2);
    assert_eq!(persisted_actives(&metastore).await, vec![2]);
    assert_eq!(service.decrypt_data(&result).await.unwrap(), CARD_DATA);
}
