// Tests for revocation guards and permanence

use crate::integration::common::{create_service, CARD_DATA};
use walletkms::{Error, KeyStatus, RotationReason};

#[tokio::test]
async fn test_active_version_cannot_be_revoked() {
    let (service, _) = create_service();
    let result = service.encrypt_data(CARD_DATA).await.unwrap();

    assert!(matches!(
        service.revoke_key_version(1, "suspected leak").await,
        Err(Error::CannotRevokeActiveKey(1))
    ));

    // Nothing changed
    assert_eq!(service.decrypt_data(&result).await.unwrap(), CARD_DATA);
    let history = service.get_key_version_history().await.unwrap();
    assert_eq!(history[0].status, KeyStatus::Active);
    assert!(history[0].revoked_at.is_none());
}

#[tokio::test]
async fn test_unknown_version_cannot_be_revoked() {
    let (service, _) = create_service();
    service.initialize().await.unwrap();

    assert!(matches!(
        service.revoke_key_version(7, "typo").await,
        Err(Error::KeyVersionNotFound(7))
    ));
}

#[tokio::test]
async fn test_revocation_is_permanent() {
    let (service, _) = create_service();
    let old = service.encrypt_data(CARD_DATA).await.unwrap();

    service.rotate_keys(RotationReason::Manual).await.unwrap();
    service.revoke_key_version(1, "compromised").await.unwrap();

    // Later rotations never bring a revoked version back
    for _ in 0..3 {
        service.rotate_keys(RotationReason::Manual).await.unwrap();
        assert!(matches!(
            service.decrypt_data(&old).await,
            Err(Error::KeyRevoked(1))
        ));
    }

    let history = service.get_key_version_history().await.unwrap();
    let revoked = history.iter().find(|r| r.version == 1).unwrap();
    assert_eq!(revoked.status, KeyStatus::Revoked);

    // A second revocation is rejected rather than rewriting the reason
    assert!(matches!(
        service.revoke_key_version(1, "again").await,
        Err(Error::InvalidKeyState(_))
    ));
    let history = service.get_key_version_history().await.unwrap();
    let revoked = history.iter().find(|r| r.version == 1).unwrap();
    assert_eq!(revoked.revoked_reason.as_deref(), Some("compromised"));
}

#[tokio::test]
async fn test_revoking_one_version_keeps_others_readable() {
    let (service, _) = create_service();

    let v1 = service.encrypt_data("v1 secret").await.unwrap();
    service.rotate_keys(RotationReason::Manual).await.unwrap();
    let v2 = service.encrypt_data("v2 secret").await.unwrap();
    service.rotate_keys(RotationReason::Manual).await.unwrap();
    let v3 = service.encrypt_data("v3 secret").await.unwrap();

    service.revoke_key_version(2, "rotation audit").await.unwrap();

    assert_eq!(service.decrypt_data(&v1).await.unwrap(), "v1 secret");
    assert!(matches!(
        service.decrypt_data(&v2).await,
        Err(Error::KeyRevoked(2))
    ));
    assert_eq!(service.decrypt_data(&v3).await.unwrap(), "v3 secret");
}
