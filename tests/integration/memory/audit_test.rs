// Tests for the audit trail emitted by the service

use crate::integration::common::{
    create_config, create_registry, create_service, create_static_kms, CARD_DATA, SERVICE_NAME,
};
use std::sync::Arc;
use walletkms::{
    audit::{BufferedAuditSink, MemoryAuditSink},
    AuditOperation, AuditOutcome, KmsService, RotationReason,
};

#[tokio::test]
async fn test_every_operation_is_audited() {
    let (service, audit) = create_service();

    let result = service.encrypt_data(CARD_DATA).await.unwrap();
    service.decrypt_data(&result).await.unwrap();
    service.rotate_keys(RotationReason::Manual).await.unwrap();
    let _ = service.revoke_key_version(2, "active").await;
    service.revoke_key_version(1, "retired").await.unwrap();
    let _ = service.decrypt_data(&result).await;
    let _ = service.emergency_rotation("security_breach").await;

    let operations: Vec<_> = audit.events().iter().map(|e| e.operation).collect();
    assert_eq!(
        operations,
        vec![
            AuditOperation::Encrypt,
            AuditOperation::Decrypt,
            AuditOperation::Rotate,
            AuditOperation::Revoke,
            AuditOperation::Revoke,
            AuditOperation::Decrypt,
            AuditOperation::EmergencyRotation,
        ]
    );

    let events = audit.events();
    assert!(events.iter().all(|e| e.actor.as_deref() == Some(SERVICE_NAME)));

    let rotate = &events[2];
    assert!(rotate.outcome.is_success());
    assert_eq!(rotate.key_version, Some(2));
    assert_eq!(rotate.reason.as_deref(), Some("manual"));

    match &events[3].outcome {
        AuditOutcome::Failure { kind, .. } => assert_eq!(kind, "CannotRevokeActiveKey"),
        AuditOutcome::Success => panic!("revoking the active version must fail"),
    }
    assert_eq!(events[4].reason.as_deref(), Some("retired"));

    match &events[5].outcome {
        AuditOutcome::Failure { kind, .. } => assert_eq!(kind, "KeyRevoked"),
        AuditOutcome::Success => panic!("decrypting under a revoked version must fail"),
    }
    match &events[6].outcome {
        AuditOutcome::Failure { kind, .. } => assert_eq!(kind, "TriggerNotAllowed"),
        AuditOutcome::Success => panic!("trigger is not on the allow-list"),
    }
}

#[tokio::test]
async fn test_audit_events_never_carry_secrets() {
    let (service, audit) = create_service();
    let result = service.encrypt_data(CARD_DATA).await.unwrap();
    service.decrypt_data(&result).await.unwrap();

    for event in audit.events() {
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains(CARD_DATA));
    }
}

#[tokio::test]
async fn test_shutdown_flushes_buffered_audit_events() {
    let audit = Arc::new(BufferedAuditSink::new(MemoryAuditSink::new(), 100));
    let service = KmsService::builder()
        .with_registry(create_registry())
        .with_key_encryption(create_static_kms())
        .with_audit_sink(audit.clone())
        .with_config(create_config())
        .build()
        .expect("Failed to build service");

    let result = service.encrypt_data(CARD_DATA).await.unwrap();
    service.decrypt_data(&result).await.unwrap();
    assert_eq!(audit.pending(), 2);
    assert!(audit.inner().events().is_empty());

    service.shutdown().await.expect("Failed to shut down");
    assert_eq!(audit.pending(), 0);
    assert_eq!(audit.inner().events().len(), 2);

    // Calls after shutdown fail and are still recorded
    assert!(service.encrypt_data(CARD_DATA).await.is_err());
    assert_eq!(audit.pending(), 1);
}
