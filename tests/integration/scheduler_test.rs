// Tests for scheduled rotation

use crate::integration::common::{create_service_with, master_key};
use chrono::Duration;
use std::sync::Arc;
use walletkms::{
    metastore::InMemoryMetastore, registry::StaticKeyRegistry, schedule::RotationScheduler,
    AuditOperation, RotationSchedule,
};

fn stale_registry() -> Arc<StaticKeyRegistry> {
    Arc::new(
        StaticKeyRegistry::with_key(master_key(Duration::days(2)))
            .with_schedule(RotationSchedule::daily("00:00")),
    )
}

#[tokio::test]
async fn test_tick_rotates_once_per_boundary() {
    let (service, audit) =
        create_service_with(stale_registry(), Arc::new(InMemoryMetastore::new()));
    let service = Arc::new(service);
    service.initialize().await.expect("Failed to initialize");
    assert!(service.check_rotation_needed().await);

    let scheduler = RotationScheduler::new(service.clone(), std::time::Duration::from_secs(60));
    assert!(scheduler.tick().await.expect("Tick failed"));
    assert!(!scheduler.tick().await.expect("Tick failed"));
    assert_eq!(service.active_version(), Some(2));

    let rotations = audit.events_for(AuditOperation::Rotate);
    assert_eq!(rotations.len(), 1);
    assert_eq!(rotations[0].reason.as_deref(), Some("scheduled"));
}

#[tokio::test]
async fn test_disabled_schedule_never_rotates() {
    let registry = stale_registry();
    registry.set_rotation_schedule(Some(RotationSchedule::default()));
    let (service, _) = create_service_with(registry, Arc::new(InMemoryMetastore::new()));
    let service = Arc::new(service);
    service.initialize().await.expect("Failed to initialize");

    let scheduler = RotationScheduler::new(service.clone(), std::time::Duration::from_secs(60));
    assert!(!scheduler.tick().await.expect("Tick failed"));
    assert_eq!(service.active_version(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_spawned_scheduler_stops_on_shutdown() {
    let (service, _) = create_service_with(stale_registry(), Arc::new(InMemoryMetastore::new()));
    let service = Arc::new(service);
    service.initialize().await.expect("Failed to initialize");

    let interval = std::time::Duration::from_secs(60);
    let handle = RotationScheduler::new(service.clone(), interval).spawn();
    // The paused clock auto-advances to each tick while the runtime is idle
    tokio::time::sleep(interval * 3).await;
    handle.shutdown().await.expect("Scheduler failed");

    assert_eq!(service.active_version(), Some(2));
}
