use super::{KeyMaterial, KeyRegistry};
use crate::error::Result;
use crate::schedule::RotationSchedule;
use async_trait::async_trait;
use std::sync::{PoisonError, RwLock};

/// An in-memory key registry
///
/// Values are set by the embedding application (or a test) and returned as-is.
#[derive(Debug, Default)]
pub struct StaticKeyRegistry {
    active_key: RwLock<Option<KeyMaterial>>,
    schedule: RwLock<Option<RotationSchedule>>,
}

impl StaticKeyRegistry {
    /// Creates an uninitialized registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the given active key
    pub fn with_key(key: KeyMaterial) -> Self {
        let registry = Self::new();
        registry.set_active_key(Some(key));
        registry
    }

    /// Sets the rotation schedule (builder form)
    pub fn with_schedule(self, schedule: RotationSchedule) -> Self {
        self.set_rotation_schedule(Some(schedule));
        self
    }

    pub fn set_active_key(&self, key: Option<KeyMaterial>) {
        *self
            .active_key
            .write()
            .unwrap_or_else(PoisonError::into_inner) = key;
    }

    pub fn set_rotation_schedule(&self, schedule: Option<RotationSchedule>) {
        *self.schedule.write().unwrap_or_else(PoisonError::into_inner) = schedule;
    }
}

#[async_trait]
impl KeyRegistry for StaticKeyRegistry {
    async fn get_active_key(&self) -> Result<Option<KeyMaterial>> {
        Ok(self
            .active_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn get_rotation_schedule(&self) -> Result<Option<RotationSchedule>> {
        Ok(self
            .schedule
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
