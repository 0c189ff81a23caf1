//! Key registry collaborators
//!
//! The registry publishes the active master key metadata and the rotation
//! schedule. Production deployments back it with a secrets manager; this
//! module provides an in-memory registry and a file-backed one.

mod file;
mod static_registry;

pub use file::{FileKeyRegistry, RegistryDocument};
pub use static_registry::StaticKeyRegistry;

use crate::error::Result;
use crate::schedule::RotationSchedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata of the registry's current master key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMaterial {
    pub key_id: String,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
}

impl KeyMaterial {
    /// Creates AES-256-GCM key metadata created now
    pub fn new(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            algorithm: crate::crypto::AES_256_GCM.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Source of the active key and rotation policy
#[async_trait]
pub trait KeyRegistry: Send + Sync + fmt::Debug {
    /// Returns the current key, or `None` if the registry was never initialized
    async fn get_active_key(&self) -> Result<Option<KeyMaterial>>;

    /// Returns the rotation schedule, if one is configured
    async fn get_rotation_schedule(&self) -> Result<Option<RotationSchedule>>;
}
