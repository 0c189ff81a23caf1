use super::{KeyMaterial, KeyRegistry};
use crate::error::{Error, Result};
use crate::schedule::RotationSchedule;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// JSON document read by `FileKeyRegistry`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDocument {
    #[serde(default)]
    pub active_key: Option<KeyMaterial>,
    #[serde(default)]
    pub rotation_schedule: Option<RotationSchedule>,
}

/// A key registry backed by a JSON file in secure configuration
///
/// The file is re-read on every call so operators can update the schedule
/// without a restart. A missing file is an uninitialized registry.
#[derive(Debug, Clone)]
pub struct FileKeyRegistry {
    path: PathBuf,
}

impl FileKeyRegistry {
    /// Creates a registry reading from `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a registry document to `path`
    pub async fn write_document(path: impl AsRef<Path>, document: &RegistryDocument) -> Result<()> {
        let data = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn read_document(&self) -> Result<RegistryDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryDocument::default()),
            Err(e) => Err(Error::ServiceUnavailable(format!(
                "key registry {} unreadable: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl KeyRegistry for FileKeyRegistry {
    async fn get_active_key(&self) -> Result<Option<KeyMaterial>> {
        Ok(self.read_document().await?.active_key)
    }

    async fn get_rotation_schedule(&self) -> Result<Option<RotationSchedule>> {
        Ok(self.read_document().await?.rotation_schedule)
    }
}
