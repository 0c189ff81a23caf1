use crate::error::{Error, Result};
use crate::key::StoredKeyVersion;
use crate::Metastore;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const FILE_PREFIX: &str = "key-v";
const FILE_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

/// A metastore writing one JSON document per key version into a directory
///
/// Only wrapped data keys are written; plaintext key material never touches disk.
#[derive(Debug, Clone)]
pub struct FileMetastore {
    dir: PathBuf,
}

impl FileMetastore {
    /// Opens (creating if needed) a metastore in `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, version: u32) -> PathBuf {
        self.dir
            .join(format!("{}{:08}{}", FILE_PREFIX, version, FILE_SUFFIX))
    }

    fn is_key_file(name: &str) -> bool {
        name.strip_prefix(FILE_PREFIX)
            .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
    }

    async fn read(path: &Path) -> Result<StoredKeyVersion> {
        let data = tokio::fs::read(path).await?;
        serde_json::from_slice(&data).map_err(|e| {
            Error::Metastore(format!("corrupt key version file {}: {}", path.display(), e))
        })
    }

    /// Writes `key` to a uniquely named, fully synced temp file in the
    /// metastore directory. The file is removed again if any write fails.
    async fn write_temp(&self, key: &StoredKeyVersion) -> Result<PathBuf> {
        let data = serde_json::to_vec_pretty(key)?;
        let tmp = self.dir.join(format!(
            ".{}{:08}.{}{}",
            FILE_PREFIX,
            key.record.version,
            Uuid::new_v4().simple(),
            TEMP_SUFFIX
        ));

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;

        match written {
            Ok(()) => Ok(tmp),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(Error::Io(e))
            }
        }
    }
}

#[async_trait]
impl Metastore for FileMetastore {
    async fn load_all(&self) -> Result<Vec<StoredKeyVersion>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_str().is_some_and(Self::is_key_file) {
                keys.push(Self::read(&entry.path()).await?);
            }
        }

        keys.sort_by_key(|k| k.record.version);
        Ok(keys)
    }

    async fn store(&self, key: &StoredKeyVersion) -> Result<bool> {
        let tmp = self.write_temp(key).await?;

        // Linking fails if the version already exists, so a complete
        // document appears under its final name or not at all
        let linked = tokio::fs::hard_link(&tmp, self.path_for(key.record.version)).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn update(&self, key: &StoredKeyVersion) -> Result<()> {
        let path = self.path_for(key.record.version);
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(Error::Metastore(format!(
                "cannot update unknown key version {}",
                key.record.version
            )));
        }

        let tmp = self.write_temp(key).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Io(e));
        }
        Ok(())
    }
}
