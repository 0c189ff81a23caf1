use crate::crypto::{fill_random, Aes256GcmAead};
use crate::error::{Error, Result};
use crate::{Aead, KeyEncryptionService, AES256_KEY_SIZE};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use zeroize::Zeroizing;

/// A key encryption service backed by a master key held in process memory
///
/// Useful for development and tests, and as the local fallback when no remote
/// KMS endpoint is configured. The master key is wiped when the service is dropped.
pub struct StaticKeyEncryptionService {
    /// The static master key
    master_key: Zeroizing<Vec<u8>>,
    /// AEAD implementation for wrapping
    aead: Aes256GcmAead,
}

impl fmt::Debug for StaticKeyEncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyEncryptionService")
            .field("master_key", &"<hidden>")
            .finish()
    }
}

impl StaticKeyEncryptionService {
    /// Creates a new StaticKeyEncryptionService with the given master key
    pub fn new(master_key: Vec<u8>) -> Self {
        Self {
            master_key: Zeroizing::new(master_key),
            aead: Aes256GcmAead::new(),
        }
    }

    /// Loads the master key from `path`, generating and writing a new random
    /// key if the file does not exist yet
    pub async fn from_keyfile(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match tokio::fs::read(path).await {
            Ok(bytes) => Self::from_key_bytes(path, bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::create_keyfile(path).await,
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn from_key_bytes(path: &Path, bytes: Vec<u8>) -> Result<Self> {
        let bytes = Zeroizing::new(bytes);
        if bytes.len() != AES256_KEY_SIZE {
            return Err(Error::Kms(format!(
                "Master keyfile {} must be exactly {} bytes, got {}",
                path.display(),
                AES256_KEY_SIZE,
                bytes.len()
            )));
        }
        log::debug!("loaded master key from {}", path.display());
        Ok(Self {
            master_key: bytes,
            aead: Aes256GcmAead::new(),
        })
    }

    /// Writes a fresh random master key to `path`
    ///
    /// The file is created exclusively and owner-only from the start. If
    /// another process creates it first, its key is loaded instead.
    async fn create_keyfile(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut key = Zeroizing::new(vec![0_u8; AES256_KEY_SIZE]);
        fill_random(&mut key);

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = match options.open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                log::debug!("master keyfile {} created concurrently", path.display());
                let bytes = tokio::fs::read(path).await?;
                return Self::from_key_bytes(path, bytes);
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let written = async {
            file.write_all(&key).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            // A partial keyfile would be rejected on every later start
            let _ = tokio::fs::remove_file(path).await;
            return Err(Error::Io(e));
        }

        log::info!("generated new local master key at {}", path.display());
        Ok(Self {
            master_key: key,
            aead: Aes256GcmAead::new(),
        })
    }
}

#[async_trait]
impl KeyEncryptionService for StaticKeyEncryptionService {
    async fn encrypt_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.aead
            .encrypt(key, &self.master_key)
            .map_err(|e| Error::Kms(format!("wrap failed: {}", e)))
    }

    async fn decrypt_key(&self, encrypted_key: &[u8]) -> Result<Vec<u8>> {
        self.aead
            .decrypt(encrypted_key, &self.master_key)
            .map_err(|e| Error::Kms(format!("unwrap failed: {}", e)))
    }
}
