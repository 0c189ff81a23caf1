use crate::crypto::aead::{new_nonce, GCM_MAX_DATA_SIZE, GCM_NONCE_SIZE, GCM_TAG_SIZE};
use crate::crypto::AES_256_GCM;
use crate::error::{Error, Result};
use crate::Aead;
use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    Aes256Gcm, Nonce,
};

/// AES-256-GCM implementation of AEAD
#[derive(Default, Debug, Clone)]
pub struct Aes256GcmAead;

impl Aes256GcmAead {
    /// Creates a new instance of the AES-256-GCM AEAD implementation
    pub fn new() -> Self {
        Self
    }

    fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Crypto(format!("Invalid AES-256 key length: {}", key.len())))
    }

    fn check_nonce(nonce: &[u8]) -> Result<()> {
        if nonce.len() != GCM_NONCE_SIZE {
            return Err(Error::Crypto(format!(
                "Nonce must be {} bytes, got {}",
                GCM_NONCE_SIZE,
                nonce.len()
            )));
        }
        Ok(())
    }
}

impl Aead for Aes256GcmAead {
    fn algorithm(&self) -> &'static str {
        AES_256_GCM
    }

    fn seal(&self, data: &[u8], key: &[u8], nonce: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() > GCM_MAX_DATA_SIZE {
            return Err(Error::Crypto("Data too large for GCM".into()));
        }
        Self::check_nonce(nonce)?;

        let cipher = Self::cipher(key)?;
        cipher
            .encrypt(Nonce::from_slice(nonce), Payload { msg: data, aad })
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
    }

    fn open(&self, data: &[u8], key: &[u8], nonce: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < GCM_TAG_SIZE {
            return Err(Error::Crypto("Data length is too short for GCM tag".into()));
        }
        Self::check_nonce(nonce)?;

        let cipher = Self::cipher(key)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: data, aad })
            .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
    }

    fn encrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let nonce = new_nonce();
        let ciphertext = self.seal(data, key, &nonce, &[])?;

        // Nonce travels in front of the ciphertext (which includes the tag)
        let mut nonce_and_cipher = Vec::with_capacity(GCM_NONCE_SIZE + ciphertext.len());
        nonce_and_cipher.extend_from_slice(&nonce);
        nonce_and_cipher.extend_from_slice(&ciphertext);
        Ok(nonce_and_cipher)
    }

    fn decrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        if data.len() < GCM_NONCE_SIZE + GCM_TAG_SIZE {
            return Err(Error::Crypto(
                "Data length is too short for GCM (nonce + tag)".into(),
            ));
        }
        let (nonce, ciphertext) = data.split_at(GCM_NONCE_SIZE);
        self.open(ciphertext, key, nonce, &[])
    }
}
