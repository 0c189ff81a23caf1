//! Cryptographic primitives for the key management service

mod aead;
pub mod aes256gcm;

pub use aead::{fill_random, new_nonce, GCM_NONCE_SIZE, GCM_TAG_SIZE};
pub use aes256gcm::Aes256GcmAead;

/// Algorithm identifier recorded on key versions and encryption results
pub const AES_256_GCM: &str = "aes-256-gcm";
