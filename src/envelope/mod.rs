//! Envelope encryption records handed to callers
//!
//! An `EncryptionResult` is everything a caller has to persist next to the
//! protected record (wallet private key, card payload) to decrypt it later.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The opaque value returned by an encryption and stored by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionResult {
    /// Ciphertext including the authentication tag
    #[serde(with = "crate::util::base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// Key version the payload was encrypted under
    pub key_version: u32,
    /// Algorithm of that key version
    pub algorithm: String,
    /// Nonce used for this encryption only
    #[serde(with = "crate::util::base64_bytes")]
    pub iv: Vec<u8>,
}

impl EncryptionResult {
    /// Serializes the result as JSON for storage
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a result previously produced by `to_json`
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Caller-supplied key/value pairs bound to a ciphertext as associated data
///
/// The same context must be presented again to decrypt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContext(BTreeMap<String, String>);

impl EncryptionContext {
    /// Creates an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry to the context
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Builds the associated data binding a ciphertext to its key version,
/// algorithm and context
pub(crate) fn associated_data(
    key_version: u32,
    algorithm: &str,
    context: &EncryptionContext,
) -> Result<Vec<u8>> {
    let mut aad = format!("walletkms:v{}:{}:", key_version, algorithm).into_bytes();
    // BTreeMap keeps the encoding canonical regardless of insertion order
    aad.extend_from_slice(&serde_json::to_vec(&context.0)?);
    Ok(aad)
}
