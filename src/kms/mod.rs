//! Root key services for wrapping per-version data keys
//!
//! - Static master key for local development and tests, optionally loaded from
//!   (or created at) a keyfile
//! - Cloud KMS integrations plug in by implementing the `KeyEncryptionService` trait

mod static_kms;

pub use static_kms::StaticKeyEncryptionService;
