use thiserror::Error;

/// Result type for walletkms operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the key management service
#[derive(Error, Debug)]
pub enum Error {
    /// The registry has no active key, so nothing can be encrypted yet
    #[error("No active key: the key registry has not been initialized")]
    NoActiveKey,

    /// Rotation was requested before any key version exists
    #[error("No current key: cannot rotate before a first key is issued")]
    NoCurrentKey,

    /// A ciphertext referenced a key version that was never issued
    #[error("Key version {0} not found")]
    KeyVersionNotFound(u32),

    /// A ciphertext referenced a key version that has been revoked
    #[error("Key version {0} has been revoked")]
    KeyRevoked(u32),

    /// The active key version cannot be revoked; rotate first
    #[error("Cannot revoke active key version {0}; rotate keys first")]
    CannotRevokeActiveKey(u32),

    /// Emergency rotation trigger is not configured or emergency rotation is disabled
    #[error("Emergency rotation trigger not allowed: {0}")]
    TriggerNotAllowed(String),

    /// A dependency (registry, KMS, metastore) is temporarily unreachable
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Errors related to root key wrapping
    #[error("KMS error: {0}")]
    Kms(String),

    /// Errors related to metastore operations
    #[error("Metastore error: {0}")]
    Metastore(String),

    /// Errors related to cryptographic operations
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Errors related to JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors related to I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A key version is not in a state that allows the requested transition
    #[error("Invalid key state: {0}")]
    InvalidKeyState(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable name of the error kind, used in audit outcomes
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NoActiveKey => "NoActiveKey",
            Error::NoCurrentKey => "NoCurrentKey",
            Error::KeyVersionNotFound(_) => "KeyVersionNotFound",
            Error::KeyRevoked(_) => "KeyRevoked",
            Error::CannotRevokeActiveKey(_) => "CannotRevokeActiveKey",
            Error::TriggerNotAllowed(_) => "TriggerNotAllowed",
            Error::ServiceUnavailable(_) => "ServiceUnavailable",
            Error::Kms(_) => "Kms",
            Error::Metastore(_) => "Metastore",
            Error::Crypto(_) => "Crypto",
            Error::Json(_) => "Json",
            Error::Io(_) => "Io",
            Error::InvalidKeyState(_) => "InvalidKeyState",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::Config(_) => "Config",
            Error::Internal(_) => "Internal",
        }
    }

    /// Returns true if the failure is transient and the call may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ServiceUnavailable(_))
    }
}
