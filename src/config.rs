use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time;

/// Default values for KmsConfig
pub const DEFAULT_KEY_STORE_PATH: &str = "keys";
pub const DEFAULT_REGISTRY_TIMEOUT: time::Duration = time::Duration::from_secs(5);
pub const DEFAULT_REGISTRY_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF: time::Duration = time::Duration::from_millis(100);
// 1 hour
pub const DEFAULT_ROTATION_CHECK_INTERVAL: time::Duration = time::Duration::from_secs(60 * 60);

/// Environment variables read by `KmsConfig::from_env`
pub const ENV_ENDPOINT: &str = "KMS_ENDPOINT";
pub const ENV_MASTER_KEY_ID: &str = "KMS_MASTER_KEY_ID";
pub const ENV_KEY_STORE_PATH: &str = "KMS_KEY_STORE_PATH";
pub const ENV_REGISTRY_TIMEOUT_MS: &str = "KMS_REGISTRY_TIMEOUT_MS";
pub const ENV_REGISTRY_RETRIES: &str = "KMS_REGISTRY_RETRIES";
pub const ENV_SERVICE_NAME: &str = "KMS_SERVICE_NAME";

/// Configuration for the key management service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsConfig {
    /// Identity recorded as the actor on audit events
    pub service_name: Option<String>,

    /// Remote KMS endpoint, if any
    pub endpoint: Option<String>,

    /// Identifier of the root key in the remote KMS
    pub master_key_id: Option<String>,

    /// Directory for the local master keyfile and persisted key versions
    pub key_store_path: PathBuf,

    /// Upper bound for a single registry call
    pub registry_timeout: time::Duration,

    /// Retries after a failed or timed out registry call
    pub registry_retries: u32,

    /// Backoff before the first retry; doubled for each further retry
    pub retry_backoff: time::Duration,

    /// How often the rotation scheduler checks the schedule
    pub rotation_check_interval: time::Duration,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            endpoint: None,
            master_key_id: None,
            key_store_path: PathBuf::from(DEFAULT_KEY_STORE_PATH),
            registry_timeout: DEFAULT_REGISTRY_TIMEOUT,
            registry_retries: DEFAULT_REGISTRY_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            rotation_check_interval: DEFAULT_ROTATION_CHECK_INTERVAL,
        }
    }
}

impl KmsConfig {
    /// Creates a new KmsConfig with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`, which maps a variable name to its value
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        config.service_name = non_empty(ENV_SERVICE_NAME);
        config.endpoint = non_empty(ENV_ENDPOINT);
        config.master_key_id = non_empty(ENV_MASTER_KEY_ID);
        if let Some(path) = non_empty(ENV_KEY_STORE_PATH) {
            config.key_store_path = PathBuf::from(path);
        }
        if let Some(ms) = non_empty(ENV_REGISTRY_TIMEOUT_MS) {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                Error::Config(format!(
                    "{} must be a number of milliseconds, got {:?}",
                    ENV_REGISTRY_TIMEOUT_MS, ms
                ))
            })?;
            config.registry_timeout = time::Duration::from_millis(ms);
        }
        if let Some(retries) = non_empty(ENV_REGISTRY_RETRIES) {
            config.registry_retries = retries.trim().parse().map_err(|_| {
                Error::Config(format!(
                    "{} must be a non-negative integer, got {:?}",
                    ENV_REGISTRY_RETRIES, retries
                ))
            })?;
        }

        if config.uses_local_fallback() {
            log::warn!(
                "using local key storage in {}; configure {} and {} for production",
                config.key_store_path.display(),
                ENV_ENDPOINT,
                ENV_MASTER_KEY_ID
            );
        }

        Ok(config)
    }

    /// True when no remote KMS is fully configured and the local master
    /// keyfile should be used instead
    pub fn uses_local_fallback(&self) -> bool {
        self.endpoint.is_none() || self.master_key_id.is_none()
    }

    /// Path of the local master keyfile
    pub fn master_keyfile(&self) -> PathBuf {
        self.key_store_path.join("master.key")
    }

    /// Directory holding persisted key versions
    pub fn versions_dir(&self) -> PathBuf {
        self.key_store_path.join("versions")
    }

    /// Sets the service name recorded on audit events
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Sets the key store directory
    pub fn with_key_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_store_path = path.into();
        self
    }

    /// Sets the registry call timeout
    ///
    /// # Example
    /// ```
    /// use walletkms::config::KmsConfig;
    /// use std::time::Duration;
    ///
    /// let config = KmsConfig::new().with_registry_timeout(Duration::from_secs(2));
    /// assert_eq!(config.registry_timeout, Duration::from_secs(2));
    /// ```
    pub fn with_registry_timeout(mut self, timeout: time::Duration) -> Self {
        self.registry_timeout = timeout;
        self
    }

    /// Sets the retry count and initial backoff for registry calls
    pub fn with_registry_retries(mut self, retries: u32, backoff: time::Duration) -> Self {
        self.registry_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_rotation_check_interval(mut self, interval: time::Duration) -> Self {
        self.rotation_check_interval = interval;
        self
    }
}
