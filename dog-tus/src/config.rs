use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::{TusError, TusResult};

/// Version sent in the `Tus-Resumable` header
pub const TUS_VERSION: &str = "1.0.0";

/// Default chunk size for PATCH requests (500 KiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 500 * 1024;

/// Default retry ceiling per request
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration for an upload session
#[derive(Debug, Clone)]
pub struct TusConfig {
    /// Creation endpoint every new upload is POSTed to
    pub endpoint: String,

    /// Bytes sent per PATCH unless an upload overrides it
    pub chunk_size: u64,

    /// Attempts per request before a transient failure surfaces
    pub max_retries: u32,

    /// Base delay before a retried request (doubles per attempt)
    pub retry_backoff: Duration,

    /// Upper bound for the retry delay
    pub max_retry_backoff: Duration,

    /// Per-request timeout applied by the HTTP transport
    pub request_timeout: Duration,

    /// Value of the `Tus-Resumable` header
    pub tus_version: String,

    /// Headers added to every request before the upload's own headers
    pub default_headers: BTreeMap<String, String>,

    /// Where byte buffers and media exports are materialized so they survive a restart
    pub staging_dir: Option<PathBuf>,

    /// Capacity of the session event broadcast channel
    pub event_capacity: usize,
}

impl Default for TusConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:1080/files/".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(500),
            max_retry_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            tus_version: TUS_VERSION.to_string(),
            default_headers: BTreeMap::new(),
            staging_dir: None,
            event_capacity: 1024,
        }
    }
}

impl TusConfig {
    /// Create a config for the given creation endpoint
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Build a config from `DOG_TUS_*` environment variables
    pub fn from_env() -> TusResult<Self> {
        let endpoint = std::env::var("DOG_TUS_ENDPOINT")
            .map_err(|_| TusError::Config("DOG_TUS_ENDPOINT is not set".to_string()))?;
        let mut config = Self::new(endpoint);

        if let Ok(value) = std::env::var("DOG_TUS_CHUNK_SIZE") {
            config.chunk_size = value
                .parse()
                .map_err(|_| TusError::Config(format!("Invalid DOG_TUS_CHUNK_SIZE: {}", value)))?;
        }
        if let Ok(value) = std::env::var("DOG_TUS_MAX_RETRIES") {
            config.max_retries = value
                .parse()
                .map_err(|_| TusError::Config(format!("Invalid DOG_TUS_MAX_RETRIES: {}", value)))?;
        }
        if let Ok(value) = std::env::var("DOG_TUS_STAGING_DIR") {
            config.staging_dir = Some(PathBuf::from(value));
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the config is usable
    pub fn validate(&self) -> TusResult<()> {
        self.endpoint_url()?;
        if self.chunk_size == 0 {
            return Err(TusError::Config("chunk_size must be greater than zero".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(TusError::Config("event_capacity must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Parsed creation endpoint
    pub fn endpoint_url(&self) -> TusResult<Url> {
        Ok(Url::parse(&self.endpoint)?)
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set base and maximum retry delay
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = base;
        self.max_retry_backoff = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_default_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }

    pub fn with_staging_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Delay before the given retry attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_retry_backoff)
            .min(self.max_retry_backoff)
    }
}
