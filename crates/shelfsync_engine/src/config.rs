//! Configuration for the sync engine.

use crate::error::{EngineResult, SyncError};
use shelfsync_model::EntityKind;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Largest page the remote API serves.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Configuration for sync runs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retry configuration for remote calls within a run.
    pub retry: RetryConfig,
    /// Failed runs a queue item survives before it is abandoned.
    pub max_item_retries: u32,
    /// Entity kinds to synchronize, in order.
    pub kinds: Vec<EntityKind>,
    /// Fields tried, in order, to match an unlinked local entity to a
    /// remote record.
    pub natural_key_fields: Vec<String>,
    /// Records requested per remote page.
    pub page_size: u32,
}

impl SyncConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_item_retries: 5,
            kinds: EntityKind::ALL.to_vec(),
            natural_key_fields: vec!["isbn".to_string(), "isbn13".to_string()],
            page_size: MAX_PAGE_SIZE,
        }
    }

    /// Loads overrides from `SHELFSYNC_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` if a variable is present but malformed.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads overrides through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` if a variable is present but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let mut config = Self::new();

        if let Some(attempts) = parse_var::<u32>(&lookup, "SHELFSYNC_SYNC_RETRY_MAX")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(secs) = parse_var::<f64>(&lookup, "SHELFSYNC_SYNC_RETRY_DELAY")? {
            config.retry.initial_backoff = Duration::try_from_secs_f64(secs).map_err(|e| {
                SyncError::Config(format!("SHELFSYNC_SYNC_RETRY_DELAY: {e}"))
            })?;
        }
        if let Some(max) = parse_var::<u32>(&lookup, "SHELFSYNC_MAX_ITEM_RETRIES")? {
            config.max_item_retries = max;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-item retry ceiling.
    pub fn with_max_item_retries(mut self, max: u32) -> Self {
        self.max_item_retries = max;
        self
    }

    /// Restricts the synchronized kinds.
    pub fn with_kinds(mut self, kinds: Vec<EntityKind>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Sets the natural-key fields.
    pub fn with_natural_key_fields(mut self, fields: Vec<String>) -> Self {
        self.natural_key_fields = fields;
        self
    }

    /// Sets the remote page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` describing the first problem found.
    pub fn validate(&self) -> EngineResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(SyncError::Config("backoff multiplier must be >= 1.0".into()));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(SyncError::Config(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if self.kinds.is_empty() {
            return Err(SyncError::Config("no entity kinds to sync".into()));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per remote call, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the computed backoff.
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial backoff.
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Sets the maximum backoff.
    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Backoff to wait after the given failed attempt (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());

        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Connection settings for the remote record API.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL of the API.
    pub endpoint: String,
    /// Bearer token.
    pub api_token: String,
    /// Remote collection name per entity kind.
    pub collections: BTreeMap<EntityKind, String>,
    /// Minimum spacing between requests.
    pub min_request_interval: Duration,
    /// Request timeout.
    pub timeout: Duration,
}

impl RemoteConfig {
    /// Creates a remote configuration without collections.
    pub fn new(endpoint: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_token: api_token.into(),
            collections: BTreeMap::new(),
            min_request_interval: Duration::from_millis(350),
            timeout: Duration::from_secs(30),
        }
    }

    /// Loads the remote configuration from `SHELFSYNC_*` environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` if a required variable is missing.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the remote configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` if a required variable is missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = Self::new(
            non_empty("SHELFSYNC_REMOTE_URL").unwrap_or_default(),
            non_empty("SHELFSYNC_API_TOKEN").unwrap_or_default(),
        );
        if let Some(books) = non_empty("SHELFSYNC_BOOKS_COLLECTION") {
            config = config.with_collection(EntityKind::Book, books);
        }
        if let Some(logs) = non_empty("SHELFSYNC_READING_LOGS_COLLECTION") {
            config = config.with_collection(EntityKind::ReadingLog, logs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Maps an entity kind to a remote collection.
    pub fn with_collection(mut self, kind: EntityKind, name: impl Into<String>) -> Self {
        self.collections.insert(kind, name.into());
        self
    }

    /// Sets the minimum spacing between requests.
    pub fn with_min_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval = interval;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the collection for a kind, if configured.
    pub fn collection(&self, kind: EntityKind) -> Option<&str> {
        self.collections.get(&kind).map(String::as_str)
    }

    /// Kinds that have a collection configured.
    pub fn configured_kinds(&self) -> Vec<EntityKind> {
        self.collections.keys().copied().collect()
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` if the endpoint, token or book collection
    /// is missing.
    pub fn validate(&self) -> EngineResult<()> {
        if self.endpoint.is_empty() {
            return Err(SyncError::Config("SHELFSYNC_REMOTE_URL is not set".into()));
        }
        if self.api_token.is_empty() {
            return Err(SyncError::Config("SHELFSYNC_API_TOKEN is not set".into()));
        }
        if self.collection(EntityKind::Book).is_none() {
            return Err(SyncError::Config(
                "SHELFSYNC_BOOKS_COLLECTION is not set".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> EngineResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SyncError::Config(format!("{key}={raw}: {e}"))),
    }
}
