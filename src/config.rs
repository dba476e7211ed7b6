//! Cache configuration.
//!
//! Controls eligibility, key derivation, and storage limits via `strato.toml`
//! or `STRATO_*` environment variables.

use std::num::NonZeroUsize;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

const CONFIG_BASENAME: &str = "strato";
const ENV_PREFIX: &str = "STRATO";

// Default values for cache configuration
const DEFAULT_PREFIX: &str = "html_";
const DEFAULT_MINUTES: u64 = 360;
const DEFAULT_CAPACITY: usize = 200;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Strategy for turning the normalized request path into the page segment of
/// a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStyle {
    /// Join path segments with underscores; keys stay human-readable.
    Literal,
    /// Truncated SHA-256 digest of the path; fixed width regardless of depth.
    Hashed,
}

/// Cache configuration from `strato.toml` or `STRATO_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the page cache.
    pub enabled: bool,
    /// Prefix prepended to every cache key.
    pub prefix: String,
    /// Minutes a stored page stays valid.
    pub minutes: u64,
    /// Append the authenticated user id to the key (`-1` for anonymous).
    pub user_specific: bool,
    /// Paths exempt from caching, compared after slash trimming.
    pub ignored: Vec<String>,
    /// Page segment derivation strategy.
    pub key_style: KeyStyle,
    /// Maximum pages held by the bundled in-memory store.
    pub capacity: usize,
    /// Largest response body the middleware will store.
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: DEFAULT_PREFIX.to_string(),
            minutes: DEFAULT_MINUTES,
            user_specific: false,
            ignored: Vec::new(),
            key_style: KeyStyle::Literal,
            capacity: DEFAULT_CAPACITY,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl CacheConfig {
    /// Load configuration with layered precedence (file, then environment).
    ///
    /// Reads an optional `strato.toml` from the working directory, then
    /// applies `STRATO_*` overrides (`STRATO_IGNORED` is comma-separated).
    pub fn load() -> Result<Self, LoadError> {
        let config: Self = Config::builder()
            .add_source(File::with_name(CONFIG_BASENAME).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ignored"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()
    }

    fn validate(self) -> Result<Self, LoadError> {
        if self.minutes == 0 {
            return Err(LoadError::invalid("minutes", "must be greater than zero"));
        }
        if self.capacity == 0 {
            return Err(LoadError::invalid("capacity", "must be greater than zero"));
        }
        if self.max_body_bytes == 0 {
            return Err(LoadError::invalid(
                "max_body_bytes",
                "must be greater than zero",
            ));
        }
        Ok(self)
    }

    /// Time-to-live for stored pages, clamping zero minutes to one.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.minutes.max(1).saturating_mul(60))
    }

    /// Returns the store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}
