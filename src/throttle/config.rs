//! Configuration for the grouped throttled queue.

use std::num::ParseIntError;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable overriding [`ThrottleConfig::max_batch_size`].
pub const MAX_BATCH_SIZE_VAR: &str = "KEYLANE_MAX_BATCH_SIZE";

/// Environment variable overriding [`ThrottleConfig::max_delay`], in milliseconds.
pub const MAX_DELAY_MS_VAR: &str = "KEYLANE_MAX_DELAY_MS";

/// Errors produced while loading a [`ThrottleConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {source}")]
    Invalid {
        var: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
}

/// Batching limits for a [`GroupedThrottledQueue`](super::GroupedThrottledQueue).
///
/// Deserializes from a config section such as
/// `{ "max_batch_size": 50, "max_delay_ms": 3000 }`; missing fields keep
/// their defaults.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use keylane::throttle::ThrottleConfig;
///
/// let config = ThrottleConfig::default()
///     .with_max_batch_size(50)
///     .with_max_delay(Duration::from_secs(3));
/// assert_eq!(config.max_batch_size, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Largest number of items handed to the handler in one call.
    #[serde(deserialize_with = "at_least_one")]
    pub max_batch_size: usize,

    /// How long after the first buffered item an automatic flush happens.
    #[serde(rename = "max_delay_ms", deserialize_with = "millis")]
    pub max_delay: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ThrottleConfig {
    /// Sets the batch size cap. `0` is treated as `1`.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// Sets the automatic flush delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Defaults overridden by [`MAX_BATCH_SIZE_VAR`] and [`MAX_DELAY_MS_VAR`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is set but is not a
    /// non-negative integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(MAX_BATCH_SIZE_VAR) {
            config = config.with_max_batch_size(parse(MAX_BATCH_SIZE_VAR, value)?);
        }
        if let Some(value) = lookup(MAX_DELAY_MS_VAR) {
            config = config.with_max_delay(Duration::from_millis(parse(MAX_DELAY_MS_VAR, value)?));
        }

        Ok(config)
    }

    /// The batch size cap actually applied when splitting buffers.
    pub(crate) fn batch_limit(&self) -> usize {
        self.max_batch_size.max(1)
    }
}

fn parse<N>(var: &'static str, value: String) -> Result<N, ConfigError>
where
    N: std::str::FromStr<Err = ParseIntError>,
{
    let parsed = value.trim().parse();
    parsed.map_err(|source| ConfigError::Invalid { var, value, source })
}

fn at_least_one<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    usize::deserialize(deserializer).map(|n| n.max(1))
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
