//! Relay and pool configuration.

use std::time::Duration;

use nostr::nip77::{DEFAULT_FRAME_SIZE_LIMIT, MIN_FRAME_SIZE_LIMIT};
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid NOSTR_POOL_MAX_RELAYS: {0}")]
    InvalidMaxRelays(String),
    #[error("invalid NOSTR_POOL_EOSE_TIMEOUT_MS: {0}")]
    InvalidEoseTimeout(String),
    #[error("invalid NOSTR_RELAY_CONNECT_TIMEOUT_MS: {0}")]
    InvalidConnectTimeout(String),
    #[error("invalid NOSTR_RELAY_CONNECT_ATTEMPTS: {0}")]
    InvalidConnectAttempts(String),
    #[error("invalid NOSTR_RELAY_PUBLISH_TIMEOUT_MS: {0}")]
    InvalidPublishTimeout(String),
    #[error("invalid NOSTR_RELAY_PUBLISH_ATTEMPTS: {0}")]
    InvalidPublishAttempts(String),
    #[error("invalid NOSTR_RELAY_AUTO_RECONNECT: {0}")]
    InvalidAutoReconnect(String),
    #[error("invalid NOSTR_RELAY_FRAME_SIZE_LIMIT: {0}")]
    InvalidFrameSizeLimit(String),
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the exponential delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Random spread as a fraction of the delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry `attempt` (1-indexed), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let seconds = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(seconds.max(0.0))
    }

    /// Delay before retry `attempt` (1-indexed), jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let spread = base.as_secs_f64() * self.jitter.clamp(0.0, 1.0);
        if spread.is_nan() || spread <= 0.0 {
            return base;
        }
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }
}

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    /// Tries made by a caller-driven `connect`.
    pub connect_attempts: u32,
    /// Time to wait for the relay's `OK` to one publish attempt.
    pub publish_timeout: Duration,
    /// Tries made by `publish` when the transport fails.
    pub publish_attempts: u32,
    /// Timeout for `COUNT` replies and each negentropy round trip.
    pub request_timeout: Duration,
    /// Reconnect forever in the background after the connection drops.
    pub auto_reconnect: bool,
    /// Negentropy frame size limit; `0` disables it.
    pub frame_size_limit: u64,
    pub backoff: BackoffConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            connect_attempts: 3,
            publish_timeout: Duration::from_secs(10),
            publish_attempts: 3,
            request_timeout: Duration::from_secs(30),
            auto_reconnect: true,
            frame_size_limit: DEFAULT_FRAME_SIZE_LIMIT,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of relays in the pool.
    pub max_relays: usize,
    /// How long a request waits for one relay's EOSE before giving up on it.
    pub eose_timeout: Duration,
    /// Relay configuration template.
    pub relay_config: RelayConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_relays: 16,
            eose_timeout: Duration::from_secs(10),
            relay_config: RelayConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `NOSTR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `NOSTR_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let relay = &mut config.relay_config;

        if let Some(value) = lookup("NOSTR_POOL_MAX_RELAYS") {
            config.max_relays = parse_number(&value, ConfigError::InvalidMaxRelays)?;
        }
        if let Some(value) = lookup("NOSTR_POOL_EOSE_TIMEOUT_MS") {
            config.eose_timeout = parse_millis(&value, ConfigError::InvalidEoseTimeout)?;
        }
        if let Some(value) = lookup("NOSTR_RELAY_CONNECT_TIMEOUT_MS") {
            relay.connect_timeout = parse_millis(&value, ConfigError::InvalidConnectTimeout)?;
        }
        if let Some(value) = lookup("NOSTR_RELAY_CONNECT_ATTEMPTS") {
            relay.connect_attempts = parse_attempts(&value, ConfigError::InvalidConnectAttempts)?;
        }
        if let Some(value) = lookup("NOSTR_RELAY_PUBLISH_TIMEOUT_MS") {
            relay.publish_timeout = parse_millis(&value, ConfigError::InvalidPublishTimeout)?;
        }
        if let Some(value) = lookup("NOSTR_RELAY_PUBLISH_ATTEMPTS") {
            relay.publish_attempts = parse_attempts(&value, ConfigError::InvalidPublishAttempts)?;
        }
        if let Some(value) = lookup("NOSTR_RELAY_AUTO_RECONNECT") {
            relay.auto_reconnect = parse_bool(&value)
                .ok_or_else(|| ConfigError::InvalidAutoReconnect(value.clone()))?;
        }
        if let Some(value) = lookup("NOSTR_RELAY_FRAME_SIZE_LIMIT") {
            let limit: u64 = parse_number(&value, ConfigError::InvalidFrameSizeLimit)?;
            if limit != 0 && limit < MIN_FRAME_SIZE_LIMIT {
                return Err(ConfigError::InvalidFrameSizeLimit(format!(
                    "{limit} is below the minimum of {MIN_FRAME_SIZE_LIMIT}"
                )));
            }
            relay.frame_size_limit = limit;
        }

        Ok(config)
    }
}

fn parse_number<T>(value: &str, error: fn(String) -> ConfigError) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|parse_error| error(format!("{value:?}: {parse_error}")))
}

fn parse_millis(value: &str, error: fn(String) -> ConfigError) -> Result<Duration, ConfigError> {
    parse_number::<u64>(value, error).map(Duration::from_millis)
}

fn parse_attempts(value: &str, error: fn(String) -> ConfigError) -> Result<u32, ConfigError> {
    match parse_number::<u32>(value, error)? {
        0 => Err(error("attempts must be at least 1".to_string())),
        attempts => Ok(attempts),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
