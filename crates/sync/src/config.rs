//! Runtime configuration for the coordination layer.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;

const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080/live";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
	/// Live push channel settings.
	pub live: LiveConfig,
}

impl SyncConfig {
	/// Parses and validates a TOML document.
	pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(source)?;
		config.live.validate()?;
		Ok(config)
	}
}

/// Live push channel settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LiveConfig {
	/// Session-scoped live endpoint.
	pub endpoint: Url,
	/// Consecutive failed connection attempts before giving up.
	pub max_reconnect_attempts: u32,
	/// Fixed delay between attempts, in milliseconds.
	pub reconnect_delay_ms: u64,
}

impl LiveConfig {
	/// Default attempt budget.
	pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
	/// Default delay between attempts.
	pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;

	/// Creates a config for `endpoint` with default retry settings.
	pub fn new(endpoint: Url) -> Self {
		Self {
			endpoint,
			max_reconnect_attempts: Self::DEFAULT_MAX_RECONNECT_ATTEMPTS,
			reconnect_delay_ms: Self::DEFAULT_RECONNECT_DELAY_MS,
		}
	}

	/// Sets the attempt budget.
	#[must_use]
	pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
		self.max_reconnect_attempts = attempts;
		self
	}

	/// Sets the delay between attempts.
	#[must_use]
	pub fn reconnect_delay(mut self, delay: Duration) -> Self {
		self.reconnect_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
		self
	}

	/// Delay between attempts.
	pub fn delay(&self) -> Duration {
		Duration::from_millis(self.reconnect_delay_ms)
	}

	/// Rejects settings the subscriber cannot run with.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.max_reconnect_attempts == 0 {
			return Err(ConfigError::Invalid("live.max_reconnect_attempts must be at least 1".into()));
		}
		Ok(())
	}
}

impl Default for LiveConfig {
	fn default() -> Self {
		Self::new(Url::parse(DEFAULT_ENDPOINT).expect("default live endpoint is a valid URL"))
	}
}
