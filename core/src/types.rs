use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff, FibonacciBackoff};

/// Controls how much diagnostic detail leaks into client-facing error responses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
	#[default]
	Production,
	Development,
}

impl RuntimeMode {
	pub fn exposes_diagnostics(&self) -> bool {
		matches!(self, RuntimeMode::Development)
	}
}

impl fmt::Display for RuntimeMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			RuntimeMode::Production => "production",
			RuntimeMode::Development => "development",
		})
	}
}

/// Delay schedule used between failed attempts.
///
/// Serialized as a tagged table, e.g.
/// ```toml
/// [retry]
/// type = "fibonacci"
/// base = 1
/// max_delay = 10000
/// retries = 8
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum RetryConfig {
	#[serde(rename = "exponential")]
	Exponential(BackoffConfig),

	#[serde(rename = "fibonacci")]
	Fibonacci(BackoffConfig),
}

impl RetryConfig {
	/// Longest delay this policy will ever produce.
	pub fn max_delay(&self) -> Duration {
		match self {
			RetryConfig::Exponential(config) | RetryConfig::Fibonacci(config) => config.max_delay,
		}
	}
}

impl Default for RetryConfig {
	fn default() -> Self {
		RetryConfig::Fibonacci(BackoffConfig {
			base: 1,
			max_delay: Duration::from_millis(10000),
			retries: 8,
		})
	}
}

impl IntoIterator for RetryConfig {
	type Item = Duration;
	type IntoIter = std::vec::IntoIter<Self::Item>;

	fn into_iter(self) -> Self::IntoIter {
		match self {
			RetryConfig::Exponential(config) => ExponentialBackoff::from_millis(config.base)
				.factor(1000)
				.max_delay(config.max_delay)
				.map(jitter)
				.take(config.retries)
				.collect::<Vec<Duration>>()
				.into_iter(),
			RetryConfig::Fibonacci(config) => FibonacciBackoff::from_millis(config.base)
				.factor(1000)
				.max_delay(config.max_delay)
				.map(jitter)
				.take(config.retries)
				.collect::<Vec<Duration>>()
				.into_iter(),
		}
	}
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BackoffConfig {
	pub base: u64,
	#[serde(with = "duration_millis_format")]
	pub max_delay: Duration,
	pub retries: usize,
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_seconds_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_secs())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(value))
	}
}

pub mod duration_millis_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_millis() as u64)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_millis(value))
	}
}

#[cfg(test)]
mod tests {
	use super::{BackoffConfig, RetryConfig, RuntimeMode};
	use std::time::Duration;
	use test_case::test_case;

	#[test_case(RuntimeMode::Production => false)]
	#[test_case(RuntimeMode::Development => true)]
	fn diagnostics_only_outside_production(mode: RuntimeMode) -> bool {
		mode.exposes_diagnostics()
	}

	#[test]
	fn retry_config_is_bounded() {
		let config = RetryConfig::Exponential(BackoffConfig {
			base: 2,
			max_delay: Duration::from_secs(5),
			retries: 4,
		});
		let delays = config.clone().into_iter().collect::<Vec<_>>();
		assert_eq!(delays.len(), 4);
		assert!(delays.iter().all(|delay| *delay <= config.max_delay()));
	}

	#[test]
	fn retry_config_from_toml_table() {
		let config: RetryConfig =
			serde_json::from_str(r#"{"type":"fibonacci","base":1,"max_delay":2000,"retries":3}"#)
				.unwrap();
		assert_eq!(
			config,
			RetryConfig::Fibonacci(BackoffConfig {
				base: 1,
				max_delay: Duration::from_millis(2000),
				retries: 3,
			})
		);
	}
}
