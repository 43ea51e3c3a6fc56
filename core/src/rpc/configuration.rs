use crate::types::{duration_seconds_format, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct RPCConfig {
	/// HTTP JSON-RPC endpoint of the Godwoken node (required, no default).
	pub url: String,
	/// Timeout of a single upstream request, in seconds (default: 30).
	#[serde(with = "duration_seconds_format")]
	pub request_timeout: Duration,
	/// Set the configuration based on which the retries will be orchestrated, max duration [in milliseconds] between retries and number of tries.
	/// Only idempotent calls made by the gateway itself are retried, forwarded client calls never are.
	/// (default:
	/// fibonacci:
	///     base: 1,
	///     max_delay: 10000,
	///     retries: 8,
	/// )
	pub retry: RetryConfig,
}

impl Default for RPCConfig {
	fn default() -> Self {
		Self {
			url: String::new(),
			request_timeout: Duration::from_secs(30),
			retry: RetryConfig::default(),
		}
	}
}
