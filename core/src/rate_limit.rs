//! Per-client admission control.
//!
//! The pipeline only depends on [`RateLimiter`]; [`FixedWindowLimiter`] is the
//! bundled in-process strategy. Each worker process keeps its own windows.

use crate::types::duration_seconds_format;
use async_trait::async_trait;
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	net::{IpAddr, SocketAddr},
	sync::{Mutex, PoisonError},
	time::{Duration, Instant},
};
use tracing::debug;

const FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
	pub client_key: String,
	pub allowed: bool,
	pub retry_after: Option<Duration>,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
	async fn decide(&self, client_key: &str) -> RateLimitDecision;
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
	/// Length of a rate limit window, in seconds (default: 60).
	#[serde(with = "duration_seconds_format")]
	pub window: Duration,
	/// Requests a single client may send per window (default: 600).
	pub max_requests: u32,
	/// Upper bound of clients tracked at once; the stalest window is evicted beyond it (default: 10000).
	pub max_tracked_clients: usize,
	/// Peers whose `X-Forwarded-For` header names the client. Unset trusts every peer,
	/// an empty list none, in which case clients are keyed by peer address (default: unset).
	pub trusted_proxies: Option<Vec<IpAddr>>,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			window: Duration::from_secs(60),
			max_requests: 600,
			max_tracked_clients: 10_000,
			trusted_proxies: None,
		}
	}
}

/// Client identity: first hop of `X-Forwarded-For` when `remote` is a trusted proxy,
/// else the peer address.
pub fn client_key(
	headers: &HeaderMap,
	remote: Option<SocketAddr>,
	trusted_proxies: Option<&[IpAddr]>,
) -> String {
	let trusted = match trusted_proxies {
		None => true,
		Some(proxies) => remote.is_some_and(|remote| proxies.contains(&remote.ip())),
	};
	headers
		.get(FORWARDED_FOR)
		.filter(|_| trusted)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.split(',').next())
		.map(str::trim)
		.filter(|value| !value.is_empty())
		.map(str::to_string)
		.or_else(|| remote.map(|remote| remote.ip().to_string()))
		.unwrap_or_else(|| "unknown".to_string())
}

struct Window {
	started: Instant,
	count: u32,
}

pub struct FixedWindowLimiter {
	config: RateLimitConfig,
	windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowLimiter {
	pub fn new(config: RateLimitConfig) -> Self {
		FixedWindowLimiter {
			config,
			windows: Mutex::new(HashMap::new()),
		}
	}

	fn admit(&self, client_key: &str, now: Instant) -> Result<(), Duration> {
		let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

		if !windows.contains_key(client_key) && windows.len() >= self.config.max_tracked_clients {
			let window = self.config.window;
			windows.retain(|_, entry| now.duration_since(entry.started) < window);
			if windows.len() >= self.config.max_tracked_clients {
				let stalest = windows
					.iter()
					.min_by_key(|(_, entry)| entry.started)
					.map(|(key, _)| key.clone());
				if let Some(key) = stalest {
					debug!(client_key = %key, "Evicting rate limit window");
					windows.remove(&key);
				}
			}
		}

		let entry = windows.entry(client_key.to_string()).or_insert(Window {
			started: now,
			count: 0,
		});

		let elapsed = now.duration_since(entry.started);
		if elapsed >= self.config.window {
			entry.started = now;
			entry.count = 0;
		}

		if entry.count >= self.config.max_requests {
			return Err(self.config.window.saturating_sub(now.duration_since(entry.started)));
		}
		entry.count += 1;
		Ok(())
	}

	pub fn tracked_clients(&self) -> usize {
		self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
	}
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
	async fn decide(&self, client_key: &str) -> RateLimitDecision {
		let result = self.admit(client_key, Instant::now());
		RateLimitDecision {
			client_key: client_key.to_string(),
			allowed: result.is_ok(),
			retry_after: result.err(),
		}
	}
}
