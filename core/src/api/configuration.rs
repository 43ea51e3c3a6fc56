use crate::types::RuntimeMode;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

pub const DEFAULT_PORT: u16 = 8024;
/// 100 MiB, the largest accepted request body.
pub const DEFAULT_BODY_LIMIT: usize = 100 * 1024 * 1024;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct APIConfig {
	/// Gateway HTTP server host name (default: 0.0.0.0).
	pub http_server_host: String,
	/// Gateway HTTP server port, shared by all workers (default: 8024).
	pub http_server_port: u16,
	/// Maximum accepted request body size in bytes (default: 100 MiB).
	pub max_body_size: usize,
	/// Production hides diagnostic detail from error responses (default: production).
	pub mode: RuntimeMode,
	/// Log every request body at debug level (default: false).
	pub log_request_body: bool,
}

impl Default for APIConfig {
	fn default() -> Self {
		Self {
			http_server_host: "0.0.0.0".to_owned(),
			http_server_port: DEFAULT_PORT,
			max_body_size: DEFAULT_BODY_LIMIT,
			mode: RuntimeMode::default(),
			log_request_body: false,
		}
	}
}

impl APIConfig {
	pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
		let host: IpAddr = self.http_server_host.parse()?;
		Ok(SocketAddr::new(host, self.http_server_port))
	}
}

#[cfg(test)]
mod tests {
	use super::APIConfig;

	#[test]
	fn default_listen_address() {
		let addr = APIConfig::default().socket_addr().unwrap();
		assert_eq!(addr.to_string(), "0.0.0.0:8024");
	}

	#[test]
	fn rejects_host_names() {
		let config = APIConfig {
			http_server_host: "localhost".to_string(),
			..Default::default()
		};
		assert!(config.socket_addr().is_err());
	}
}
