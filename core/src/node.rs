//! Required external initialization of a worker.

use crate::rpc::upstream::UpstreamClient;
use async_trait::async_trait;
use color_eyre::{eyre::WrapErr, Result};
#[cfg(test)]
use mockall::automock;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

/// Work a worker must complete before it binds its listener.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Initializer: Send + Sync {
	async fn init(&self) -> Result<()>;
}

/// Answer of `gw_get_node_info`, only the fields the gateway reads are typed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeInfo {
	pub version: String,
	#[serde(default)]
	pub mode: Option<String>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Shared slot filled once the upstream node answered.
pub type NodeInfoCell = Arc<OnceCell<NodeInfo>>;

pub struct NodeInitializer {
	client: Arc<UpstreamClient>,
	node_info: NodeInfoCell,
}

impl NodeInitializer {
	pub fn new(client: Arc<UpstreamClient>, node_info: NodeInfoCell) -> Self {
		NodeInitializer { client, node_info }
	}
}

#[async_trait]
impl Initializer for NodeInitializer {
	async fn init(&self) -> Result<()> {
		let node_info: NodeInfo = self
			.client
			.call_with_retries("gw_get_node_info", Value::Null)
			.await
			.wrap_err_with(|| format!("Godwoken node at {} is not available", self.client.url()))?;

		info!(
			version = %node_info.version,
			mode = ?node_info.mode,
			"Godwoken config initialized"
		);
		// a second init keeps the first answer
		let _ = self.node_info.set(node_info);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::{Initializer, NodeInfo, NodeInitializer};
	use crate::{
		rpc::{configuration::RPCConfig, types::Request, upstream::UpstreamClient},
		types::{BackoffConfig, RetryConfig},
	};
	use serde_json::json;
	use std::{sync::Arc, time::Duration};
	use warp::Filter;

	fn client(url: String) -> Arc<UpstreamClient> {
		let config = RPCConfig {
			url,
			request_timeout: Duration::from_secs(2),
			retry: RetryConfig::Fibonacci(BackoffConfig {
				base: 1,
				max_delay: Duration::from_millis(1),
				retries: 1,
			}),
		};
		Arc::new(UpstreamClient::new(&config).unwrap())
	}

	#[tokio::test]
	async fn stores_node_info() {
		let route = warp::post()
			.and(warp::body::json())
			.map(|request: Request| {
				warp::reply::json(&json!({
					"jsonrpc": "2.0",
					"id": request.id,
					"result": {"version": "1.14.0", "mode": "readonly", "backend": []}
				}))
			});
		let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
		tokio::spawn(server);

		let cell = Arc::default();
		let initializer = NodeInitializer::new(client(format!("http://{addr}")), Arc::clone(&cell));
		initializer.init().await.unwrap();

		let node_info: &NodeInfo = cell.get().unwrap();
		assert_eq!(node_info.version, "1.14.0");
		assert_eq!(node_info.mode.as_deref(), Some("readonly"));
		assert!(node_info.extra.contains_key("backend"));
	}

	#[tokio::test]
	async fn unreachable_node_fails() {
		// nothing listens on the discard port
		let cell = Arc::default();
		let initializer =
			NodeInitializer::new(client("http://127.0.0.1:9".to_string()), Arc::clone(&cell));
		assert!(initializer.init().await.is_err());
		assert!(cell.get().is_none());
	}
}
