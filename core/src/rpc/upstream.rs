//! HTTP client for the upstream Godwoken node.

use super::{
	configuration::RPCConfig,
	types::{Output, Request, Response},
	Dispatcher,
};
use crate::{error::Error, error::UpstreamError, types::RetryConfig};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

pub struct UpstreamClient {
	http: reqwest::Client,
	url: String,
	retry: RetryConfig,
	next_id: AtomicU64,
}

impl UpstreamClient {
	pub fn new(config: &RPCConfig) -> Result<Self, UpstreamError> {
		let http = reqwest::Client::builder()
			.timeout(config.request_timeout)
			.build()?;
		Ok(UpstreamClient {
			http,
			url: config.url.clone(),
			retry: config.retry.clone(),
			next_id: AtomicU64::new(1),
		})
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	/// Sends a request as-is and returns the node's response object.
	pub async fn send(&self, request: &Request) -> Result<Response, UpstreamError> {
		let response = self.http.post(&self.url).json(request).send().await?;
		let status = response.status();
		if !status.is_success() {
			return Err(UpstreamError::Status(status.as_u16()));
		}
		let body = response.bytes().await?;
		Ok(serde_json::from_slice(&body)?)
	}

	/// Calls `method` under a gateway-owned request id and decodes the result.
	pub async fn call<T: DeserializeOwned>(
		&self,
		method: &str,
		params: Value,
	) -> Result<T, UpstreamError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let response = self.send(&Request::new(id, method, params)).await?;
		match response.output {
			Output::Success { result } => Ok(serde_json::from_value(result)?),
			Output::Failure { error } => Err(UpstreamError::Rpc(error)),
		}
	}

	/// Same as [`UpstreamClient::call`], retrying transient failures with the configured policy.
	pub async fn call_with_retries<T: DeserializeOwned>(
		&self,
		method: &str,
		params: Value,
	) -> Result<T, UpstreamError> {
		RetryIf::spawn(
			self.retry.clone(),
			|| async {
				let result = self.call(method, params.clone()).await;
				if let Err(error) = result.as_ref() {
					warn!(method, %error, "Upstream call failed");
				}
				result
			},
			UpstreamError::is_transient,
		)
		.await
	}
}

/// Forwards client calls verbatim to the upstream node.
#[derive(Clone)]
pub struct UpstreamDispatcher {
	client: Arc<UpstreamClient>,
}

impl UpstreamDispatcher {
	pub fn new(client: Arc<UpstreamClient>) -> Self {
		UpstreamDispatcher { client }
	}
}

#[async_trait]
impl Dispatcher for UpstreamDispatcher {
	async fn dispatch(&self, request: Request) -> Result<Response, Error> {
		debug!(method = %request.method, "Forwarding call upstream");
		self.client.send(&request).await.map_err(|error| {
			let status = error.client_status();
			Error::upstream_dispatch(error.into(), status)
		})
	}
}
