//! JSON-RPC dispatch.
//!
//! Method semantics live outside this crate: the pipeline only knows the
//! [`Dispatcher`] contract. [`MethodRegistry`] is the bundled implementation,
//! answering locally registered methods and delegating the rest to an optional
//! fallback (usually [`upstream::UpstreamDispatcher`]).

use crate::error::Error;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::{debug, error};
use types::{Call, ErrorObject, Payload, Request, Response};

pub mod configuration;
pub mod types;
pub mod upstream;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
	/// Resolves a single request.
	///
	/// Method-level failures are returned as JSON-RPC error objects inside `Ok`;
	/// `Err` is reserved for failures reaching the collaborator itself.
	async fn dispatch(&self, request: Request) -> Result<Response, Error>;
}

pub type MethodResult = Result<Value, ErrorObject>;

type Method = Arc<dyn Fn(Value) -> BoxFuture<'static, MethodResult> + Send + Sync>;

#[derive(Clone, Default)]
pub struct MethodRegistry {
	methods: HashMap<String, Method>,
	fallback: Option<Arc<dyn Dispatcher>>,
}

impl MethodRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register<F, Fut>(mut self, name: &str, method: F) -> Self
	where
		F: Fn(Value) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = MethodResult> + Send + 'static,
	{
		let method: Method =
			Arc::new(move |params| -> BoxFuture<'static, MethodResult> { Box::pin(method(params)) });
		self.methods.insert(name.to_string(), method);
		self
	}

	/// Unknown methods are handed to `fallback` instead of failing with "Method not found".
	pub fn with_fallback(mut self, fallback: Arc<dyn Dispatcher>) -> Self {
		self.fallback = Some(fallback);
		self
	}
}

#[async_trait]
impl Dispatcher for MethodRegistry {
	async fn dispatch(&self, request: Request) -> Result<Response, Error> {
		let Some(method) = self.methods.get(&request.method) else {
			return match self.fallback.as_ref() {
				Some(fallback) => fallback.dispatch(request).await,
				None => {
					debug!(method = %request.method, "Method not found");
					let error = ErrorObject::method_not_found(&request.method);
					Ok(Response::failure(request.id, error))
				},
			};
		};

		Ok(match method(request.params).await {
			Ok(result) => Response::success(request.id, result),
			Err(error) => Response::failure(request.id, error),
		})
	}
}

async fn dispatch_call(dispatcher: &dyn Dispatcher, call: Call) -> Result<Response, Error> {
	match call {
		Call::Valid(request) => dispatcher.dispatch(request).await,
		Call::Invalid(response) => Ok(response),
	}
}

/// Resolves a parsed message into the JSON value to send back.
///
/// A failing single call is propagated; inside a batch, a failing entry is
/// answered with an internal error in its slot so siblings are still delivered.
pub async fn dispatch_payload(dispatcher: &dyn Dispatcher, payload: Payload) -> Result<Value, Error> {
	match payload {
		Payload::Single(call) => {
			let response = dispatch_call(dispatcher, call).await?;
			serde_json::to_value(response).map_err(|error| Error::internal_server_error(error.into()))
		},
		Payload::Batch(calls) => {
			let responses = join_all(calls.into_iter().map(|call| async move {
				let id = match &call {
					Call::Valid(request) => request.id.clone(),
					Call::Invalid(response) => response.id.clone(),
				};
				dispatch_call(dispatcher, call).await.unwrap_or_else(|error| {
					error!(%error, event_type = "RPC_BATCH", "Batch entry dispatch failed");
					Response::failure(id, ErrorObject::internal_error())
				})
			}))
			.await;
			serde_json::to_value(responses).map_err(|error| Error::internal_server_error(error.into()))
		},
	}
}

#[cfg(test)]
mod tests {
	use super::{
		dispatch_payload,
		types::{ErrorObject, Payload, Request, Response},
		Dispatcher, MethodRegistry, MockDispatcher,
	};
	use crate::error::Error;
	use color_eyre::Report;
	use serde_json::{json, Value};
	use std::sync::Arc;

	fn registry() -> MethodRegistry {
		MethodRegistry::new()
			.register("web3_clientVersion", |_| async { Ok(json!("web3-gateway/test")) })
			.register("fails", |_| async { Err(ErrorObject::new(-32000, "nope")) })
	}

	#[tokio::test]
	async fn registered_method_resolves() {
		let response = registry()
			.dispatch(Request::new(1, "web3_clientVersion", Value::Null))
			.await
			.unwrap();
		assert_eq!(response, Response::success(json!(1), json!("web3-gateway/test")));
	}

	#[tokio::test]
	async fn method_error_is_a_response() {
		let response = registry()
			.dispatch(Request::new(2, "fails", Value::Null))
			.await
			.unwrap();
		assert_eq!(response.error().map(|error| error.code), Some(-32000));
	}

	#[tokio::test]
	async fn unknown_method_without_fallback() {
		let response = registry()
			.dispatch(Request::new(3, "x", json!([])))
			.await
			.unwrap();
		assert_eq!(response.error().map(|error| error.code), Some(-32601));
	}

	#[tokio::test]
	async fn unknown_method_goes_to_fallback() {
		let mut fallback = MockDispatcher::new();
		fallback
			.expect_dispatch()
			.withf(|request| request.method == "eth_chainId")
			.times(1)
			.returning(|request| Ok(Response::success(request.id, json!("0x116e1"))));

		let response = registry()
			.with_fallback(Arc::new(fallback))
			.dispatch(Request::new(4, "eth_chainId", Value::Null))
			.await
			.unwrap();
		assert_eq!(response.result(), Some(&json!("0x116e1")));
	}

	#[tokio::test]
	async fn batch_isolates_failing_entries() {
		let mut fallback = MockDispatcher::new();
		fallback
			.expect_dispatch()
			.returning(|_| Err(Error::upstream_dispatch(Report::msg("node down"), None)));
		let registry = registry().with_fallback(Arc::new(fallback));

		let payload = Payload::parse(
			br#"[{"jsonrpc":"2.0","id":1,"method":"web3_clientVersion"},{"jsonrpc":"2.0","id":2,"method":"eth_call"}]"#,
		)
		.unwrap();
		let value = dispatch_payload(&registry, payload).await.unwrap();

		assert_eq!(value[0]["result"], "web3-gateway/test");
		assert_eq!(value[1]["id"], 2);
		assert_eq!(value[1]["error"]["code"], -32603);
	}

	#[tokio::test]
	async fn single_dispatch_failure_propagates() {
		let mut fallback = MockDispatcher::new();
		fallback
			.expect_dispatch()
			.returning(|_| Err(Error::upstream_dispatch(Report::msg("node down"), None)));
		let registry = MethodRegistry::new().with_fallback(Arc::new(fallback));

		let payload =
			Payload::parse(br#"{"jsonrpc":"2.0","id":1,"method":"eth_call"}"#).unwrap();
		assert!(dispatch_payload(&registry, payload).await.is_err());
	}
}
