//! Body handling: url-encoded forms, JSON-RPC parsing and dispatch, and the
//! static acknowledgement used when JSON-RPC is turned off.

use crate::{
	api::{
		context::RequestContext,
		pipeline::{Flow, Stage, StageId},
	},
	error::{json_response, Error, Response},
	rpc::{dispatch_payload, types::Payload, Dispatcher},
};
use async_trait::async_trait;
use hyper::{
	header::{self, HeaderValue},
	Body, Method, StatusCode,
};
use std::sync::Arc;
use tracing::debug;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Bodies arrive already bounded by the transport's body limit.
pub struct UrlEncodedBody;

#[async_trait]
impl Stage for UrlEncodedBody {
	fn id(&self) -> StageId {
		StageId::UrlEncodedBody
	}

	async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, Error> {
		if ctx.content_type().as_deref() != Some(FORM_URLENCODED) {
			return Ok(Flow::Next);
		}

		let form = url::form_urlencoded::parse(&ctx.body).into_owned().collect::<Vec<_>>();
		debug!(fields = form.len(), "Parsed url-encoded body");
		ctx.form = Some(form);
		Ok(Flow::Next)
	}
}

/// Parses JSON-RPC messages posted to `/`; malformed messages are answered right away.
pub struct JsonRpcBody;

#[async_trait]
impl Stage for JsonRpcBody {
	fn id(&self) -> StageId {
		StageId::JsonRpcBody
	}

	async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, Error> {
		if ctx.method != Method::POST || ctx.path != "/" || !ctx.is_json() {
			return Ok(Flow::Next);
		}

		match Payload::parse(&ctx.body) {
			Ok(payload) => {
				ctx.rpc = Some(payload);
				Ok(Flow::Next)
			},
			Err(response) => {
				debug!("Rejected malformed JSON-RPC message");
				Ok(Flow::Respond(json_response(StatusCode::OK, &response)))
			},
		}
	}
}

/// Resolves the parsed message. Runs after rate limiting.
pub struct JsonRpcDispatch {
	dispatcher: Arc<dyn Dispatcher>,
}

impl JsonRpcDispatch {
	pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
		JsonRpcDispatch { dispatcher }
	}
}

#[async_trait]
impl Stage for JsonRpcDispatch {
	fn id(&self) -> StageId {
		StageId::JsonRpcDispatch
	}

	async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, Error> {
		let Some(payload) = ctx.rpc.take() else {
			return Ok(Flow::Next);
		};
		let value = dispatch_payload(self.dispatcher.as_ref(), payload).await?;
		Ok(Flow::Respond(json_response(StatusCode::OK, &value)))
	}
}

/// Answers every request with a fixed `ok`.
pub struct Acknowledge;

#[async_trait]
impl Stage for Acknowledge {
	fn id(&self) -> StageId {
		StageId::Acknowledge
	}

	async fn handle(&self, _ctx: &mut RequestContext) -> Result<Flow, Error> {
		let mut response = Response::new(Body::from("ok"));
		response.headers_mut().insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("text/html; charset=utf-8"),
		);
		Ok(Flow::Respond(response))
	}
}
