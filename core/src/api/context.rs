use crate::{error::Error, rpc::types::Payload};
use hyper::{body::Bytes, header, HeaderMap, Method};
use std::{net::SocketAddr, time::Instant};
use uuid::Uuid;
use warp::ws::Ws;

/// Transient state of one request while it traverses the pipeline.
pub struct RequestContext {
	pub request_id: Uuid,
	pub method: Method,
	pub path: String,
	pub headers: HeaderMap,
	pub remote: Option<SocketAddr>,
	pub body: Bytes,
	/// Why the transport gave up reading the body; `body` is empty then.
	pub body_error: Option<Error>,
	/// Filled by the url-encoded body stage.
	pub form: Option<Vec<(String, String)>>,
	/// Filled by the JSON-RPC body stage, consumed by dispatch.
	pub rpc: Option<Payload>,
	/// Pending WebSocket upgrade, present only on upgrade requests.
	pub upgrade: Option<Ws>,
	pub received_at: Instant,
	committed: bool,
}

impl RequestContext {
	pub fn new(method: Method, path: &str, headers: HeaderMap, body: Bytes) -> Self {
		RequestContext {
			request_id: Uuid::new_v4(),
			method,
			path: path.to_string(),
			headers,
			remote: None,
			body,
			body_error: None,
			form: None,
			rpc: None,
			upgrade: None,
			received_at: Instant::now(),
			committed: false,
		}
	}

	pub fn with_body_error(mut self, body_error: Option<Error>) -> Self {
		self.body_error = body_error;
		self
	}

	pub fn with_remote(mut self, remote: Option<SocketAddr>) -> Self {
		self.remote = remote;
		self
	}

	pub fn with_upgrade(mut self, upgrade: Option<Ws>) -> Self {
		self.upgrade = upgrade;
		self
	}

	/// Media type of the body without parameters, lowercased.
	pub fn content_type(&self) -> Option<String> {
		let value = self.headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
		let essence = value.split(';').next()?.trim();
		Some(essence.to_ascii_lowercase())
	}

	pub fn is_json(&self) -> bool {
		self.content_type()
			.is_some_and(|content_type| content_type == "application/json" || content_type.ends_with("+json"))
	}

	/// Marks the response as handed to the transport; it must not be written again.
	pub fn commit(&mut self) {
		self.committed = true;
	}

	pub fn is_committed(&self) -> bool {
		self.committed
	}
}
