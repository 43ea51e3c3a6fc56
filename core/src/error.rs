//! Error taxonomy of the gateway.
//!
//! * [`Error`] travels through the request pipeline and is turned into a client
//!   response by the error boundary (or by the stage that raised it).
//! * [`ConfigError`] is a startup failure; it stops the process before any listener binds.
//! * [`UpstreamError`] is raised by the upstream node client.
//!
//! Failures inside the background ingestion loop are plain [`color_eyre::Report`]s,
//! logged and retried by the loop itself.

use crate::rpc::types::{ErrorObject, Response as RpcResponse, LIMIT_EXCEEDED};
use color_eyre::Report;
use hyper::{header, http, Body, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::{fmt, time::Duration};

pub type Response = http::Response<Body>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
	NotFound,
	RateLimitExceeded,
	PayloadTooLarge,
	UpstreamDispatch,
	InternalServerError,
}

#[derive(Debug)]
pub struct Error {
	pub error_code: ErrorCode,
	pub message: String,
	pub cause: Option<Report>,
	/// Status supplied by the raising collaborator, overrides the code default.
	pub status: Option<StatusCode>,
	pub retry_after: Option<Duration>,
}

impl Error {
	fn new(error_code: ErrorCode, message: &str, cause: Option<Report>) -> Self {
		Error {
			error_code,
			message: message.to_string(),
			cause,
			status: None,
			retry_after: None,
		}
	}

	pub fn not_found() -> Self {
		Self::new(ErrorCode::NotFound, "Not Found", None)
	}

	pub fn rate_limit_exceeded(retry_after: Option<Duration>) -> Self {
		Error {
			retry_after,
			..Self::new(ErrorCode::RateLimitExceeded, "Too Many Requests", None)
		}
	}

	pub fn payload_too_large(limit: usize, actual: usize) -> Self {
		Self::new(
			ErrorCode::PayloadTooLarge,
			"Payload Too Large",
			Some(Report::msg(format!(
				"request body of {actual} bytes exceeds limit of {limit} bytes"
			))),
		)
	}

	pub fn upstream_dispatch(cause: Report, status: Option<StatusCode>) -> Self {
		Error {
			status,
			..Self::new(ErrorCode::UpstreamDispatch, "Upstream Dispatch Failed", Some(cause))
		}
	}

	pub fn internal_server_error(cause: Report) -> Self {
		Self::new(
			ErrorCode::InternalServerError,
			"Internal Server Error",
			Some(cause),
		)
	}

	pub fn status(&self) -> StatusCode {
		if let Some(status) = self.status {
			return status;
		}
		match self.error_code {
			ErrorCode::NotFound => StatusCode::NOT_FOUND,
			ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
			ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ErrorCode::UpstreamDispatch | ErrorCode::InternalServerError => {
				StatusCode::INTERNAL_SERVER_ERROR
			},
		}
	}

	/// Renders the error for the client, `detail` is only included when `diagnostics` is set.
	pub fn to_response(&self, diagnostics: bool) -> Response {
		if self.error_code == ErrorCode::RateLimitExceeded {
			return self.to_rate_limited_response();
		}

		let mut body = serde_json::json!({
			"status": self.status().as_u16(),
			"message": self.message,
		});
		if diagnostics {
			if let Some(cause) = self.cause.as_ref() {
				body["detail"] = Value::from(format!("{cause:?}"));
			}
		}

		json_response(self.status(), &serde_json::json!({ "error": body }))
	}

	fn to_rate_limited_response(&self) -> Response {
		let body = RpcResponse::failure(
			Value::Null,
			ErrorObject::new(LIMIT_EXCEEDED, self.message.clone()),
		);
		let mut response = json_response(self.status(), &body);
		if let Some(retry_after) = self.retry_after {
			// Retry-After is whole seconds, round up so clients never retry early
			let seconds = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
			response
				.headers_mut()
				.insert(header::RETRY_AFTER, header::HeaderValue::from(seconds));
		}
		response
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.cause.as_ref() {
			Some(cause) => write!(f, "{} ({}): {cause:#}", self.message, self.status()),
			None => write!(f, "{} ({})", self.message, self.status()),
		}
	}
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
	let (body, status) = match serde_json::to_vec(body) {
		Ok(body) => (body, status),
		Err(_) => (
			br#"{"error":{"status":500,"message":"Internal Server Error"}}"#.to_vec(),
			StatusCode::INTERNAL_SERVER_ERROR,
		),
	};
	let mut response = http::Response::new(Body::from(body));
	*response.status_mut() = status;
	response.headers_mut().insert(
		header::CONTENT_TYPE,
		header::HeaderValue::from_static("application/json; charset=utf-8"),
	);
	response
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("no env {0} provided")]
	MissingRequired(&'static str),
	#[error("invalid value for {name}: {reason}")]
	Invalid { name: &'static str, reason: String },
	#[error("failed to load configuration from {path}: {reason}")]
	Load { path: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
	#[error("upstream transport failure: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("upstream responded with HTTP {0}")]
	Status(u16),
	#[error("upstream returned error {}: {}", .0.code, .0.message)]
	Rpc(ErrorObject),
	#[error("cannot decode upstream result: {0}")]
	Decode(#[from] serde_json::Error),
}

impl UpstreamError {
	/// Failures worth retrying; node-level error objects are final.
	pub fn is_transient(&self) -> bool {
		match self {
			UpstreamError::Transport(_) => true,
			UpstreamError::Status(status) => (500..600).contains(status),
			UpstreamError::Rpc(_) | UpstreamError::Decode(_) => false,
		}
	}

	/// Status the gateway should answer with when this failure reaches the client.
	pub fn client_status(&self) -> Option<StatusCode> {
		match self {
			UpstreamError::Status(_) => Some(StatusCode::BAD_GATEWAY),
			UpstreamError::Transport(error) if error.is_timeout() => {
				Some(StatusCode::GATEWAY_TIMEOUT)
			},
			_ => None,
		}
	}
}
