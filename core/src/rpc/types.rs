use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;
/// EIP-1474 "limit exceeded".
pub const LIMIT_EXCEEDED: i64 = -32005;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
	pub jsonrpc: String,
	#[serde(default)]
	pub id: Value,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

impl Request {
	pub fn new(id: impl Into<Value>, method: &str, params: Value) -> Self {
		Request {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id: id.into(),
			method: method.to_string(),
			params,
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorObject {
	pub code: i64,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

impl ErrorObject {
	pub fn new(code: i64, message: impl Into<String>) -> Self {
		ErrorObject {
			code,
			message: message.into(),
			data: None,
		}
	}

	pub fn parse_error() -> Self {
		Self::new(PARSE_ERROR, "Parse error")
	}

	pub fn invalid_request() -> Self {
		Self::new(INVALID_REQUEST, "Invalid Request")
	}

	pub fn method_not_found(method: &str) -> Self {
		Self::new(METHOD_NOT_FOUND, "Method not found").with_data(Value::from(method))
	}

	pub fn internal_error() -> Self {
		Self::new(INTERNAL_ERROR, "Internal error")
	}

	pub fn with_data(mut self, data: Value) -> Self {
		self.data = Some(data);
		self
	}
}

/// Either half of a response object; `result: null` is a valid success.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Output {
	Failure { error: ErrorObject },
	Success { result: Value },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
	pub jsonrpc: String,
	pub id: Value,
	#[serde(flatten)]
	pub output: Output,
}

impl Response {
	pub fn success(id: Value, result: Value) -> Self {
		Response {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id,
			output: Output::Success { result },
		}
	}

	pub fn failure(id: Value, error: ErrorObject) -> Self {
		Response {
			jsonrpc: JSONRPC_VERSION.to_string(),
			id,
			output: Output::Failure { error },
		}
	}

	pub fn error(&self) -> Option<&ErrorObject> {
		match &self.output {
			Output::Failure { error } => Some(error),
			Output::Success { .. } => None,
		}
	}

	pub fn result(&self) -> Option<&Value> {
		match &self.output {
			Output::Success { result } => Some(result),
			Output::Failure { .. } => None,
		}
	}
}

/// One entry of an incoming message, validated or already answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
	Valid(Request),
	Invalid(Response),
}

impl From<Value> for Call {
	fn from(value: Value) -> Self {
		let id = value.get("id").cloned().unwrap_or(Value::Null);
		match serde_json::from_value::<Request>(value) {
			Ok(request) if request.jsonrpc == JSONRPC_VERSION => Call::Valid(request),
			_ => Call::Invalid(Response::failure(id, ErrorObject::invalid_request())),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
	Single(Call),
	Batch(Vec<Call>),
}

impl Payload {
	/// Parses a message body; the error side is the response to send back as-is.
	pub fn parse(body: &[u8]) -> Result<Self, Response> {
		let value: Value = serde_json::from_slice(body)
			.map_err(|_| Response::failure(Value::Null, ErrorObject::parse_error()))?;

		match value {
			Value::Array(items) if items.is_empty() => Err(Response::failure(
				Value::Null,
				ErrorObject::invalid_request(),
			)),
			Value::Array(items) => Ok(Payload::Batch(items.into_iter().map(Call::from).collect())),
			value => Ok(Payload::Single(Call::from(value))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{Call, ErrorObject, Payload, Request, Response, INVALID_REQUEST, PARSE_ERROR};
	use serde_json::{json, Value};
	use test_case::test_case;

	#[test]
	fn parse_single_request() {
		let payload =
			Payload::parse(br#"{"jsonrpc":"2.0","id":1,"method":"x","params":[]}"#).unwrap();
		assert_eq!(
			payload,
			Payload::Single(Call::Valid(Request::new(1, "x", json!([]))))
		);
	}

	#[test_case(b"{not json" => PARSE_ERROR ; "malformed json")]
	#[test_case(b"[]" => INVALID_REQUEST ; "empty batch")]
	fn parse_rejects(body: &[u8]) -> i64 {
		Payload::parse(body).unwrap_err().error().unwrap().code
	}

	#[test]
	fn batch_keeps_invalid_entries_in_place() {
		let payload = Payload::parse(
			br#"[{"jsonrpc":"2.0","id":1,"method":"a"},{"jsonrpc":"1.0","id":2,"method":"b"},7]"#,
		)
		.unwrap();
		let Payload::Batch(calls) = payload else {
			panic!("expected batch");
		};
		assert!(matches!(calls[0], Call::Valid(_)));
		assert_eq!(
			calls[1],
			Call::Invalid(Response::failure(json!(2), ErrorObject::invalid_request()))
		);
		assert_eq!(
			calls[2],
			Call::Invalid(Response::failure(Value::Null, ErrorObject::invalid_request()))
		);
	}

	#[test]
	fn response_serialization() {
		let success = Response::success(json!(1), Value::Null);
		assert_eq!(
			serde_json::to_string(&success).unwrap(),
			r#"{"jsonrpc":"2.0","id":1,"result":null}"#
		);

		let failure = Response::failure(json!("a"), ErrorObject::new(-1, "boom"));
		assert_eq!(
			serde_json::to_string(&failure).unwrap(),
			r#"{"jsonrpc":"2.0","id":"a","error":{"code":-1,"message":"boom"}}"#
		);
	}

	#[test]
	fn upstream_response_deserialization() {
		let response: Response =
			serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":null}"#).unwrap();
		assert_eq!(response.result(), Some(&Value::Null));

		let response: Response = serde_json::from_str(
			r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32000,"message":"reverted"}}"#,
		)
		.unwrap();
		assert_eq!(response.error().map(|error| error.code), Some(-32000));
	}
}
