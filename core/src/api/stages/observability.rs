use crate::{
	api::{
		context::RequestContext,
		pipeline::{Flow, Stage, StageId},
	},
	error::{Error, Response},
};
use async_trait::async_trait;
use hyper::header::HeaderValue;
use tracing::{debug, field, info, Span};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Unconditional first stage: ties the request id to the request span and the response.
pub struct TracingHook;

#[async_trait]
impl Stage for TracingHook {
	fn id(&self) -> StageId {
		StageId::TracingHook
	}

	async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, Error> {
		Span::current().record("request_id", field::display(ctx.request_id));
		Ok(Flow::Next)
	}

	fn decorate(&self, ctx: &RequestContext, response: &mut Response) -> Result<(), Error> {
		let request_id = HeaderValue::from_str(&ctx.request_id.to_string())
			.map_err(|error| Error::internal_server_error(error.into()))?;
		response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
		Ok(())
	}
}

pub struct RequestLogging {
	log_request_body: bool,
}

impl RequestLogging {
	pub fn new(log_request_body: bool) -> Self {
		RequestLogging { log_request_body }
	}
}

#[async_trait]
impl Stage for RequestLogging {
	fn id(&self) -> StageId {
		StageId::RequestLogging
	}

	async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, Error> {
		if self.log_request_body && !ctx.body.is_empty() {
			debug!(body = %String::from_utf8_lossy(&ctx.body), "Request body");
		}
		Ok(Flow::Next)
	}

	fn decorate(&self, ctx: &RequestContext, response: &mut Response) -> Result<(), Error> {
		info!(
			status = response.status().as_u16(),
			elapsed_ms = ctx.received_at.elapsed().as_millis() as u64,
			remote = ?ctx.remote,
			"{} {}",
			ctx.method,
			ctx.path
		);
		Ok(())
	}
}
