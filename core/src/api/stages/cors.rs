use crate::{
	api::{
		context::RequestContext,
		pipeline::{Flow, Stage, StageId},
	},
	error::{Error, Response},
};
use async_trait::async_trait;
use hyper::{
	header::{self, HeaderValue},
	Body, Method,
};

const ALLOWED_METHODS: &str = "GET,HEAD,PUT,PATCH,POST,DELETE";

/// Any origin, credentials allowed. Every `OPTIONS` request is answered as a preflight.
pub struct Cors;

#[async_trait]
impl Stage for Cors {
	fn id(&self) -> StageId {
		StageId::Cors
	}

	async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, Error> {
		if ctx.method != Method::OPTIONS {
			return Ok(Flow::Next);
		}

		let mut response = Response::new(Body::empty());
		let headers = response.headers_mut();
		headers.insert(
			header::ACCESS_CONTROL_ALLOW_METHODS,
			HeaderValue::from_static(ALLOWED_METHODS),
		);
		if let Some(requested) = ctx.headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
			headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
			headers.append(
				header::VARY,
				HeaderValue::from_static("Access-Control-Request-Headers"),
			);
		}
		headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
		Ok(Flow::Respond(response))
	}

	fn decorate(&self, _ctx: &RequestContext, response: &mut Response) -> Result<(), Error> {
		let headers = response.headers_mut();
		headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
		headers.insert(
			header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
			HeaderValue::from_static("true"),
		);
		Ok(())
	}
}
