//! Terminal stages: unmatched routes become not-found errors, and every error
//! that reaches the end of the pipeline is logged and rendered here.

use crate::{
	api::{
		context::RequestContext,
		pipeline::{Flow, Stage, StageId},
	},
	error::{Error, Response},
	types::RuntimeMode,
};
use async_trait::async_trait;
use tracing::{error, warn};

pub struct RouteNotFound;

#[async_trait]
impl Stage for RouteNotFound {
	fn id(&self) -> StageId {
		StageId::RouteNotFound
	}

	async fn handle(&self, _ctx: &mut RequestContext) -> Result<Flow, Error> {
		Err(Error::not_found())
	}
}

pub struct ErrorHandler {
	mode: RuntimeMode,
}

impl ErrorHandler {
	pub fn new(mode: RuntimeMode) -> Self {
		ErrorHandler { mode }
	}
}

#[async_trait]
impl Stage for ErrorHandler {
	fn id(&self) -> StageId {
		StageId::ErrorHandler
	}

	async fn handle(&self, _ctx: &mut RequestContext) -> Result<Flow, Error> {
		Ok(Flow::Next)
	}

	fn recover(&self, error: Error, ctx: &RequestContext) -> Result<Response, Error> {
		let status = error.status();
		if status.is_server_error() {
			error!(%error, status = status.as_u16(), event_type = "ERROR_BOUNDARY", "Request failed");
		} else {
			warn!(%error, status = status.as_u16(), event_type = "ERROR_BOUNDARY", "Request failed");
		}

		if ctx.is_committed() {
			return Err(error);
		}
		Ok(error.to_response(self.mode.exposes_diagnostics()))
	}
}
