use crate::{
	api::{
		context::RequestContext,
		pipeline::{Flow, Stage, StageId},
		ws,
	},
	error::Error,
	rpc::Dispatcher,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use warp::Reply;

pub const WS_PATH: &str = "/ws";

/// Upgrades `/ws` and hands the socket to the JSON-RPC message loop.
pub struct WebSocketUpgrade {
	dispatcher: Arc<dyn Dispatcher>,
}

impl WebSocketUpgrade {
	pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
		WebSocketUpgrade { dispatcher }
	}
}

#[async_trait]
impl Stage for WebSocketUpgrade {
	fn id(&self) -> StageId {
		StageId::WebSocketUpgrade
	}

	async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, Error> {
		if ctx.path != WS_PATH {
			return Ok(Flow::Next);
		}
		let Some(upgrade) = ctx.upgrade.take() else {
			return Ok(Flow::Next);
		};

		info!(remote = ?ctx.remote, "Upgrading to web socket");
		let dispatcher = self.dispatcher.clone();
		let reply = upgrade.on_upgrade(move |web_socket| ws::connect(web_socket, dispatcher));
		Ok(Flow::Respond(reply.into_response()))
	}
}
