use crate::{
	api::{
		context::RequestContext,
		pipeline::{Flow, Stage, StageId},
	},
	error::Error,
	rate_limit::{client_key, RateLimiter},
};
use async_trait::async_trait;
use std::{net::IpAddr, sync::Arc};
use tracing::warn;

/// Rejects clients over their window before any dispatch happens.
pub struct RateLimit {
	limiter: Arc<dyn RateLimiter>,
	trusted_proxies: Option<Vec<IpAddr>>,
}

impl RateLimit {
	pub fn new(limiter: Arc<dyn RateLimiter>, trusted_proxies: Option<Vec<IpAddr>>) -> Self {
		RateLimit {
			limiter,
			trusted_proxies,
		}
	}
}

#[async_trait]
impl Stage for RateLimit {
	fn id(&self) -> StageId {
		StageId::RateLimit
	}

	async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, Error> {
		let client_key = client_key(&ctx.headers, ctx.remote, self.trusted_proxies.as_deref());
		let decision = self.limiter.decide(&client_key).await;
		if decision.allowed {
			return Ok(Flow::Next);
		}

		warn!(
			client_key = %decision.client_key,
			retry_after = ?decision.retry_after,
			"Rate limit exceeded"
		);
		let error = Error::rate_limit_exceeded(decision.retry_after);
		Ok(Flow::Respond(error.to_response(false)))
	}
}
