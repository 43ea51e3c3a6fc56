//! Declarative request pipeline.
//!
//! A [`FeatureSet`] names the optional stages of a deployment. [`PipelineBuilder`]
//! maps it to an ordered list of [`StageId`]s and instantiates one [`Stage`] per id.
//! Execution order comes from the declaration order of [`StageId`] alone, so the
//! order in which features are listed never matters.
//!
//! A request walks the stages until one of them responds or fails. A failure is
//! offered to the stages after the failing one through [`Stage::recover`], where the
//! error boundary turns it into a response. The final response is then passed back
//! through [`Stage::decorate`] of every stage the request entered, innermost first.
//!
//! A body the transport refused to read fails the request where the body stages
//! begin, so logging, CORS and the request id still decorate the error response.

use super::{
	configuration::DEFAULT_BODY_LIMIT,
	context::RequestContext,
	stages::{
		body::{Acknowledge, JsonRpcBody, JsonRpcDispatch, UrlEncodedBody},
		cors::Cors,
		error_boundary::{ErrorHandler, RouteNotFound},
		observability::{RequestLogging, TracingHook},
		rate_limit::RateLimit,
		websocket::WebSocketUpgrade,
	},
};
use crate::{
	error::{Error, Response},
	rate_limit::RateLimiter,
	rpc::Dispatcher,
	types::RuntimeMode,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, net::IpAddr, sync::Arc};
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::{error, field, info_span, warn, Instrument};

/// Optional pipeline features.
#[derive(
	Clone,
	Copy,
	Debug,
	PartialEq,
	Eq,
	PartialOrd,
	Ord,
	Hash,
	Serialize,
	Deserialize,
	Display,
	EnumIter,
	clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Feature {
	RequestLogging,
	Cors,
	UrlEncodedBody,
	JsonRpcBody,
	RateLimit,
	WebSocketUpgrade,
	/// Accepted for completeness, the error boundary is always installed.
	ErrorBoundary,
}

impl Feature {
	fn stages(self) -> &'static [StageId] {
		match self {
			Feature::RequestLogging => &[StageId::RequestLogging],
			Feature::Cors => &[StageId::Cors],
			Feature::UrlEncodedBody => &[StageId::UrlEncodedBody],
			Feature::JsonRpcBody => &[StageId::JsonRpcBody, StageId::JsonRpcDispatch],
			Feature::RateLimit => &[StageId::RateLimit],
			Feature::WebSocketUpgrade => &[StageId::WebSocketUpgrade],
			Feature::ErrorBoundary => &[],
		}
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet(BTreeSet<Feature>);

impl FeatureSet {
	pub fn all() -> Self {
		Feature::iter().collect()
	}

	pub fn contains(&self, feature: Feature) -> bool {
		self.0.contains(&feature)
	}

	pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
		self.0.iter().copied()
	}
}

impl FromIterator<Feature> for FeatureSet {
	fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
		FeatureSet(iter.into_iter().collect())
	}
}

impl fmt::Display for FeatureSet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let names = self.iter().map(|feature| feature.to_string()).collect::<Vec<_>>();
		f.write_str(&names.join(","))
	}
}

/// Pipeline stages in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum StageId {
	TracingHook,
	RequestLogging,
	Cors,
	UrlEncodedBody,
	JsonRpcBody,
	/// Takes the JSON-RPC body slot when that feature is off.
	Acknowledge,
	RateLimit,
	JsonRpcDispatch,
	WebSocketUpgrade,
	RouteNotFound,
	ErrorHandler,
}

pub enum Flow {
	Next,
	Respond(Response),
}

#[async_trait]
pub trait Stage: Send + Sync {
	fn id(&self) -> StageId;

	async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, Error>;

	/// Offered errors raised by earlier stages; returning `Err` passes the error on.
	fn recover(&self, error: Error, _ctx: &RequestContext) -> Result<Response, Error> {
		Err(error)
	}

	fn decorate(&self, _ctx: &RequestContext, _response: &mut Response) -> Result<(), Error> {
		Ok(())
	}
}

/// Result of running a request through the pipeline.
pub enum Outcome {
	Responded(Response),
	/// The error surfaced after the response was committed and is left to the host runtime.
	Forwarded { response: Response, error: Error },
	/// No stage recovered from the error.
	Unhandled(Error),
}

impl Outcome {
	pub fn into_response(self) -> Response {
		match self {
			Outcome::Responded(response) => response,
			Outcome::Forwarded { response, error } => {
				error!(%error, event_type = "PIPELINE", "Error raised after response was committed");
				response
			},
			Outcome::Unhandled(error) => {
				error!(%error, event_type = "PIPELINE", "Unhandled pipeline error");
				error.to_response(false)
			},
		}
	}
}

#[derive(Clone)]
pub struct Pipeline {
	stages: Vec<Arc<dyn Stage>>,
	body_limit: usize,
}

impl Pipeline {
	/// Orders `stages` by their id.
	pub(crate) fn new(mut stages: Vec<Arc<dyn Stage>>) -> Self {
		stages.sort_by_key(|stage| stage.id());
		Pipeline {
			stages,
			body_limit: DEFAULT_BODY_LIMIT,
		}
	}

	pub(crate) fn with_body_limit(mut self, body_limit: usize) -> Self {
		self.body_limit = body_limit;
		self
	}

	/// Largest body the transport reads for this pipeline.
	pub fn body_limit(&self) -> usize {
		self.body_limit
	}

	pub fn stage_ids(&self) -> Vec<StageId> {
		self.stages.iter().map(|stage| stage.id()).collect()
	}

	/// Runs the request inside its own `request` span.
	pub async fn run(&self, ctx: RequestContext) -> Outcome {
		let span = info_span!(
			"request",
			request_id = field::Empty,
			method = %ctx.method,
			path = %ctx.path
		);
		self.handle(ctx).instrument(span).await
	}

	async fn handle(&self, mut ctx: RequestContext) -> Outcome {
		let mut entered = 0;
		let mut result = Err(Error::not_found());

		for (index, stage) in self.stages.iter().enumerate() {
			if stage.id() >= StageId::UrlEncodedBody {
				if let Some(error) = ctx.body_error.take() {
					result = Err(error);
					break;
				}
			}
			entered = index + 1;
			match stage.handle(&mut ctx).await {
				Ok(Flow::Next) => continue,
				Ok(Flow::Respond(response)) => {
					result = Ok(response);
					break;
				},
				Err(error) => {
					result = Err(error);
					break;
				},
			}
		}

		let mut response = match result {
			Ok(response) => response,
			Err(error) => match self.recover(entered, error, &ctx) {
				Ok(response) => response,
				Err(error) => return Outcome::Unhandled(error),
			},
		};

		// The first decoration failure commits the response; outer stages still decorate it.
		let mut failure = None;
		for index in (0..entered).rev() {
			let Err(error) = self.stages[index].decorate(&ctx, &mut response) else {
				continue;
			};
			if failure.is_some() {
				warn!(%error, stage = %self.stages[index].id(), "Decoration failed after commit");
				continue;
			}
			ctx.commit();
			failure = Some((index, error));
		}

		match failure {
			None => Outcome::Responded(response),
			Some((index, error)) => match self.recover(index + 1, error, &ctx) {
				Ok(_) => Outcome::Responded(response),
				Err(error) => Outcome::Forwarded { response, error },
			},
		}
	}

	/// Offers `error` to the stages from `from` on, in order.
	fn recover(&self, from: usize, mut error: Error, ctx: &RequestContext) -> Result<Response, Error> {
		for stage in self.stages.iter().skip(from) {
			match stage.recover(error, ctx) {
				Ok(response) => return Ok(response),
				Err(unhandled) => error = unhandled,
			}
		}
		Err(error)
	}
}

/// Collaborators shared by the stages of one pipeline.
#[derive(Clone)]
pub struct StageComponents {
	pub mode: RuntimeMode,
	pub body_limit: usize,
	pub log_request_body: bool,
	pub dispatcher: Arc<dyn Dispatcher>,
	pub rate_limiter: Arc<dyn RateLimiter>,
	/// Peers allowed to name the client in `X-Forwarded-For`, `None` trusts any peer.
	pub trusted_proxies: Option<Vec<IpAddr>>,
}

pub struct PipelineBuilder {
	components: StageComponents,
}

impl PipelineBuilder {
	pub fn new(components: StageComponents) -> Self {
		PipelineBuilder { components }
	}

	/// Ordered stages for `features`, always starting with the tracing hook
	/// and ending with the error boundary.
	pub fn plan(features: &FeatureSet) -> Vec<StageId> {
		let mut stages = vec![
			StageId::TracingHook,
			StageId::RouteNotFound,
			StageId::ErrorHandler,
		];
		for feature in features.iter() {
			stages.extend_from_slice(feature.stages());
		}
		if !features.contains(Feature::JsonRpcBody) {
			stages.push(StageId::Acknowledge);
		}
		stages.sort();
		stages.dedup();
		stages
	}

	pub fn build(&self, features: &FeatureSet) -> Pipeline {
		let stages = Self::plan(features)
			.into_iter()
			.map(|id| self.stage(id))
			.collect();
		Pipeline::new(stages).with_body_limit(self.components.body_limit)
	}

	fn stage(&self, id: StageId) -> Arc<dyn Stage> {
		let components = &self.components;
		match id {
			StageId::TracingHook => Arc::new(TracingHook),
			StageId::RequestLogging => Arc::new(RequestLogging::new(components.log_request_body)),
			StageId::Cors => Arc::new(Cors),
			StageId::UrlEncodedBody => Arc::new(UrlEncodedBody),
			StageId::JsonRpcBody => Arc::new(JsonRpcBody),
			StageId::Acknowledge => Arc::new(Acknowledge),
			StageId::RateLimit => Arc::new(RateLimit::new(
				components.rate_limiter.clone(),
				components.trusted_proxies.clone(),
			)),
			StageId::JsonRpcDispatch => Arc::new(JsonRpcDispatch::new(components.dispatcher.clone())),
			StageId::WebSocketUpgrade => {
				Arc::new(WebSocketUpgrade::new(components.dispatcher.clone()))
			},
			StageId::RouteNotFound => Arc::new(RouteNotFound),
			StageId::ErrorHandler => Arc::new(ErrorHandler::new(components.mode)),
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::{
		Feature, FeatureSet, Flow, Outcome, Pipeline, PipelineBuilder, Stage, StageComponents,
		StageId,
	};
	use crate::{
		api::{
			context::RequestContext,
			stages::{
				cors::Cors,
				error_boundary::{ErrorHandler, RouteNotFound},
				observability::{TracingHook, REQUEST_ID_HEADER},
			},
		},
		error::{Error, Response},
		rate_limit::{FixedWindowLimiter, RateLimitConfig},
		rpc::MethodRegistry,
		types::RuntimeMode,
	};
	use async_trait::async_trait;
	use color_eyre::Report;
	use hyper::{body::Bytes, header, HeaderMap, Method, StatusCode};
	use proptest::{collection::vec, prelude::*, sample::select};
	use std::sync::Arc;
	use strum::IntoEnumIterator;
	use test_case::test_case;

	pub(crate) fn components() -> StageComponents {
		StageComponents {
			mode: RuntimeMode::Production,
			body_limit: 1024,
			log_request_body: false,
			dispatcher: Arc::new(MethodRegistry::new()),
			rate_limiter: Arc::new(FixedWindowLimiter::new(RateLimitConfig::default())),
			trusted_proxies: None,
		}
	}

	#[test_case(&[] => vec![StageId::TracingHook, StageId::Acknowledge, StageId::RouteNotFound, StageId::ErrorHandler] ; "no features")]
	#[test_case(&[Feature::ErrorBoundary, Feature::JsonRpcBody, Feature::Cors] => vec![StageId::TracingHook, StageId::Cors, StageId::JsonRpcBody, StageId::JsonRpcDispatch, StageId::RouteNotFound, StageId::ErrorHandler] ; "cors and json")]
	#[test_case(&[Feature::WebSocketUpgrade, Feature::RateLimit, Feature::JsonRpcBody] => vec![StageId::TracingHook, StageId::JsonRpcBody, StageId::RateLimit, StageId::JsonRpcDispatch, StageId::WebSocketUpgrade, StageId::RouteNotFound, StageId::ErrorHandler] ; "rate limit precedes dispatch")]
	fn plans_stages(features: &[Feature]) -> Vec<StageId> {
		PipelineBuilder::plan(&features.iter().copied().collect())
	}

	#[test]
	fn builds_planned_stages() {
		let features = FeatureSet::all();
		let pipeline = PipelineBuilder::new(components()).build(&features);
		assert_eq!(pipeline.stage_ids(), PipelineBuilder::plan(&features));
	}

	proptest! {
		#[test]
		fn order_is_independent_of_declaration(
			features in vec(select(Feature::iter().collect::<Vec<_>>()), 0..16)
		) {
			let forward = PipelineBuilder::plan(&features.iter().copied().collect());
			let backward = PipelineBuilder::plan(&features.iter().rev().copied().collect());

			prop_assert_eq!(&forward, &backward);
			prop_assert_eq!(forward.first(), Some(&StageId::TracingHook));
			prop_assert_eq!(forward.last(), Some(&StageId::ErrorHandler));
			prop_assert!(forward.windows(2).all(|pair| pair[0] < pair[1]));
		}
	}

	struct Failing {
		id: StageId,
		on_decorate: bool,
	}

	#[async_trait]
	impl Stage for Failing {
		fn id(&self) -> StageId {
			self.id
		}

		async fn handle(&self, _ctx: &mut RequestContext) -> Result<Flow, Error> {
			if self.on_decorate {
				return Ok(Flow::Respond(Response::new("partial".into())));
			}
			Err(Error::upstream_dispatch(
				Report::msg("node down"),
				Some(StatusCode::BAD_GATEWAY),
			))
		}

		fn decorate(&self, _ctx: &RequestContext, _response: &mut Response) -> Result<(), Error> {
			if self.on_decorate {
				return Err(Error::internal_server_error(Report::msg("stream broke")));
			}
			Ok(())
		}
	}

	fn boundary_with(stage: Failing) -> Pipeline {
		let stages: Vec<Arc<dyn Stage>> = vec![
			Arc::new(ErrorHandler::new(RuntimeMode::Production)) as Arc<dyn Stage>,
			Arc::new(stage) as Arc<dyn Stage>,
			Arc::new(RouteNotFound) as Arc<dyn Stage>,
		];
		Pipeline::new(stages)
	}

	fn request() -> RequestContext {
		RequestContext::new(Method::POST, "/", HeaderMap::new(), Bytes::new())
	}

	#[tokio::test]
	async fn error_status_comes_from_raising_stage() {
		let pipeline = boundary_with(Failing {
			id: StageId::JsonRpcDispatch,
			on_decorate: false,
		});
		assert_eq!(
			pipeline.stage_ids(),
			vec![StageId::JsonRpcDispatch, StageId::RouteNotFound, StageId::ErrorHandler]
		);

		let Outcome::Responded(response) = pipeline.run(request()).await else {
			panic!("expected a response");
		};
		assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
	}

	#[tokio::test]
	async fn committed_error_is_forwarded() {
		let pipeline = boundary_with(Failing {
			id: StageId::JsonRpcDispatch,
			on_decorate: true,
		});

		let Outcome::Forwarded { response, error } = pipeline.run(request()).await else {
			panic!("expected the error to be forwarded");
		};
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[tokio::test]
	async fn outer_stages_decorate_after_commit() {
		let stages: Vec<Arc<dyn Stage>> = vec![
			Arc::new(ErrorHandler::new(RuntimeMode::Production)) as Arc<dyn Stage>,
			Arc::new(Failing {
				id: StageId::JsonRpcDispatch,
				on_decorate: true,
			}) as Arc<dyn Stage>,
			Arc::new(Cors) as Arc<dyn Stage>,
			Arc::new(TracingHook) as Arc<dyn Stage>,
			Arc::new(RouteNotFound) as Arc<dyn Stage>,
		];

		let Outcome::Forwarded { response, error } = Pipeline::new(stages).run(request()).await else {
			panic!("expected the error to be forwarded");
		};
		assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
		assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
		assert!(response.headers().contains_key(REQUEST_ID_HEADER));
	}

	#[tokio::test]
	async fn unread_body_fails_where_body_stages_begin() {
		let features = [Feature::Cors, Feature::JsonRpcBody].into_iter().collect();
		let pipeline = PipelineBuilder::new(components()).build(&features);
		let ctx = request().with_body_error(Some(Error::payload_too_large(1024, 4096)));

		let Outcome::Responded(response) = pipeline.run(ctx).await else {
			panic!("expected a response");
		};
		assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
		assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
		assert!(response.headers().contains_key(REQUEST_ID_HEADER));
	}

	#[test]
	fn body_limit_comes_from_components() {
		let components = StageComponents {
			body_limit: 8,
			..components()
		};
		let pipeline = PipelineBuilder::new(components).build(&FeatureSet::all());
		assert_eq!(pipeline.body_limit(), 8);
	}

	#[tokio::test]
	async fn missing_boundary_leaves_error_unhandled() {
		let pipeline = Pipeline::new(vec![Arc::new(RouteNotFound) as Arc<dyn Stage>]);
		let Outcome::Unhandled(error) = pipeline.run(request()).await else {
			panic!("expected an unhandled error");
		};
		assert_eq!(error.status(), StatusCode::NOT_FOUND);
	}
}
