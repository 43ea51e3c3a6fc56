//! Worker HTTP server.
//!
//! Every route goes through the worker's [`Pipeline`]; warp is only used to
//! gather the request into a [`RequestContext`].
//!
//! # Endpoints
//!
//! * `POST /` - JSON-RPC 2.0 messages (JSON-RPC body feature)
//! * `GET /ws` - JSON-RPC over web socket (web socket upgrade feature)
//! * anything else - acknowledgement, CORS preflight or a not found error, depending on the features

use super::{configuration::APIConfig, context::RequestContext, pipeline::Pipeline};
use crate::{
	error::{Error, Response},
	node::Initializer,
	shutdown::Monitor,
};
use color_eyre::{eyre::WrapErr, Result};
use futures::{Stream, StreamExt};
use hyper::{
	body::{Buf, Bytes},
	server::conn::{AddrIncoming, AddrStream},
	service::make_service_fn,
	HeaderMap, Method, Server,
};
use std::{convert::Infallible, net::SocketAddr};
use tokio::{net::TcpSocket, sync::watch};
use tracing::info;
use warp::{path::FullPath, ws::Ws, Filter, Rejection};

const LISTEN_BACKLOG: u32 = 1024;

/// Buffers the body, giving up as soon as it is known to exceed `limit`.
async fn read_body<S, B>(body: S, declared: Option<u64>, limit: usize) -> Result<Bytes, Error>
where
	S: Stream<Item = Result<B, warp::Error>>,
	B: Buf,
{
	if let Some(declared) = declared.filter(|&declared| declared > limit as u64) {
		return Err(Error::payload_too_large(limit, declared as usize));
	}

	futures::pin_mut!(body);
	let mut buffer = Vec::new();
	while let Some(chunk) = body.next().await {
		let mut chunk = chunk.map_err(|error| Error::internal_server_error(error.into()))?;
		let read = buffer.len() + chunk.remaining();
		if read > limit {
			return Err(Error::payload_too_large(limit, read));
		}
		buffer.extend_from_slice(&chunk.copy_to_bytes(chunk.remaining()));
	}
	Ok(Bytes::from(buffer))
}

fn limited_body(limit: usize) -> impl Filter<Extract = (Result<Bytes, Error>,), Error = Rejection> + Clone {
	warp::header::optional::<u64>("content-length")
		.and(warp::body::stream())
		.then(move |declared: Option<u64>, body| read_body(body, declared, limit))
}

fn optional_upgrade() -> impl Filter<Extract = (Option<Ws>,), Error = Infallible> + Clone {
	warp::ws()
		.map(Some)
		.or(warp::any().map(|| None))
		.unify()
}

/// Catch-all filter feeding every request of a connection from `remote` into `pipeline`.
pub fn routes(
	pipeline: Pipeline,
	remote: Option<SocketAddr>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
	let body_limit = pipeline.body_limit();
	warp::method()
		.and(warp::path::full())
		.and(warp::header::headers_cloned())
		.and(optional_upgrade())
		.and(limited_body(body_limit))
		.then(
			move |method: Method,
			      path: FullPath,
			      headers: HeaderMap,
			      upgrade: Option<Ws>,
			      body: Result<Bytes, Error>| {
				let pipeline = pipeline.clone();
				async move {
					let (body, body_error) = match body {
						Ok(body) => (body, None),
						Err(error) => (Bytes::new(), Some(error)),
					};
					let ctx = RequestContext::new(method, path.as_str(), headers, body)
						.with_body_error(body_error)
						.with_remote(remote)
						.with_upgrade(upgrade);
					pipeline.run(ctx).await.into_response()
				}
			},
		)
}

/// Binds `addr` so that sibling worker processes can bind the same port.
fn bind_shared(addr: SocketAddr) -> std::io::Result<AddrIncoming> {
	let socket = if addr.is_ipv4() {
		TcpSocket::new_v4()?
	} else {
		TcpSocket::new_v6()?
	};
	socket.set_reuseaddr(true)?;
	#[cfg(unix)]
	socket.set_reuseport(true)?;
	socket.bind(addr)?;
	let listener = socket.listen(LISTEN_BACKLOG)?;
	AddrIncoming::from_listener(listener).map_err(std::io::Error::other)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
	Unbound,
	Listening(SocketAddr),
	Closed,
}

/// Read side of a worker's listener state, for readiness checks.
#[derive(Clone)]
pub struct Readiness(watch::Receiver<ListenerState>);

impl Readiness {
	pub fn state(&self) -> ListenerState {
		*self.0.borrow()
	}

	pub fn is_listening(&self) -> bool {
		matches!(self.state(), ListenerState::Listening(_))
	}

	/// Waits until the listener is bound, `None` if it closed or never will.
	pub async fn listening(&mut self) -> Option<SocketAddr> {
		let state = self
			.0
			.wait_for(|state| !matches!(state, ListenerState::Unbound))
			.await
			.ok()?;
		match *state {
			ListenerState::Listening(addr) => Some(addr),
			_ => None,
		}
	}
}

pub struct Worker {
	config: APIConfig,
	pipeline: Pipeline,
	state: watch::Sender<ListenerState>,
}

impl Worker {
	/// The pipeline is built by the caller, before anything binds.
	pub fn new(config: APIConfig, pipeline: Pipeline) -> Self {
		let (state, _) = watch::channel(ListenerState::Unbound);
		Worker {
			config,
			pipeline,
			state,
		}
	}

	pub fn is_listening(&self) -> bool {
		matches!(*self.state.borrow(), ListenerState::Listening(_))
	}

	pub fn readiness(&self) -> Readiness {
		Readiness(self.state.subscribe())
	}

	/// Runs `initializer`, then serves until `shutdown` fires.
	///
	/// Nothing is bound when initialization fails.
	pub async fn run(&self, initializer: &dyn Initializer, shutdown: Monitor) -> Result<()> {
		initializer
			.init()
			.await
			.wrap_err("Required initialization failed")?;

		let addr = self
			.config
			.socket_addr()
			.wrap_err("Unable to parse host address from config")?;
		let incoming = bind_shared(addr).wrap_err_with(|| format!("Cannot bind {addr}"))?;
		let local_addr = incoming.local_addr();

		let pipeline = self.pipeline.clone();
		let make_service = make_service_fn(move |connection: &AddrStream| {
			let service = warp::service(routes(pipeline.clone(), Some(connection.remote_addr())));
			async move { Ok::<_, Infallible>(service) }
		});

		let server = Server::builder(incoming)
			.serve(make_service)
			.with_graceful_shutdown(async move { shutdown.canceled().await });

		self.state.send_replace(ListenerState::Listening(local_addr));
		info!("Gateway running on http://{local_addr}");

		let result = server.await;
		self.state.send_replace(ListenerState::Closed);
		info!("Gateway listener closed");
		result.wrap_err("HTTP server failed")
	}
}
