//! Godwoken Web3 JSON-RPC gateway.
//!
//! Started without `--worker-id`, the process becomes the supervisor: it forks
//! the configured number of workers and runs the block ingestion. Forked
//! processes carry `--worker-id` and only serve requests.

use crate::{cli::CliOpts, config::RuntimeConfig};
use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, span, Level};
use web3_gateway_core::{
	api::{
		pipeline::{PipelineBuilder, StageComponents},
		server::Worker,
	},
	cluster::{ClusterSupervisor, ProcessLauncher},
	ingestion::BlockPoller,
	node::{NodeInfoCell, NodeInitializer},
	rate_limit::FixedWindowLimiter,
	rpc::{
		upstream::{UpstreamClient, UpstreamDispatcher},
		MethodRegistry,
	},
	shutdown::{user_signal, Controller, Monitor},
	utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span},
};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod cli;
mod config;

fn methods(client: Arc<UpstreamClient>, node_info: NodeInfoCell) -> MethodRegistry {
	let version = clap::crate_version!();
	MethodRegistry::new()
		.register("web3_clientVersion", move |_| {
			let node_version = node_info.get().map(|info| info.version.clone());
			async move {
				let node_version = node_version.unwrap_or_else(|| "unknown".to_string());
				Ok(json!(format!("Godwoken Web3/v{version}/node-v{node_version}")))
			}
		})
		.with_fallback(Arc::new(UpstreamDispatcher::new(client)))
}

fn worker(cfg: &RuntimeConfig, client: Arc<UpstreamClient>, node_info: NodeInfoCell) -> Worker {
	let components = StageComponents {
		mode: cfg.api.mode,
		body_limit: cfg.api.max_body_size,
		log_request_body: cfg.api.log_request_body,
		dispatcher: Arc::new(methods(client, node_info)),
		rate_limiter: Arc::new(FixedWindowLimiter::new(cfg.rate_limit.clone())),
		trusted_proxies: cfg.rate_limit.trusted_proxies.clone(),
	};
	let pipeline = PipelineBuilder::new(components).build(&cfg.features);
	info!(features = %cfg.features, stages = ?pipeline.stage_ids(), "Pipeline assembled");
	Worker::new(cfg.api.clone(), pipeline)
}

async fn run_worker(cfg: &RuntimeConfig, client: Arc<UpstreamClient>, shutdown: Monitor) -> Result<()> {
	let node_info = NodeInfoCell::default();
	let worker = worker(cfg, client.clone(), node_info.clone());
	let initializer = NodeInitializer::new(client, node_info);
	worker.run(&initializer, shutdown).await
}

async fn run_supervisor(cfg: &RuntimeConfig, client: Arc<UpstreamClient>, shutdown: Monitor) -> Result<()> {
	let launcher = ProcessLauncher::current()?;
	let supervisor = ClusterSupervisor::new(launcher, cfg.cluster.clone(), cfg.ingestion.clone());
	let poller = BlockPoller::new(client.clone(), cfg.ingestion.start_block);
	let worker_shutdown = shutdown.clone();
	supervisor
		.run(poller, || run_worker(cfg, client, worker_shutdown), shutdown)
		.await
}

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> Result<()> {
	let mut shutdown = Controller::new();

	let opts = CliOpts::parse();
	let cfg = config::load_runtime_config(&opts)?;

	if cfg.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(cfg.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(cfg.log_level))?;
	};

	// install custom panic hooks
	install_panic_hooks(shutdown.trigger())?;

	let role = if opts.worker_id.is_some() { "worker" } else { "supervisor" };
	let span = span!(
		Level::INFO,
		"run",
		role,
		worker_id = opts.worker_id,
		pid = std::process::id()
	);
	// Do not enter span if logs format is not JSON
	let _enter = if cfg.log_format_json {
		Some(span.enter())
	} else {
		None
	};

	let version = clap::crate_version!();
	info!("Running Godwoken Web3 gateway version: {version}.");
	info!("Using config: {cfg:?}");

	// spawn a task to watch for ctrl-c signals from user to trigger the shutdown
	let trigger = shutdown.trigger();
	spawn_in_span(async move {
		user_signal().await;
		trigger.trigger_shutdown("User signaled shutdown");
	});

	let client = Arc::new(UpstreamClient::new(&cfg.rpc).wrap_err("Cannot create upstream client")?);
	let monitor = shutdown
		.watch()
		.ok_or_else(|| color_eyre::eyre::eyre!("Shutdown started before the {role} was running"))?;

	let result = match opts.worker_id {
		Some(_) => run_worker(&cfg, client, monitor).await,
		None => run_supervisor(&cfg, client, monitor).await,
	};
	shutdown.shutdown().await;

	if let Err(error) = result {
		error!("{error:#}");
		return Err(error.wrap_err(format!("Running gateway {role} failed")));
	}
	info!("Gateway {role} stopped");
	Ok(())
}
