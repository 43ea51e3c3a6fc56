//! Singleton background ingestion.
//!
//! Only the supervisor can start it (see [`Leader`]), and the leader refuses a
//! second live instance. The loop runs until shutdown: failed iterations are
//! logged and retried, never fatal.

use crate::{
	cluster::Leader,
	rpc::upstream::UpstreamClient,
	shutdown::Monitor,
	types::{duration_seconds_format, RetryConfig},
	utils::spawn_in_span,
};
use async_trait::async_trait;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct IngestionConfig {
	/// Run block ingestion in the supervisor process (default: true).
	pub enabled: bool,
	/// Pause after the upstream node reported no new block, in seconds (default: 3).
	#[serde(with = "duration_seconds_format")]
	pub poll_interval: Duration,
	/// First block to ingest, starts from genesis when not set.
	pub start_block: Option<u64>,
	/// Delays between failed iterations; once exhausted, the maximum delay is used for every retry.
	pub retry: RetryConfig,
}

impl Default for IngestionConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			poll_interval: Duration::from_secs(3),
			start_block: None,
			retry: RetryConfig::default(),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
	/// The given block was ingested, the next iteration starts right away.
	Advanced(u64),
	/// Nothing new upstream, wait for the poll interval.
	Idle,
}

#[async_trait]
pub trait Ingestion: Send {
	/// Runs once before the first step, retried like a step on failure.
	async fn prepare(&mut self) -> Result<()> {
		Ok(())
	}

	async fn step(&mut self) -> Result<Progress>;
}

/// Releases the leader's ingestion slot when the loop ends.
pub(crate) struct IngestionSlot(Arc<AtomicBool>);

impl IngestionSlot {
	pub(crate) fn claim(slot: &Arc<AtomicBool>) -> Option<Self> {
		slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()
			.map(|_| IngestionSlot(slot.clone()))
	}
}

impl Drop for IngestionSlot {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

struct Backoff {
	policy: RetryConfig,
	delays: std::vec::IntoIter<Duration>,
}

impl Backoff {
	fn new(policy: RetryConfig) -> Self {
		let delays = policy.clone().into_iter();
		Backoff { policy, delays }
	}

	fn next_delay(&mut self) -> Duration {
		self.delays.next().unwrap_or_else(|| self.policy.max_delay())
	}

	fn reset(&mut self) {
		self.delays = self.policy.clone().into_iter();
	}
}

pub struct BackgroundTaskHandle {
	owner_pid: u32,
	running: Arc<AtomicBool>,
	task: JoinHandle<()>,
}

impl BackgroundTaskHandle {
	pub fn start<I>(
		leader: &Leader,
		ingestion: I,
		config: IngestionConfig,
		shutdown: Monitor,
	) -> Result<Self>
	where
		I: Ingestion + 'static,
	{
		let slot = leader
			.claim_ingestion()
			.ok_or_else(|| eyre!("Background ingestion is already running"))?;
		let running = Arc::new(AtomicBool::new(true));
		let task = spawn_in_span(run(ingestion, config, shutdown, running.clone(), slot));

		Ok(BackgroundTaskHandle {
			owner_pid: std::process::id(),
			running,
			task,
		})
	}

	pub fn owner_pid(&self) -> u32 {
		self.owner_pid
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	/// Waits for the loop to stop, which only happens on shutdown.
	pub async fn join(self) {
		if let Err(error) = self.task.await {
			error!(%error, event_type = "INGESTION", "Background ingestion task failed");
		}
	}
}

async fn run<I: Ingestion>(
	mut ingestion: I,
	config: IngestionConfig,
	shutdown: Monitor,
	running: Arc<AtomicBool>,
	_slot: IngestionSlot,
) {
	info!(owner_pid = std::process::id(), "Starting background ingestion");
	let mut backoff = Backoff::new(config.retry.clone());
	let mut prepared = false;

	while !shutdown.is_shutdown() {
		let iteration = async {
			if !prepared {
				ingestion.prepare().await.wrap_err("Preparing ingestion failed")?;
				prepared = true;
			}
			ingestion.step().await
		};
		let Ok(result) = shutdown.with_cancel(iteration).await else {
			break;
		};

		let pause = match result {
			Ok(Progress::Advanced(block_number)) => {
				backoff.reset();
				debug!(block_number, "Ingestion advanced");
				tokio::task::yield_now().await;
				continue;
			},
			Ok(Progress::Idle) => {
				backoff.reset();
				config.poll_interval
			},
			Err(error) => {
				let delay = backoff.next_delay();
				error!(
					event_type = "INGESTION",
					retry_in_ms = delay.as_millis() as u64,
					"Ingestion iteration failed: {error:#}"
				);
				delay
			},
		};

		if shutdown.with_cancel(tokio::time::sleep(pause)).await.is_err() {
			break;
		}
	}

	running.store(false, Ordering::Release);
	info!("Background ingestion stopped");
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestedBlock {
	pub number: u64,
	pub block: Value,
}

/// Follows the upstream chain one block at a time and broadcasts every new block.
pub struct BlockPoller {
	client: Arc<UpstreamClient>,
	local_tip: Option<u64>,
	blocks: broadcast::Sender<IngestedBlock>,
}

impl BlockPoller {
	pub fn new(client: Arc<UpstreamClient>, start_block: Option<u64>) -> Self {
		let (blocks, _) = broadcast::channel(1024);
		BlockPoller {
			client,
			local_tip: start_block.and_then(|block| block.checked_sub(1)),
			blocks,
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<IngestedBlock> {
		self.blocks.subscribe()
	}

	pub fn local_tip(&self) -> Option<u64> {
		self.local_tip
	}
}

#[async_trait]
impl Ingestion for BlockPoller {
	async fn step(&mut self) -> Result<Progress> {
		let number = self.local_tip.map_or(0, |tip| tip + 1);
		let block: Option<Value> = self
			.client
			.call("gw_get_block_by_number", json!([format!("{number:#x}")]))
			.await
			.wrap_err_with(|| format!("block #{number} error"))?;

		let Some(block) = block else {
			return Ok(Progress::Idle);
		};
		info!(block_number = number, "Synced block");
		// no subscribers is fine
		let _ = self.blocks.send(IngestedBlock { number, block });
		self.local_tip = Some(number);
		Ok(Progress::Advanced(number))
	}
}
