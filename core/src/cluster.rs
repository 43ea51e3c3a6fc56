//! Process topology.
//!
//! The supervisor is the process started by the operator. It forks worker
//! processes (the current executable again, with `--worker-id`), owns the only
//! background ingestion, and watches worker exits. Roles are fixed at startup,
//! workers and supervisor only observe each other through spawn and exit.

use crate::{
	ingestion::{BackgroundTaskHandle, Ingestion, IngestionConfig, IngestionSlot},
	shutdown::Monitor,
	utils::spawn_in_span,
};
use async_trait::async_trait;
use color_eyre::{eyre::WrapErr, Result};
use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	future::Future,
	path::PathBuf,
	process::Stdio,
	sync::{atomic::AtomicBool, Arc},
};
use tokio::{process::Command, sync::mpsc};
use tracing::{error, info, warn};

pub const WORKER_ID_FLAG: &str = "--worker-id";

/// Capability held only by the supervisor process.
pub struct Leader {
	ingestion: Arc<AtomicBool>,
}

impl Leader {
	pub(crate) fn new() -> Self {
		Leader {
			ingestion: Arc::new(AtomicBool::new(false)),
		}
	}

	pub(crate) fn claim_ingestion(&self) -> Option<IngestionSlot> {
		IngestionSlot::claim(&self.ingestion)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
	/// One worker inside the supervisor process, nothing is forked.
	SingleProcess,
	Cluster { workers: usize },
}

impl Topology {
	/// Unset means one worker per logical CPU, zero or less disables forking.
	pub fn from_worker_count(worker_count: Option<i64>) -> Self {
		match worker_count {
			None => Topology::Cluster {
				workers: num_cpus::get(),
			},
			Some(count) if count <= 0 => Topology::SingleProcess,
			Some(count) => Topology::Cluster {
				workers: count as usize,
			},
		}
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RestartPolicy {
	/// Exits are only logged.
	#[default]
	Never,
	/// Relaunch workers that exit unsuccessfully, at most `max_restarts` times per worker.
	OnFailure { max_restarts: u32 },
}

impl RestartPolicy {
	fn allows(&self, exit: &Result<WorkerExit>, restarts: u32) -> bool {
		match self {
			RestartPolicy::Never => false,
			RestartPolicy::OnFailure { max_restarts } => {
				let failed = !matches!(exit, Ok(exit) if exit.success());
				failed && restarts < *max_restarts
			},
		}
	}
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
	/// Number of worker processes (default: number of logical CPUs). Zero or less runs a single process.
	pub worker_count: Option<i64>,
	/// What to do when a worker exits (default: never restart).
	pub restart: RestartPolicy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerExit {
	/// `None` when the worker was terminated by a signal.
	pub code: Option<i32>,
}

impl WorkerExit {
	pub fn success(&self) -> bool {
		self.code == Some(0)
	}
}

#[async_trait]
pub trait WorkerChild: Send {
	fn pid(&self) -> Option<u32>;

	async fn wait(&mut self) -> Result<WorkerExit>;

	async fn kill(&mut self) -> Result<()>;
}

pub trait WorkerLauncher: Send + Sync {
	fn launch(&self, worker_id: usize) -> Result<Box<dyn WorkerChild>>;
}

/// Launches workers as child processes of the supervisor.
pub struct ProcessLauncher {
	program: PathBuf,
	args: Vec<String>,
}

impl ProcessLauncher {
	pub fn new(program: PathBuf, args: Vec<String>) -> Self {
		ProcessLauncher { program, args }
	}

	/// Relaunches the running executable with its own arguments.
	pub fn current() -> Result<Self> {
		let program = std::env::current_exe().wrap_err("Cannot resolve current executable")?;
		Ok(Self::new(program, std::env::args().skip(1).collect()))
	}
}

impl WorkerLauncher for ProcessLauncher {
	fn launch(&self, worker_id: usize) -> Result<Box<dyn WorkerChild>> {
		let child = Command::new(&self.program)
			.args(&self.args)
			.arg(WORKER_ID_FLAG)
			.arg(worker_id.to_string())
			.stdin(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.wrap_err_with(|| format!("Cannot launch worker {worker_id}"))?;
		Ok(Box::new(ProcessChild(child)))
	}
}

struct ProcessChild(tokio::process::Child);

#[async_trait]
impl WorkerChild for ProcessChild {
	fn pid(&self) -> Option<u32> {
		self.0.id()
	}

	async fn wait(&mut self) -> Result<WorkerExit> {
		let status = self.0.wait().await?;
		Ok(WorkerExit {
			code: status.code(),
		})
	}

	async fn kill(&mut self) -> Result<()> {
		Ok(self.0.kill().await?)
	}
}

struct WorkerEvent {
	worker_id: usize,
	pid: Option<u32>,
	exit: Result<WorkerExit>,
}

pub struct ClusterSupervisor<L: WorkerLauncher> {
	launcher: L,
	config: ClusterConfig,
	ingestion_config: IngestionConfig,
	leader: Leader,
}

impl<L: WorkerLauncher> ClusterSupervisor<L> {
	pub fn new(launcher: L, config: ClusterConfig, ingestion_config: IngestionConfig) -> Self {
		ClusterSupervisor {
			launcher,
			config,
			ingestion_config,
			leader: Leader::new(),
		}
	}

	pub fn topology(&self) -> Topology {
		Topology::from_worker_count(self.config.worker_count)
	}

	/// Starts the topology and supervises it until shutdown.
	///
	/// `local_worker` is only called in single-process mode, where its error
	/// is returned so the process exits unsuccessfully.
	pub async fn run<I, F, W>(&self, ingestion: I, local_worker: F, shutdown: Monitor) -> Result<()>
	where
		I: Ingestion + 'static,
		F: FnOnce() -> W,
		W: Future<Output = Result<()>>,
	{
		info!(pid = std::process::id(), topology = ?self.topology(), "Supervisor is running");
		match self.topology() {
			Topology::SingleProcess => {
				let worker = local_worker();
				let _ingestion = self.start_ingestion(ingestion, shutdown)?;
				worker.await
			},
			Topology::Cluster { workers } => self.run_cluster(workers, ingestion, shutdown).await,
		}
	}

	fn start_ingestion<I: Ingestion + 'static>(
		&self,
		ingestion: I,
		shutdown: Monitor,
	) -> Result<Option<BackgroundTaskHandle>> {
		if !self.ingestion_config.enabled {
			info!("Background ingestion is disabled");
			return Ok(None);
		}
		let handle = BackgroundTaskHandle::start(
			&self.leader,
			ingestion,
			self.ingestion_config.clone(),
			shutdown,
		)?;
		info!(owner_pid = handle.owner_pid(), "Background ingestion started");
		Ok(Some(handle))
	}

	async fn run_cluster<I: Ingestion + 'static>(
		&self,
		workers: usize,
		ingestion: I,
		shutdown: Monitor,
	) -> Result<()> {
		let (events, mut exits) = mpsc::unbounded_channel();
		let mut live = 0;
		for worker_id in 0..workers {
			self.spawn_worker(worker_id, &events, &shutdown)?;
			live += 1;
		}

		let ingestion = self.start_ingestion(ingestion, shutdown.clone())?;

		let mut restarts = HashMap::<usize, u32>::new();
		while live > 0 {
			let Some(WorkerEvent {
				worker_id,
				pid,
				exit,
			}) = exits.recv().await
			else {
				break;
			};
			live -= 1;

			match exit.as_ref() {
				Ok(exit) => info!(worker_id, pid, code = exit.code, "Worker died"),
				Err(error) => error!(worker_id, pid, "Cannot observe worker exit: {error:#}"),
			}
			if shutdown.is_shutdown() {
				continue;
			}

			let restarted = restarts.entry(worker_id).or_default();
			if !self.config.restart.allows(&exit, *restarted) {
				continue;
			}
			*restarted += 1;
			match self.spawn_worker(worker_id, &events, &shutdown) {
				Ok(()) => live += 1,
				Err(error) => error!(worker_id, "Cannot restart worker: {error:#}"),
			}
		}

		match ingestion {
			Some(ingestion) => {
				if !shutdown.is_shutdown() {
					warn!("No workers left, supervisor keeps ingesting");
				}
				ingestion.join().await;
			},
			None => shutdown.canceled().await,
		}
		Ok(())
	}

	fn spawn_worker(
		&self,
		worker_id: usize,
		events: &mpsc::UnboundedSender<WorkerEvent>,
		shutdown: &Monitor,
	) -> Result<()> {
		let mut child = self.launcher.launch(worker_id)?;
		let pid = child.pid();
		info!(worker_id, pid, "Worker started");

		let events = events.clone();
		let shutdown = shutdown.clone();
		spawn_in_span(async move {
			let exit = tokio::select! {
				exit = child.wait() => exit,
				_ = shutdown.canceled() => {
					if let Err(error) = child.kill().await {
						warn!(worker_id, pid, "Cannot stop worker: {error:#}");
					}
					child.wait().await
				},
			};
			// the supervisor is gone when sending fails
			let _ = events.send(WorkerEvent {
				worker_id,
				pid,
				exit,
			});
		});
		Ok(())
	}
}
