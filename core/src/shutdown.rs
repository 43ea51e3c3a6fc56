use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The [Controller] struct is employed to manage the shutdown procedure of a
/// gateway process. A [Monitor] is handed to every long-running task (listener,
/// ingestion loop, worker supervision) and a [Trigger] to anything allowed to
/// start the shutdown (signal handler, panic hook). Upon invoking
/// [Controller::shutdown], every [Monitor] observes the cancellation and
/// the call returns once all of them have been dropped.
pub struct Controller {
	/// Used for signaling a cancellation request to one or more tasks that retain a reference.
	cancellation_token: CancellationToken,

	/// Used to determine when all [`Monitor`] instances have been dropped.
	task_tracker: Option<mpsc::Sender<()>>,

	/// Calling recv() will return once all of the corresponding send halves have been dropped.
	task_waiter: mpsc::Receiver<()>,
}

impl Controller {
	pub fn new() -> Self {
		let (task_tracker, task_waiter) = mpsc::channel::<()>(1);
		Self {
			cancellation_token: CancellationToken::new(),
			task_tracker: Some(task_tracker),
			task_waiter,
		}
	}

	/// Creates a new [`Monitor`] instance that can listen for the shutdown signal.
	///
	/// Returns `None` once [`Controller::shutdown`] has been called.
	pub fn watch(&self) -> Option<Monitor> {
		let task_tracker = self.task_tracker.clone()?;
		Some(Monitor {
			cancellation_token: self.cancellation_token.clone(),
			_task_tracker: task_tracker,
		})
	}

	/// Creates a handle that can begin the shutdown without waiting for it.
	pub fn trigger(&self) -> Trigger {
		Trigger {
			cancellation_token: self.cancellation_token.clone(),
		}
	}

	/// Completes when shutdown was requested through any [`Trigger`].
	pub async fn triggered(&self) {
		self.cancellation_token.cancelled().await;
	}

	pub async fn shutdown(&mut self) {
		// notify all task monitors that shutdown has begun
		self.cancellation_token.cancel();

		// drop our own sender so recv() returns once every monitor is gone
		self.task_tracker.take();

		// wait for all tasks to finish
		let _ = self.task_waiter.recv().await;
	}
}

impl Default for Controller {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone)]
pub struct Trigger {
	cancellation_token: CancellationToken,
}

impl Trigger {
	pub fn trigger_shutdown(&self, reason: &str) {
		if !self.cancellation_token.is_cancelled() {
			info!(reason, "Shutdown requested");
		}
		self.cancellation_token.cancel();
	}
}

#[derive(Debug, thiserror::Error)]
#[error("operation canceled by shutdown")]
pub struct Cancelled;

/// A [`Monitor`] observes the shutdown signal from the [`Controller`]
/// instance and keeps the controller waiting until it is dropped.
#[derive(Clone)]
pub struct Monitor {
	cancellation_token: CancellationToken,
	_task_tracker: mpsc::Sender<()>,
}

impl Monitor {
	/// Returns `true` if the shutdown signal has been received, and
	/// `false` otherwise.
	pub fn is_shutdown(&self) -> bool {
		self.cancellation_token.is_cancelled()
	}

	/// Receives shutdown notifications, waiting if required.
	pub async fn canceled(&self) {
		if self.is_shutdown() {
			return;
		}
		self.cancellation_token.cancelled().await;
	}

	/// Runs `future` to completion unless shutdown starts first.
	pub async fn with_cancel<F: Future>(&self, future: F) -> Result<F::Output, Cancelled> {
		tokio::select! {
			biased;
			_ = self.canceled() => Err(Cancelled),
			output = future => Ok(output),
		}
	}
}

/// Completes upon receiving one of the default termination signals:
/// Ctrl-C everywhere, SIGTERM on unix.
pub async fn user_signal() {
	let ctrl_c = tokio::signal::ctrl_c();

	#[cfg(unix)]
	{
		let terminate = async {
			let mut signal =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
			signal.recv().await;
			std::io::Result::Ok(())
		};

		tokio::select! {
			_ = ctrl_c => {},
			_ = terminate => {},
		}
	}

	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
}

#[cfg(test)]
mod tests {
	use super::Controller;
	use std::time::Duration;

	#[tokio::test]
	async fn shutdown_waits_for_monitors() {
		let mut shutdown = Controller::new();

		let task = tokio::spawn({
			let monitor = shutdown.watch().unwrap();
			async move {
				monitor.canceled().await;
				assert!(monitor.is_shutdown());
			}
		});

		shutdown.shutdown().await;
		assert!(task.await.is_ok());
	}

	#[tokio::test]
	async fn watch_after_shutdown() {
		let mut shutdown = Controller::default();
		assert!(!shutdown.watch().unwrap().is_shutdown());

		shutdown.shutdown().await;
		assert!(shutdown.watch().is_none());
	}

	#[tokio::test]
	async fn trigger_reaches_monitors() {
		let shutdown = Controller::new();
		let monitor = shutdown.watch().unwrap();

		shutdown.trigger().trigger_shutdown("test");
		shutdown.triggered().await;
		monitor.canceled().await;
		assert!(monitor.is_shutdown());
	}

	#[tokio::test]
	async fn with_cancel_stops_pending_work() {
		let shutdown = Controller::new();
		let monitor = shutdown.watch().unwrap();

		assert_eq!(monitor.with_cancel(async { 7 }).await.unwrap(), 7);

		shutdown.trigger().trigger_shutdown("test");
		let result = monitor
			.with_cancel(tokio::time::sleep(Duration::from_secs(3600)))
			.await;
		assert!(result.is_err());
	}
}
