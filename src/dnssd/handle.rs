use super::runner::Command;
use crate::errors::ShutdownError;
use tokio::sync::mpsc::UnboundedSender;

pub(super) struct RunnerHandleInner {
	pub(super) thread: std::thread::JoinHandle<Result<(), std::io::Error>>,
	pub(super) shutdown_tx: tokio::sync::oneshot::Sender<()>,
	pub(super) commands: UnboundedSender<Command>,
}

/// Owns the event loop thread; stops and joins it when dropped.
pub(super) struct RunnerHandle(pub(super) Option<RunnerHandleInner>);
impl RunnerHandle {
	pub(super) fn commands(&self) -> Option<UnboundedSender<Command>> {
		self.0.as_ref().map(|inner| inner.commands.clone())
	}

	pub(super) fn shutdown(&mut self) -> Result<(), ShutdownError> {
		let RunnerHandleInner { thread, shutdown_tx, .. } = match self.0.take() {
			Some(inner) => inner,
			None => return Ok(()),
		};

		if !thread.is_finished() {
			shutdown_tx.send(()).ok();
		}

		match thread.join() {
			Ok(Ok(_)) => Ok(()),
			Ok(Err(err)) => Err(ShutdownError::IoError(err)),
			Err(err) => Err(ShutdownError::ThreadJoinError(err)),
		}
	}
}
impl Drop for RunnerHandle {
	fn drop(&mut self) {
		if let Err(err) = self.shutdown() {
			log::error!("Discovery event loop did not shut down cleanly: {err}");
		}
	}
}
