use std::future::Future;

use tokio::task::JoinHandle;

/// Spawns a background task on the ambient tokio runtime.
///
/// Push callbacks and success listeners run synchronously inside the live pump or the
/// mutation future, so follow-up refreshes are detached through here. Returns `None`
/// outside a runtime; the caller's trigger is then dropped and logged.
pub(crate) fn spawn<F>(name: &'static str, fut: F) -> Option<JoinHandle<F::Output>>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	match tokio::runtime::Handle::try_current() {
		Ok(handle) => {
			tracing::trace!(task = name, "sync.spawn");
			Some(handle.spawn(fut))
		}
		Err(_) => {
			tracing::warn!(task = name, "sync.spawn.no_runtime");
			None
		}
	}
}
