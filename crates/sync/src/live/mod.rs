//! Live event subscriber: one reconnecting push connection per session.
//!
//! The subscriber owns a single pump task reading from the transport. On disconnect the
//! pump retries with a fixed delay up to [`LiveConfig::max_reconnect_attempts`]
//! consecutive failures, then publishes [`LinkStatus::Disconnected`] and exits. A
//! connection that closes before delivering a message or lasting one retry delay counts
//! as a failure. A later [`LiveSubscriber::connect`] starts over with a fresh attempt
//! budget. Events emitted by the server while no connection is up are lost, so consumers
//! re-fetch when the connection generation changes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LiveConfig;
use crate::token::GenerationClock;

mod event;
mod registry;
pub mod session;
mod transport;

pub use event::{EventFilter, EventKind, PushEvent, WireMessage};
pub use registry::Subscription;
use registry::SubscriptionRegistry;
pub use transport::{LiveStream, LiveTransport};

/// Connection status published to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
	/// Never connected.
	Idle,
	/// No connection was ever established; attempts are in progress.
	Connecting,
	/// A connection is up; each (re)connection gets a new generation.
	Connected {
		/// Connection generation, starting at 1.
		generation: u64,
	},
	/// A previously established link dropped; waiting for or performing a retry.
	Reconnecting {
		/// 1-based number of the retry since the last stable connection.
		attempt: u32,
	},
	/// Attempts exhausted; only a manual [`LiveSubscriber::connect`] retries.
	Disconnected,
	/// The session ended.
	Closed,
}

impl LinkStatus {
	/// Returns true while a pump task owns the connection.
	pub const fn is_active(self) -> bool {
		matches!(self, Self::Connecting | Self::Connected { .. } | Self::Reconnecting { .. })
	}

	/// Returns true when consumers should fall back to manual refresh.
	pub const fn is_degraded(self) -> bool {
		matches!(self, Self::Disconnected | Self::Closed)
	}
}

/// Result of [`LiveSubscriber::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
	/// A new pump was started.
	Started,
	/// A pump was already running; nothing changed.
	AlreadyActive,
	/// The subscriber was shut down.
	Closed,
	/// No tokio runtime is available to run the pump.
	NoRuntime,
}

struct LiveInner {
	transport: Arc<dyn LiveTransport>,
	config: LiveConfig,
	registry: Arc<SubscriptionRegistry>,
	status: watch::Sender<LinkStatus>,
	/// Cancel handle of the running pump. Status changes are published under this lock
	/// so `connect` and pump exit cannot interleave.
	pump: Mutex<Option<CancellationToken>>,
	generations: GenerationClock,
}

impl LiveInner {
	/// Publishes `status` unless the pump was cancelled meanwhile.
	fn publish(&self, cancel: &CancellationToken, status: LinkStatus) -> bool {
		let _pump = self.pump.lock();
		if cancel.is_cancelled() {
			return false;
		}
		self.status.send_replace(status);
		true
	}

	fn deliver(&self, wire: &WireMessage) {
		match PushEvent::decode(wire) {
			Ok(event) => {
				let delivered = self.registry.dispatch(&event);
				tracing::trace!(
					event = %wire.event,
					entity = %event.entity,
					delivered,
					"sync.live.event"
				);
			}
			Err(err) => tracing::warn!(error = %err, "sync.live.undecodable"),
		}
	}
}

/// Process-wide live event subscriber.
///
/// Cheap to clone; clones share the connection and the subscription table. Use
/// [`session`] for the lazily created session instance, or construct one directly
/// to inject a fake transport.
#[derive(Clone)]
pub struct LiveSubscriber {
	inner: Arc<LiveInner>,
}

impl fmt::Debug for LiveSubscriber {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LiveSubscriber")
			.field("endpoint", &self.inner.config.endpoint.as_str())
			.field("status", &self.status())
			.field("subscriptions", &self.inner.registry.len())
			.finish_non_exhaustive()
	}
}

impl LiveSubscriber {
	/// Creates an idle subscriber; nothing is opened until [`Self::connect`].
	pub fn new(transport: impl LiveTransport, config: LiveConfig) -> Self {
		Self::with_transport(Arc::new(transport), config)
	}

	/// Creates an idle subscriber over a shared transport.
	pub fn with_transport(transport: Arc<dyn LiveTransport>, config: LiveConfig) -> Self {
		let (status, _) = watch::channel(LinkStatus::Idle);
		Self {
			inner: Arc::new(LiveInner {
				transport,
				config,
				registry: Arc::new(SubscriptionRegistry::default()),
				status,
				pump: Mutex::new(None),
				generations: GenerationClock::new(),
			}),
		}
	}

	/// Starts the connection pump unless one is already running.
	pub fn connect(&self) -> ConnectOutcome {
		let mut pump = self.inner.pump.lock();
		let status = *self.inner.status.borrow();
		if status == LinkStatus::Closed {
			return ConnectOutcome::Closed;
		}
		if status.is_active() && pump.is_some() {
			return ConnectOutcome::AlreadyActive;
		}

		let cancel = CancellationToken::new();
		let Some(_) = crate::task::spawn("live.pump", run_pump(Arc::clone(&self.inner), cancel.clone())) else {
			return ConnectOutcome::NoRuntime;
		};
		*pump = Some(cancel);
		self.inner.status.send_replace(LinkStatus::Connecting);
		tracing::debug!(endpoint = %self.inner.config.endpoint, "sync.live.connect");
		ConnectOutcome::Started
	}

	/// Registers `callback` for events passing `filter`.
	///
	/// Callbacks run on the pump task in arrival order and must not block; detach
	/// longer work with a spawned task.
	pub fn subscribe(&self, filter: EventFilter, callback: impl Fn(&PushEvent) + Send + Sync + 'static) -> Subscription {
		self.inner.registry.register(filter, Arc::new(callback))
	}

	/// Removes `subscription`; its callback is never invoked afterwards.
	pub fn unsubscribe(&self, subscription: Subscription) -> bool {
		subscription.unsubscribe()
	}

	/// Number of registered subscriptions.
	pub fn subscription_count(&self) -> usize {
		self.inner.registry.len()
	}

	/// Current connection status.
	pub fn status(&self) -> LinkStatus {
		*self.inner.status.borrow()
	}

	/// Receiver observing connection status changes.
	pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
		self.inner.status.subscribe()
	}

	/// Generation of the most recent connection, `0` if none was ever established.
	///
	/// Survives disconnects, so a consumer attaching while the link is down can still
	/// tell the next `Connected` apart from the first one.
	pub fn generation(&self) -> u64 {
		self.inner.generations.current()
	}

	/// Live endpoint settings.
	pub fn config(&self) -> &LiveConfig {
		&self.inner.config
	}

	/// Ends the session connection. Subscriptions stay registered but receive nothing.
	pub fn shutdown(&self) {
		let mut pump = self.inner.pump.lock();
		if let Some(cancel) = pump.take() {
			cancel.cancel();
		}
		self.inner.status.send_replace(LinkStatus::Closed);
		tracing::debug!("sync.live.shutdown");
	}
}

async fn run_pump(inner: Arc<LiveInner>, cancel: CancellationToken) {
	let max_attempts = inner.config.max_reconnect_attempts.max(1);
	let delay = inner.config.delay();
	let mut failures = 0u32;

	loop {
		let opened = tokio::select! {
			biased;
			_ = cancel.cancelled() => return,
			res = inner.transport.open(&inner.config.endpoint) => res,
		};

		match opened {
			Ok(mut stream) => {
				let generation = inner.generations.next();
				if !inner.publish(&cancel, LinkStatus::Connected { generation }) {
					return;
				}
				tracing::info!(generation, "sync.live.connected");
				let opened_at = Instant::now();
				let mut delivered = false;

				let reason = loop {
					let msg = tokio::select! {
						biased;
						_ = cancel.cancelled() => return,
						msg = stream.next_message() => msg,
					};
					match msg {
						Some(Ok(wire)) => {
							delivered = true;
							inner.deliver(&wire);
						}
						Some(Err(err)) => break err.to_string(),
						None => break "closed by peer".to_string(),
					}
				};

				// Short-lived connections count against the attempt budget.
				if delivered || opened_at.elapsed() >= delay {
					failures = 0;
				} else {
					failures = failures.saturating_add(1);
				}
				tracing::warn!(generation, reason = %reason, failures, "sync.live.disconnected");
			}
			Err(err) => {
				failures = failures.saturating_add(1);
				tracing::warn!(attempt = failures, max_attempts, error = %err, "sync.live.connect_failed");
			}
		}

		if failures >= max_attempts {
			let mut pump = inner.pump.lock();
			if cancel.is_cancelled() {
				return;
			}
			*pump = None;
			inner.status.send_replace(LinkStatus::Disconnected);
			tracing::warn!(attempts = failures, "sync.live.exhausted");
			return;
		}

		let waiting = if inner.generations.current() == 0 {
			LinkStatus::Connecting
		} else {
			LinkStatus::Reconnecting { attempt: failures + 1 }
		};
		if !inner.publish(&cancel, waiting) {
			return;
		}
		tokio::select! {
			biased;
			_ = cancel.cancelled() => return,
			_ = tokio::time::sleep(delay) => {}
		}
	}
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests;
