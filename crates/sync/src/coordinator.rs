//! Per-screen view synchronization.
//!
//! A [`ViewCoordinator`] owns one [`FetchGuard`], one [`MutationSubmitter`] and the
//! live [`Subscription`]s of a screen. Every refresh, whatever triggered it, goes through
//! the same path: issue a token, mark the view loading, run the fetch, then apply the
//! outcome only if its sequence is newer than what the view already shows.
//!
//! ```text
//! Idle ──mount/refresh/push──▶ Loading ──accepted──▶ Ready
//!                                │  ▲                  │
//!                         failed │  └─push/nav/manual──┘
//!                                ▼
//!                              Error ──retry──▶ Loading
//! any ──teardown──▶ TornDown
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, SessionError};
use crate::guard::{FetchGuard, FetchOutcome, Fetched};
use crate::key::{EntityId, ResourceKey};
use crate::live::{EventFilter, EventKind, LinkStatus, LiveSubscriber, PushEvent, Subscription, session};
use crate::submit::{MutationKind, MutationOutcome, MutationSubmitter, MutationTicket};
use crate::token::AbortSignal;

/// Remote data shown by one screen.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
	/// Materialized payload.
	type Data: Clone + Send + Sync + 'static;

	/// Logical key of the screen's subject.
	fn key(&self) -> ResourceKey;

	/// Push events that should refresh this screen.
	fn filter(&self) -> EventFilter {
		EventFilter::for_key(&self.key())
	}

	/// Loads the current data.
	async fn fetch(&self, abort: AbortSignal) -> Result<Self::Data, ApiError>;
}

/// Why a refresh started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
	/// The screen mounted.
	Mount,
	/// A matching push event arrived.
	Push(EventKind),
	/// Navigation returned here with a data-changed signal.
	Navigation,
	/// The user asked for a refresh.
	Manual,
	/// The user retried after an error.
	Retry,
	/// A write through this screen's submitter succeeded.
	Mutation,
	/// The live channel came back after a disconnect.
	Reconnect,
}

/// Hint passed along by the navigation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NavigationSignal {
	/// Nothing is known to have changed.
	#[default]
	Unchanged,
	/// The previous screen changed data shown here.
	DataChanged,
}

/// Lifecycle phase of a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewPhase {
	/// Not loaded yet.
	Idle,
	/// A load is in flight; previously loaded data stays readable.
	Loading,
	/// The latest load was applied.
	Ready,
	/// The latest load failed.
	Error(ApiError),
	/// The screen was torn down. Terminal.
	TornDown,
}

/// Materialized view state published to the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState<T> {
	/// Current phase.
	pub phase: ViewPhase,
	/// Data from the newest applied load.
	pub data: Option<T>,
	/// Sequence of the load `data` came from, `0` before the first.
	pub sequence: u64,
	/// The live channel is down; only manual refresh keeps the data fresh.
	pub degraded: bool,
	/// Trigger of the most recent refresh.
	pub trigger: Option<RefreshTrigger>,
	/// Highest sequence issued so far.
	pending: u64,
}

impl<T> ViewState<T> {
	fn idle() -> Self {
		Self {
			phase: ViewPhase::Idle,
			data: None,
			sequence: 0,
			degraded: false,
			trigger: None,
			pending: 0,
		}
	}

	/// Returns true while a load is in flight.
	pub fn is_loading(&self) -> bool {
		self.phase == ViewPhase::Loading
	}

	/// Error of the latest load, if it failed.
	pub fn error(&self) -> Option<&ApiError> {
		match &self.phase {
			ViewPhase::Error(err) => Some(err),
			_ => None,
		}
	}

	fn is_torn_down(&self) -> bool {
		self.phase == ViewPhase::TornDown
	}
}

/// Write status published to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MutationStatus {
	/// Nothing submitted yet.
	#[default]
	Idle,
	/// A write is in flight.
	Pending,
	/// The last write succeeded.
	Succeeded,
	/// The last write failed.
	Failed(ApiError),
}

/// What a refresh call did to the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadReport {
	/// Fresh data was applied.
	Applied {
		/// Sequence of the applied load.
		sequence: u64,
	},
	/// A newer refresh started first; this one was dropped.
	Superseded,
	/// The load failed and the view shows the error.
	Failed(ApiError),
	/// Nothing happened: torn down, cancelled, or no refresh was needed.
	Ignored,
}

struct CoordinatorInner<R: Resource> {
	resource: R,
	key: ResourceKey,
	guard: FetchGuard,
	submitter: MutationSubmitter,
	live: Option<LiveSubscriber>,
	state: watch::Sender<ViewState<R::Data>>,
	mutation: watch::Sender<MutationStatus>,
	subscriptions: Mutex<Vec<Subscription>>,
	attached: AtomicBool,
	teardown: CancellationToken,
}

impl<R: Resource> CoordinatorInner<R> {
	fn is_torn_down(&self) -> bool {
		self.teardown.is_cancelled()
	}

	async fn load(&self, trigger: RefreshTrigger) -> LoadReport {
		if self.is_torn_down() {
			return LoadReport::Ignored;
		}
		let Some(token) = self.guard.begin(self.key.clone()) else {
			return LoadReport::Ignored;
		};
		let sequence = token.sequence();
		self.state.send_if_modified(|state| {
			if state.is_torn_down() {
				return false;
			}
			state.pending = state.pending.max(sequence);
			state.phase = ViewPhase::Loading;
			state.trigger = Some(trigger);
			true
		});
		tracing::debug!(key = %self.key, sequence, trigger = ?trigger, "sync.coordinator.refresh");

		let resource = &self.resource;
		let outcome = self.guard.run(token, |abort| resource.fetch(abort)).await;
		self.apply(outcome)
	}

	fn apply(&self, outcome: FetchOutcome<R::Data, ApiError>) -> LoadReport {
		match outcome {
			FetchOutcome::Accepted(Fetched { sequence, value }) => {
				let mut applied = false;
				self.state.send_if_modified(|state| {
					if state.is_torn_down() || sequence <= state.sequence {
						return false;
					}
					state.data = Some(value);
					state.sequence = sequence;
					if sequence >= state.pending {
						state.phase = ViewPhase::Ready;
					}
					applied = true;
					true
				});
				if applied {
					tracing::debug!(key = %self.key, sequence, "sync.coordinator.applied");
					LoadReport::Applied { sequence }
				} else {
					LoadReport::Ignored
				}
			}
			FetchOutcome::Failed { sequence, error } => {
				let shown = self.state.send_if_modified(|state| {
					if state.is_torn_down() || sequence < state.pending {
						return false;
					}
					state.phase = ViewPhase::Error(error.clone());
					true
				});
				if shown {
					tracing::debug!(key = %self.key, sequence, error = %error, "sync.coordinator.failed");
					LoadReport::Failed(error)
				} else {
					LoadReport::Superseded
				}
			}
			FetchOutcome::Superseded { .. } => LoadReport::Superseded,
			FetchOutcome::Cancelled { .. } => LoadReport::Ignored,
		}
	}

	fn set_degraded(&self, degraded: bool) {
		self.state.send_if_modified(|state| {
			if state.is_torn_down() || state.degraded == degraded {
				return false;
			}
			state.degraded = degraded;
			true
		});
	}

	fn close(&self) {
		self.teardown.cancel();
		self.guard.close();
		self.submitter.close();
	}
}

impl<R: Resource> Drop for CoordinatorInner<R> {
	fn drop(&mut self) {
		self.close();
	}
}

/// Detaches a refresh so callbacks never wait on the network.
fn spawn_load<R: Resource>(inner: Weak<CoordinatorInner<R>>, trigger: RefreshTrigger) {
	let Some(inner) = inner.upgrade() else {
		return;
	};
	if inner.is_torn_down() {
		return;
	}
	crate::task::spawn("coordinator.refresh", async move {
		let _ = inner.load(trigger).await;
	});
}

/// Per-screen controller keeping one view in sync with the server.
pub struct ViewCoordinator<R: Resource> {
	inner: Arc<CoordinatorInner<R>>,
}

impl<R: Resource> Clone for ViewCoordinator<R> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<R: Resource> fmt::Debug for ViewCoordinator<R> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ViewCoordinator")
			.field("key", &self.inner.key)
			.field("phase", &self.inner.state.borrow().phase)
			.field("live", &self.inner.live.is_some())
			.finish_non_exhaustive()
	}
}

impl<R: Resource> ViewCoordinator<R> {
	/// Coordinator without live updates; refreshes only on explicit triggers.
	pub fn new(resource: R) -> Self {
		Self::build(resource, None)
	}

	/// Coordinator refreshing on matching push events from `live`.
	pub fn with_live(resource: R, live: LiveSubscriber) -> Self {
		Self::build(resource, Some(live))
	}

	/// Coordinator attached to the process-wide session subscriber.
	pub fn with_session(resource: R) -> Result<Self, SessionError> {
		Ok(Self::with_live(resource, session::subscriber()?))
	}

	fn build(resource: R, live: Option<LiveSubscriber>) -> Self {
		let key = resource.key();
		let (state, _) = watch::channel(ViewState::idle());
		let (mutation, _) = watch::channel(MutationStatus::Idle);
		let inner = Arc::new(CoordinatorInner {
			resource,
			key,
			guard: FetchGuard::new(),
			submitter: MutationSubmitter::new(),
			live,
			state,
			mutation,
			subscriptions: Mutex::new(Vec::new()),
			attached: AtomicBool::new(false),
			teardown: CancellationToken::new(),
		});

		let weak = Arc::downgrade(&inner);
		inner.submitter.on_success(move |_| spawn_load(weak.clone(), RefreshTrigger::Mutation));
		Self { inner }
	}

	/// Logical key of the screen's subject.
	pub fn key(&self) -> &ResourceKey {
		&self.inner.key
	}

	/// Snapshot of the view state.
	pub fn state(&self) -> ViewState<R::Data> {
		self.inner.state.borrow().clone()
	}

	/// Receiver observing view state changes.
	pub fn watch(&self) -> watch::Receiver<ViewState<R::Data>> {
		self.inner.state.subscribe()
	}

	/// Current write status.
	pub fn mutation_status(&self) -> MutationStatus {
		self.inner.mutation.borrow().clone()
	}

	/// Receiver observing write status changes.
	pub fn watch_mutations(&self) -> watch::Receiver<MutationStatus> {
		self.inner.mutation.subscribe()
	}

	/// Returns true once torn down.
	pub fn is_torn_down(&self) -> bool {
		self.inner.is_torn_down()
	}

	/// Mounts the screen: subscribes to live events and loads.
	pub async fn mount(&self, signal: NavigationSignal) -> LoadReport {
		if self.is_torn_down() {
			return LoadReport::Ignored;
		}
		self.attach_live();
		let trigger = match signal {
			NavigationSignal::Unchanged => RefreshTrigger::Mount,
			NavigationSignal::DataChanged => RefreshTrigger::Navigation,
		};
		self.inner.load(trigger).await
	}

	/// User-initiated refresh.
	pub async fn refresh(&self) -> LoadReport {
		self.inner.load(RefreshTrigger::Manual).await
	}

	/// User-initiated retry after an error.
	pub async fn retry(&self) -> LoadReport {
		self.inner.load(RefreshTrigger::Retry).await
	}

	/// Navigation returned to this already-mounted screen.
	pub async fn navigated(&self, signal: NavigationSignal) -> LoadReport {
		match signal {
			NavigationSignal::Unchanged => LoadReport::Ignored,
			NavigationSignal::DataChanged => self.inner.load(RefreshTrigger::Navigation).await,
		}
	}

	/// Submits a write through this screen's submitter.
	///
	/// A busy or refused submission returns a settled ticket and leaves the published
	/// status alone: [`MutationStatus`] has no busy state, so a `RejectedBusy` is only
	/// visible in the ticket's [`MutationOutcome`]. On success the view refreshes.
	pub fn submit<T, E, F, Fut>(&self, entity: EntityId, kind: MutationKind, mutate: F) -> MutationTicket<T>
	where
		T: Send + 'static,
		E: Into<ApiError> + 'static,
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>> + Send + 'static,
	{
		let ticket = self.inner.submitter.submit(entity, kind, mutate);
		if ticket.is_settled() {
			return ticket;
		}
		self.inner.mutation.send_replace(MutationStatus::Pending);

		let weak = Arc::downgrade(&self.inner);
		MutationTicket::running(async move {
			let outcome = ticket.await;
			if let Some(inner) = weak.upgrade()
				&& !inner.is_torn_down()
			{
				let status = match &outcome {
					MutationOutcome::Success(_) => Some(MutationStatus::Succeeded),
					MutationOutcome::Failed(err) => Some(MutationStatus::Failed(err.clone())),
					MutationOutcome::RejectedBusy | MutationOutcome::Cancelled => None,
				};
				if let Some(status) = status {
					inner.mutation.send_replace(status);
				}
			}
			outcome
		})
	}

	/// Optimistically edits loaded data in place. Returns false when nothing is loaded.
	///
	/// The next applied load replaces the patched data.
	pub fn patch(&self, f: impl FnOnce(&mut R::Data)) -> bool {
		self.inner.state.send_if_modified(|state| match (&state.phase, state.data.as_mut()) {
			(ViewPhase::TornDown, _) | (_, None) => false,
			(_, Some(data)) => {
				f(data);
				true
			}
		})
	}

	/// Tears the screen down: cancels loads and pending writes, drops subscriptions.
	pub fn teardown(&self) {
		if self.inner.is_torn_down() {
			return;
		}
		self.inner.close();
		let subscriptions = std::mem::take(&mut *self.inner.subscriptions.lock());
		drop(subscriptions);
		self.inner.state.send_modify(|state| state.phase = ViewPhase::TornDown);
		tracing::debug!(key = %self.inner.key, "sync.coordinator.teardown");
	}

	fn attach_live(&self) {
		let Some(live) = &self.inner.live else {
			return;
		};
		if self.inner.attached.swap(true, Ordering::AcqRel) {
			return;
		}

		let weak = Arc::downgrade(&self.inner);
		let subscription = live.subscribe(self.inner.resource.filter(), move |event: &PushEvent| {
			spawn_load(weak.clone(), RefreshTrigger::Push(event.kind));
		});
		self.inner.subscriptions.lock().push(subscription);

		let mut status_rx = live.watch_status();
		let initial = *status_rx.borrow_and_update();
		self.inner.set_degraded(initial.is_degraded());
		// Seeded from the subscriber so a view attaching while the link is down still
		// re-fetches when it comes back.
		let mut seen = match initial {
			LinkStatus::Connected { generation } => generation,
			_ => live.generation(),
		};

		let weak = Arc::downgrade(&self.inner);
		let teardown = self.inner.teardown.clone();
		crate::task::spawn("coordinator.link_watch", async move {
			loop {
				tokio::select! {
					biased;
					_ = teardown.cancelled() => break,
					changed = status_rx.changed() => {
						if changed.is_err() {
							break;
						}
					}
				}
				let status = *status_rx.borrow_and_update();
				let Some(inner) = weak.upgrade() else {
					break;
				};
				inner.set_degraded(status.is_degraded());

				if let LinkStatus::Connected { generation } = status {
					let reconnected = seen != 0 && seen != generation;
					seen = generation;
					let loaded_before = inner.state.borrow().phase != ViewPhase::Idle;
					if reconnected && loaded_before {
						tracing::debug!(key = %inner.key, generation, "sync.coordinator.reconnected");
						drop(inner);
						spawn_load(weak.clone(), RefreshTrigger::Reconnect);
					}
				}
			}
		});
	}
}
