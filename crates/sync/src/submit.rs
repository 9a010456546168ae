//! Write submission with per-entity exclusion.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use parking_lot::Mutex;
use strum::Display;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::key::EntityId;

/// Kind of write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum MutationKind {
	/// Create a new entity.
	Create,
	/// Update an existing entity.
	Update,
	/// Delete an entity.
	Delete,
}

/// One outstanding write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
	/// Target entity.
	pub entity: EntityId,
	/// Kind of write.
	pub kind: MutationKind,
	/// When the write was submitted.
	pub submitted_at: SystemTime,
}

/// Notice handed to the success listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReceipt {
	/// Target entity.
	pub entity: EntityId,
	/// Kind of write.
	pub kind: MutationKind,
}

/// Resolution of one submit call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum MutationOutcome<T> {
	/// The write succeeded.
	Success(T),
	/// Another write for the same entity was still pending; nothing was sent.
	RejectedBusy,
	/// The write failed.
	Failed(ApiError),
	/// The owning view was torn down before the result arrived; the result was dropped.
	Cancelled,
}

impl<T> MutationOutcome<T> {
	/// Returns true for [`MutationOutcome::Success`].
	pub fn is_success(&self) -> bool {
		matches!(self, Self::Success(_))
	}

	/// Returns true for [`MutationOutcome::RejectedBusy`].
	pub fn is_busy(&self) -> bool {
		matches!(self, Self::RejectedBusy)
	}

	/// Success payload, if any.
	pub fn success(self) -> Option<T> {
		match self {
			Self::Success(value) => Some(value),
			_ => None,
		}
	}
}

type SuccessListener = Arc<dyn Fn(&MutationReceipt) + Send + Sync>;
type BoxedOutcome<T> = Pin<Box<dyn Future<Output = MutationOutcome<T>> + Send>>;

enum TicketState<T> {
	Settled(Option<MutationOutcome<T>>),
	Running(BoxedOutcome<T>),
}

/// Future of one submitted write.
///
/// Tickets for rejected or refused submissions are already settled, which the caller
/// can check synchronously with [`MutationTicket::is_settled`]. Dropping a running ticket
/// releases the entity's pending slot.
#[must_use = "a mutation ticket does nothing unless awaited"]
pub struct MutationTicket<T> {
	state: TicketState<T>,
}

// The boxed future is pinned on the heap and the settled value is never pinned.
impl<T> Unpin for MutationTicket<T> {}

impl<T> MutationTicket<T> {
	pub(crate) fn settled(outcome: MutationOutcome<T>) -> Self {
		Self {
			state: TicketState::Settled(Some(outcome)),
		}
	}

	pub(crate) fn running(fut: impl Future<Output = MutationOutcome<T>> + Send + 'static) -> Self {
		Self {
			state: TicketState::Running(Box::pin(fut)),
		}
	}

	/// Returns true when the outcome was decided at submit time.
	pub fn is_settled(&self) -> bool {
		matches!(self.state, TicketState::Settled(_))
	}
}

impl<T> fmt::Debug for MutationTicket<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MutationTicket").field("settled", &self.is_settled()).finish_non_exhaustive()
	}
}

impl<T> Future for MutationTicket<T> {
	type Output = MutationOutcome<T>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match &mut self.get_mut().state {
			TicketState::Settled(outcome) => match outcome.take() {
				Some(outcome) => Poll::Ready(outcome),
				None => Poll::Ready(MutationOutcome::Cancelled),
			},
			TicketState::Running(fut) => fut.as_mut().poll(cx),
		}
	}
}

struct SubmitterInner {
	pending: Mutex<HashMap<EntityId, PendingMutation>>,
	closed: CancellationToken,
	listener: Mutex<Option<SuccessListener>>,
}

/// Removes the pending entry when the write settles or its ticket is dropped.
struct PendingSlot {
	inner: Arc<SubmitterInner>,
	entity: EntityId,
}

impl Drop for PendingSlot {
	fn drop(&mut self) {
		self.inner.pending.lock().remove(&self.entity);
	}
}

/// Per-view write submitter allowing one pending write per entity.
#[derive(Clone)]
pub struct MutationSubmitter {
	inner: Arc<SubmitterInner>,
}

impl Default for MutationSubmitter {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for MutationSubmitter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MutationSubmitter")
			.field("pending", &self.inner.pending.lock().len())
			.field("closed", &self.inner.closed.is_cancelled())
			.finish_non_exhaustive()
	}
}

impl MutationSubmitter {
	/// Creates an open submitter.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(SubmitterInner {
				pending: Mutex::new(HashMap::new()),
				closed: CancellationToken::new(),
				listener: Mutex::new(None),
			}),
		}
	}

	/// Installs the callback invoked after each successful write.
	pub fn on_success(&self, listener: impl Fn(&MutationReceipt) + Send + Sync + 'static) {
		*self.inner.listener.lock() = Some(Arc::new(listener));
	}

	/// Submits a write for `entity`.
	///
	/// The busy check and the pending-slot claim happen before this returns: a second
	/// call for the same entity gets a settled [`MutationOutcome::RejectedBusy`] ticket and
	/// its `mutate` is never invoked.
	pub fn submit<T, E, F, Fut>(&self, entity: EntityId, kind: MutationKind, mutate: F) -> MutationTicket<T>
	where
		T: Send + 'static,
		E: Into<ApiError> + 'static,
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>> + Send + 'static,
	{
		if self.inner.closed.is_cancelled() {
			tracing::debug!(entity = %entity, %kind, "sync.submit.closed");
			return MutationTicket::settled(MutationOutcome::Cancelled);
		}

		{
			let mut pending = self.inner.pending.lock();
			if let Some(current) = pending.get(&entity) {
				tracing::debug!(entity = %entity, %kind, pending = %current.kind, "sync.submit.busy");
				return MutationTicket::settled(MutationOutcome::RejectedBusy);
			}
			pending.insert(
				entity.clone(),
				PendingMutation {
					entity: entity.clone(),
					kind,
					submitted_at: SystemTime::now(),
				},
			);
		}

		let slot = PendingSlot {
			inner: Arc::clone(&self.inner),
			entity,
		};
		tracing::debug!(entity = %slot.entity, %kind, "sync.submit.start");
		let fut = mutate();

		MutationTicket::running(async move {
			// The write runs to completion; teardown only discards its result.
			let result = fut.await;
			let inner = Arc::clone(&slot.inner);
			let entity = slot.entity.clone();
			drop(slot);

			if inner.closed.is_cancelled() {
				tracing::debug!(entity = %entity, %kind, "sync.submit.dropped");
				return MutationOutcome::Cancelled;
			}

			match result {
				Ok(value) => {
					tracing::debug!(entity = %entity, %kind, "sync.submit.success");
					let listener = inner.listener.lock().clone();
					if let Some(listener) = listener {
						listener(&MutationReceipt { entity, kind });
					}
					MutationOutcome::Success(value)
				}
				Err(err) => {
					let err: ApiError = err.into();
					tracing::debug!(entity = %entity, %kind, error = %err, "sync.submit.failed");
					MutationOutcome::Failed(err)
				}
			}
		})
	}

	/// Returns true while a write for `entity` is pending.
	pub fn is_pending(&self, entity: &EntityId) -> bool {
		self.inner.pending.lock().contains_key(entity)
	}

	/// Snapshot of the pending write for `entity`.
	pub fn pending(&self, entity: &EntityId) -> Option<PendingMutation> {
		self.inner.pending.lock().get(entity).cloned()
	}

	/// Drops the results of pending writes and refuses new ones.
	pub fn close(&self) {
		self.inner.closed.cancel();
		*self.inner.listener.lock() = None;
	}

	/// Returns true once [`Self::close`] was called.
	pub fn is_closed(&self) -> bool {
		self.inner.closed.is_cancelled()
	}
}
