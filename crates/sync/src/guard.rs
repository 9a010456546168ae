//! Single-flight loads with stale-result dropping.
//!
//! Every [`FetchGuard::load`] for a key issues a fresh [`RequestToken`] whose sequence is
//! one past the previous one and cancels whatever token was still outstanding for that
//! key. Cancellation has two independent halves:
//! * the fetch function receives an [`AbortSignal`] and the in-flight future is dropped,
//!   which aborts transports that support it;
//! * the token's currency is re-checked under the guard lock when the result arrives, so
//!   a result that slipped through is still discarded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::key::ResourceKey;
use crate::token::{AbortSignal, RequestToken};

/// Value produced by an accepted load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched<T> {
	/// Sequence of the token that produced the value.
	pub sequence: u64,
	/// Loaded value.
	pub value: T,
}

/// Resolution of one load attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum FetchOutcome<T, E> {
	/// The attempt was the latest for its key; its value should be applied.
	Accepted(Fetched<T>),
	/// A newer attempt was issued first; the result was dropped.
	Superseded {
		/// Sequence of the dropped attempt.
		sequence: u64,
	},
	/// The latest attempt failed.
	Failed {
		/// Sequence of the failed attempt.
		sequence: u64,
		/// Failure reported by the fetch function.
		error: E,
	},
	/// The key was cancelled or the guard closed; the result was dropped.
	Cancelled {
		/// Sequence of the dropped attempt, `0` when none was issued.
		sequence: u64,
	},
}

impl<T, E> FetchOutcome<T, E> {
	/// Sequence of the attempt this outcome belongs to.
	pub fn sequence(&self) -> u64 {
		match self {
			Self::Accepted(fetched) => fetched.sequence,
			Self::Superseded { sequence } | Self::Failed { sequence, .. } | Self::Cancelled { sequence } => *sequence,
		}
	}

	/// Returns true for [`FetchOutcome::Accepted`].
	pub fn is_accepted(&self) -> bool {
		matches!(self, Self::Accepted(_))
	}

	/// Returns true for [`FetchOutcome::Superseded`].
	pub fn is_superseded(&self) -> bool {
		matches!(self, Self::Superseded { .. })
	}

	/// Accepted value, if any.
	pub fn accepted(self) -> Option<T> {
		match self {
			Self::Accepted(fetched) => Some(fetched.value),
			_ => None,
		}
	}
}

#[derive(Debug, Default)]
struct KeySlot {
	/// Highest sequence issued.
	issued: u64,
	/// Highest sequence accepted.
	accepted: u64,
	/// Cancellation handle of the outstanding token, if any.
	current: Option<CancellationToken>,
}

#[derive(Debug, Default)]
struct GuardState {
	slots: HashMap<ResourceKey, KeySlot>,
	closed: bool,
}

enum Currency {
	Latest,
	Superseded,
	Cancelled,
}

/// Single-flight request guard scoped to one view.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct FetchGuard {
	state: Arc<Mutex<GuardState>>,
}

impl FetchGuard {
	/// Creates an open guard with no history.
	pub fn new() -> Self {
		Self::default()
	}

	/// Issues the next token for `key`, cancelling any outstanding one.
	///
	/// Returns `None` once the guard is closed.
	pub fn begin(&self, key: ResourceKey) -> Option<RequestToken> {
		let mut state = self.state.lock();
		if state.closed {
			tracing::trace!(key = %key, "sync.fetch.closed");
			return None;
		}
		let slot = state.slots.entry(key.clone()).or_default();
		if let Some(previous) = slot.current.take() {
			previous.cancel();
			tracing::trace!(key = %key, superseded = slot.issued, "sync.fetch.supersede");
		}
		slot.issued = slot.issued.wrapping_add(1);
		let cancel = CancellationToken::new();
		slot.current = Some(cancel.clone());
		tracing::trace!(key = %key, sequence = slot.issued, "sync.fetch.begin");
		Some(RequestToken::new(key, slot.issued, cancel))
	}

	/// Drives an issued token to its outcome.
	///
	/// The fetch future is dropped as soon as the token is cancelled; a result that
	/// completes anyway is dropped by the currency check.
	pub async fn run<T, E, F, Fut>(&self, token: RequestToken, fetch: F) -> FetchOutcome<T, E>
	where
		F: FnOnce(AbortSignal) -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		let fut = fetch(token.signal());
		let result = tokio::select! {
			biased;
			_ = token.cancelled() => None,
			res = fut => Some(res),
		};
		self.settle(token, result)
	}

	/// Issues a token for `key` and runs `fetch` under it.
	pub async fn load<T, E, F, Fut>(&self, key: ResourceKey, fetch: F) -> FetchOutcome<T, E>
	where
		F: FnOnce(AbortSignal) -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		match self.begin(key) {
			Some(token) => self.run(token, fetch).await,
			None => FetchOutcome::Cancelled { sequence: 0 },
		}
	}

	/// Cancels the outstanding token for `key`, if any.
	pub fn cancel(&self, key: &ResourceKey) {
		let mut state = self.state.lock();
		if let Some(current) = state.slots.get_mut(key).and_then(|slot| slot.current.take()) {
			current.cancel();
			tracing::trace!(key = %key, "sync.fetch.cancel");
		}
	}

	/// Cancels every outstanding token and refuses new ones.
	pub fn close(&self) {
		let mut state = self.state.lock();
		state.closed = true;
		for slot in state.slots.values_mut() {
			if let Some(current) = slot.current.take() {
				current.cancel();
			}
		}
	}

	/// Returns true once [`Self::close`] was called.
	pub fn is_closed(&self) -> bool {
		self.state.lock().closed
	}

	/// Highest sequence issued for `key`, `0` when none.
	pub fn latest_sequence(&self, key: &ResourceKey) -> u64 {
		self.state.lock().slots.get(key).map_or(0, |slot| slot.issued)
	}

	/// Returns true while a token for `key` is outstanding.
	pub fn is_in_flight(&self, key: &ResourceKey) -> bool {
		self.state.lock().slots.get(key).is_some_and(|slot| slot.current.is_some())
	}

	fn settle<T, E>(&self, token: RequestToken, result: Option<Result<T, E>>) -> FetchOutcome<T, E> {
		let sequence = token.sequence();
		let mut state = self.state.lock();
		let currency = if state.closed {
			Currency::Cancelled
		} else {
			match state.slots.get(token.key()) {
				Some(slot) if slot.issued > sequence => Currency::Superseded,
				Some(_) if token.is_cancelled() => Currency::Cancelled,
				Some(_) => Currency::Latest,
				None => Currency::Cancelled,
			}
		};

		let outcome = match (currency, result) {
			(Currency::Superseded, _) => FetchOutcome::Superseded { sequence },
			(Currency::Cancelled, _) | (Currency::Latest, None) => FetchOutcome::Cancelled { sequence },
			(Currency::Latest, Some(result)) => {
				let Some(slot) = state.slots.get_mut(token.key()) else {
					return FetchOutcome::Cancelled { sequence };
				};
				slot.current = None;
				match result {
					Ok(value) if sequence > slot.accepted => {
						slot.accepted = sequence;
						FetchOutcome::Accepted(Fetched { sequence, value })
					}
					Ok(_) => FetchOutcome::Superseded { sequence },
					Err(error) => FetchOutcome::Failed { sequence, error },
				}
			}
		};
		drop(state);

		match &outcome {
			FetchOutcome::Accepted(_) => tracing::trace!(key = %token.key(), sequence, "sync.fetch.accepted"),
			FetchOutcome::Superseded { .. } => tracing::debug!(key = %token.key(), sequence, "sync.fetch.superseded"),
			FetchOutcome::Failed { .. } => tracing::debug!(key = %token.key(), sequence, "sync.fetch.failed"),
			FetchOutcome::Cancelled { .. } => tracing::debug!(key = %token.key(), sequence, "sync.fetch.cancelled"),
		}
		outcome
	}
}
