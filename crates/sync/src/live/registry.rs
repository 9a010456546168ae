use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};

use super::event::{EventFilter, PushEvent};

pub(crate) type EventCallback = Arc<dyn Fn(&PushEvent) + Send + Sync>;

struct Entry {
	id: u64,
	filter: EventFilter,
	callback: EventCallback,
	/// Held for the duration of each callback invocation. Reentrant so a callback may
	/// drop its own subscription.
	active: ReentrantMutex<Cell<bool>>,
}

/// Insertion-ordered subscription table.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
	entries: Mutex<Vec<Arc<Entry>>>,
	next_id: AtomicU64,
}

impl SubscriptionRegistry {
	pub fn register(self: &Arc<Self>, filter: EventFilter, callback: EventCallback) -> Subscription {
		let id = self.next_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
		self.entries.lock().push(Arc::new(Entry {
			id,
			filter,
			callback,
			active: ReentrantMutex::new(Cell::new(true)),
		}));
		tracing::trace!(subscription = id, "sync.live.subscribe");
		Subscription {
			id,
			registry: Arc::downgrade(self),
		}
	}

	/// Removes `id`. Once this returns, its callback is not running on another thread and
	/// will not be invoked again.
	pub fn remove(&self, id: u64) -> bool {
		let entry = {
			let mut entries = self.entries.lock();
			let Some(index) = entries.iter().position(|entry| entry.id == id) else {
				return false;
			};
			entries.remove(index)
		};
		entry.active.lock().set(false);
		tracing::trace!(subscription = id, "sync.live.unsubscribe");
		true
	}

	/// Invokes every matching callback in insertion order; returns how many ran.
	pub fn dispatch(&self, event: &PushEvent) -> usize {
		let snapshot = self.entries.lock().clone();
		let mut delivered = 0;
		for entry in snapshot {
			if !entry.filter.matches(event) {
				continue;
			}
			let active = entry.active.lock();
			if active.get() {
				(entry.callback)(event);
				delivered += 1;
			}
		}
		delivered
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}
}

/// Registration handle returned by [`LiveSubscriber::subscribe`](super::LiveSubscriber::subscribe).
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
	id: u64,
	registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
	/// Registration id, unique per subscriber.
	pub fn id(&self) -> u64 {
		self.id
	}

	/// Returns true while still registered.
	pub fn is_active(&self) -> bool {
		self.registry.upgrade().is_some_and(|registry| registry.entries.lock().iter().any(|entry| entry.id == self.id))
	}

	/// Unsubscribes now; returns false if it was no longer registered.
	pub fn unsubscribe(mut self) -> bool {
		self.detach()
	}

	fn detach(&mut self) -> bool {
		let registry = std::mem::take(&mut self.registry);
		registry.upgrade().is_some_and(|registry| registry.remove(self.id))
	}
}

impl fmt::Debug for Subscription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Subscription").field("id", &self.id).finish_non_exhaustive()
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.detach();
	}
}
