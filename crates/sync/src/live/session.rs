//! Process-wide live session slot.
//!
//! The application installs a factory once at startup with [`configure`]; the first
//! [`subscriber`] call builds the subscriber and connects it, later calls return clones of
//! the same instance. [`end`] tears it down at session end (logout, shutdown); the next
//! [`subscriber`] call after that builds a fresh one. Tests construct their own
//! [`LiveSubscriber`] instead of going through this slot.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::LiveSubscriber;
use crate::error::SessionError;

type Factory = Arc<dyn Fn() -> LiveSubscriber + Send + Sync>;

#[derive(Default)]
struct SessionSlot {
	factory: Option<Factory>,
	current: Option<LiveSubscriber>,
}

fn slot() -> &'static Mutex<SessionSlot> {
	static SESSION: OnceLock<Mutex<SessionSlot>> = OnceLock::new();
	SESSION.get_or_init(|| Mutex::new(SessionSlot::default()))
}

/// Installs the factory used to build the session subscriber.
///
/// Replacing the factory does not affect a subscriber that was already built.
pub fn configure(factory: impl Fn() -> LiveSubscriber + Send + Sync + 'static) {
	slot().lock().factory = Some(Arc::new(factory));
}

/// Returns the session subscriber, building and connecting it on first use.
pub fn subscriber() -> Result<LiveSubscriber, SessionError> {
	let mut slot = slot().lock();
	if let Some(current) = &slot.current {
		return Ok(current.clone());
	}
	let factory = slot.factory.clone().ok_or(SessionError::NotConfigured)?;
	let subscriber = factory();
	subscriber.connect();
	slot.current = Some(subscriber.clone());
	tracing::debug!("sync.live.session.start");
	Ok(subscriber)
}

/// Returns the session subscriber if one was built.
pub fn current() -> Option<LiveSubscriber> {
	slot().lock().current.clone()
}

/// Shuts down and forgets the session subscriber. The factory stays installed.
pub fn end() {
	let current = slot().lock().current.take();
	if let Some(subscriber) = current {
		subscriber.shutdown();
		tracing::debug!("sync.live.session.end");
	}
}

/// Ends the session and removes the factory.
pub fn reset() {
	end();
	slot().lock().factory = None;
}
