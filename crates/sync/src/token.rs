use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::key::ResourceKey;

/// Monotonic generation clock shared by clones.
#[derive(Debug, Default, Clone)]
pub(crate) struct GenerationClock {
	next: Arc<AtomicU64>,
}

impl GenerationClock {
	/// Creates a new generation clock starting at generation 1.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the next generation ID.
	pub fn next(&self) -> u64 {
		self.next.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
	}

	/// Last generation handed out, `0` before the first.
	pub fn current(&self) -> u64 {
		self.next.load(Ordering::Acquire)
	}
}

/// Handle for one in-flight fetch attempt.
///
/// Issued by [`FetchGuard::begin`](crate::FetchGuard::begin) and consumed by
/// [`FetchGuard::run`](crate::FetchGuard::run). Tokens are neither cloned nor reused: a
/// superseded token stays cancelled forever.
#[derive(Debug)]
pub struct RequestToken {
	key: ResourceKey,
	sequence: u64,
	cancel: CancellationToken,
}

impl RequestToken {
	pub(crate) fn new(key: ResourceKey, sequence: u64, cancel: CancellationToken) -> Self {
		Self { key, sequence, cancel }
	}

	/// Logical key this attempt loads.
	pub fn key(&self) -> &ResourceKey {
		&self.key
	}

	/// Per-key sequence number, starting at 1.
	pub const fn sequence(&self) -> u64 {
		self.sequence
	}

	/// Returns true once superseded, cancelled or closed.
	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Abort signal to hand to the transport.
	pub fn signal(&self) -> AbortSignal {
		AbortSignal {
			cancel: self.cancel.child_token(),
		}
	}

	pub(crate) async fn cancelled(&self) {
		self.cancel.cancelled().await;
	}
}

/// Best-effort abort request passed to fetch functions.
///
/// Transports able to stop a request early should watch it; the guard drops the result
/// of an aborted attempt whether or not the transport honors it.
#[derive(Debug, Clone)]
pub struct AbortSignal {
	cancel: CancellationToken,
}

impl AbortSignal {
	/// Signal that never fires.
	pub fn never() -> Self {
		Self {
			cancel: CancellationToken::new(),
		}
	}

	/// Returns true when the attempt was abandoned.
	pub fn is_aborted(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Resolves when the attempt is abandoned.
	pub async fn aborted(&self) {
		self.cancel.cancelled().await;
	}
}
