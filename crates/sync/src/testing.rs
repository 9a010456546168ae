//! Fakes and helpers shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::config::LiveConfig;
use crate::coordinator::Resource;
use crate::error::{ApiError, LiveError};
use crate::key::ResourceKey;
use crate::live::{LiveStream, LiveTransport, WireMessage};
use crate::token::AbortSignal;

pub(crate) fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::TRACE).try_init();
}

/// Lets spawned tasks on the current-thread runtime run to their next await point.
pub(crate) async fn yield_many() {
	for _ in 0..16 {
		tokio::task::yield_now().await;
	}
}

/// Polls `cond` until it holds, panicking after two seconds.
pub(crate) async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
	while !cond() {
		assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
		tokio::time::sleep(Duration::from_millis(1)).await;
	}
}

/// Live settings with a tiny delay so reconnect tests finish quickly.
pub(crate) fn fast_live_config(attempts: u32) -> LiveConfig {
	LiveConfig::default()
		.max_reconnect_attempts(attempts)
		.reconnect_delay(Duration::from_millis(1))
}

type Sender = mpsc::UnboundedSender<Result<WireMessage, LiveError>>;

enum Script {
	Accept,
	Refuse,
	/// Accepts, then closes before sending anything.
	Flap,
}

#[derive(Default)]
struct FakeTransportState {
	script: Mutex<VecDeque<Script>>,
	current: Mutex<Option<Sender>>,
	opens: AtomicUsize,
}

/// Scripted transport: each `open` pops the next scripted answer, refusing once the
/// script runs out.
#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
	state: Arc<FakeTransportState>,
}

impl FakeTransport {
	pub fn accept_next(&self, count: usize) -> &Self {
		self.state.script.lock().extend((0..count).map(|_| Script::Accept));
		self
	}

	pub fn refuse_next(&self, count: usize) -> &Self {
		self.state.script.lock().extend((0..count).map(|_| Script::Refuse));
		self
	}

	pub fn flap_next(&self, count: usize) -> &Self {
		self.state.script.lock().extend((0..count).map(|_| Script::Flap));
		self
	}

	pub fn opens(&self) -> usize {
		self.state.opens.load(Ordering::Acquire)
	}

	pub fn is_open(&self) -> bool {
		self.state.current.lock().as_ref().is_some_and(|tx| !tx.is_closed())
	}

	/// Sends a message on the newest connection. Returns false when none is open.
	pub fn emit(&self, event: &str, data: &str) -> bool {
		self.send(Ok(WireMessage::new(event, data)))
	}

	/// Ends the newest connection with a stream error.
	pub fn fail(&self, reason: &str) -> bool {
		let sent = self.send(Err(LiveError::Stream(reason.into())));
		self.state.current.lock().take();
		sent
	}

	/// Closes the newest connection from the server side.
	pub fn hang_up(&self) -> bool {
		self.state.current.lock().take().is_some()
	}

	fn send(&self, msg: Result<WireMessage, LiveError>) -> bool {
		self.state.current.lock().as_ref().is_some_and(|tx| tx.send(msg).is_ok())
	}
}

#[async_trait]
impl LiveTransport for FakeTransport {
	async fn open(&self, _endpoint: &Url) -> Result<Box<dyn LiveStream>, LiveError> {
		self.state.opens.fetch_add(1, Ordering::AcqRel);
		let next = self.state.script.lock().pop_front();
		match next {
			Some(Script::Accept) => {
				let (tx, rx) = mpsc::unbounded_channel();
				*self.state.current.lock() = Some(tx);
				Ok(Box::new(rx))
			}
			Some(Script::Flap) => {
				let (_, rx) = mpsc::unbounded_channel();
				Ok(Box::new(rx))
			}
			Some(Script::Refuse) | None => Err(LiveError::Connect("connection refused".into())),
		}
	}
}

type Reply = Result<String, ApiError>;

struct FakeResourceState {
	server: Mutex<Reply>,
	held: Mutex<VecDeque<oneshot::Receiver<Reply>>>,
	calls: AtomicUsize,
	signals: Mutex<Vec<AbortSignal>>,
}

/// Resource answering with the current "server" value, or with a held reply the test
/// releases explicitly.
#[derive(Clone)]
pub(crate) struct FakeResource {
	key: ResourceKey,
	state: Arc<FakeResourceState>,
}

impl FakeResource {
	pub fn new(key: ResourceKey, initial: &str) -> Self {
		Self {
			key,
			state: Arc::new(FakeResourceState {
				server: Mutex::new(Ok(initial.to_string())),
				held: Mutex::new(VecDeque::new()),
				calls: AtomicUsize::new(0),
				signals: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Changes what unheld fetches return.
	pub fn set(&self, reply: Result<&str, ApiError>) {
		*self.state.server.lock() = reply.map(str::to_string);
	}

	/// Makes the next fetch wait until the returned sender is used.
	pub fn hold_next(&self) -> oneshot::Sender<Reply> {
		let (tx, rx) = oneshot::channel();
		self.state.held.lock().push_back(rx);
		tx
	}

	pub fn calls(&self) -> usize {
		self.state.calls.load(Ordering::Acquire)
	}

	/// Number of fetches whose abort signal fired.
	pub fn aborted(&self) -> usize {
		self.state.signals.lock().iter().filter(|signal| signal.is_aborted()).count()
	}
}

#[async_trait]
impl Resource for FakeResource {
	type Data = String;

	fn key(&self) -> ResourceKey {
		self.key.clone()
	}

	async fn fetch(&self, abort: AbortSignal) -> Result<String, ApiError> {
		self.state.calls.fetch_add(1, Ordering::AcqRel);
		self.state.signals.lock().push(abort);
		let held = self.state.held.lock().pop_front();
		match held {
			Some(rx) => rx.await.unwrap_or_else(|_| Err(ApiError::network("reply dropped"))),
			None => self.state.server.lock().clone(),
		}
	}
}
