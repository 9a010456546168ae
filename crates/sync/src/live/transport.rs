//! Boundary to the live channel transport.

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use super::event::WireMessage;
use crate::error::LiveError;

/// Opens physical connections to the live endpoint.
///
/// Implementations wrap a websocket or server-sent-events client. The subscriber never
/// writes through a connection.
#[async_trait]
pub trait LiveTransport: Send + Sync + 'static {
	/// Opens one connection.
	async fn open(&self, endpoint: &Url) -> Result<Box<dyn LiveStream>, LiveError>;
}

/// Inbound half of one physical connection.
#[async_trait]
pub trait LiveStream: Send {
	/// Next message; `None` once the peer closed the connection.
	///
	/// An `Err` ends the connection as well.
	async fn next_message(&mut self) -> Option<Result<WireMessage, LiveError>>;
}

/// Channel-backed streams, for transports that read the socket on their own task.
#[async_trait]
impl LiveStream for mpsc::Receiver<Result<WireMessage, LiveError>> {
	async fn next_message(&mut self) -> Option<Result<WireMessage, LiveError>> {
		self.recv().await
	}
}

#[async_trait]
impl LiveStream for mpsc::UnboundedReceiver<Result<WireMessage, LiveError>> {
	async fn next_message(&mut self) -> Option<Result<WireMessage, LiveError>> {
		self.recv().await
	}
}
