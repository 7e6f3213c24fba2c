//! Application layer adapter (spec §4.I): the terminal endpoint delivered
//! to the caller once a stack finishes building.
//!
//! Two concrete endpoints are supplied: [`ByteStreamEndpoint`], an
//! `AsyncRead` handle following the teacher's `Socket`/`SocketType`
//! poll-forwarding idiom, and [`ChannelHandoffEndpoint`], a stub covering
//! spec §4.I's "or a future for a completed higher-level session" clause.
//! The callable/RPC channel protocol itself is out of scope (spec §1) — the
//! stub only resolves its `oneshot::Receiver` with the stack's close cause,
//! the way `agent_hbone`'s connection-establishment futures resolve, without
//! building out the channel semantics on top of it.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use stackwire_core::CloseCause;
use stackwire_proto::ApplicationLayer;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

enum StreamEvent {
	Data(Bytes),
	Closed(Option<CloseCause>),
}

/// Byte-oriented application layer: bridges the stack's push-style
/// `on_read`/`on_read_closed` callbacks onto a pollable [`AsyncRead`].
/// Writes go through `Stack::send` directly; this endpoint only covers the
/// read half, matching the split the core itself expects from the caller
/// (spec's "Stack::close" and implicit "Stack::send" sit on the stack
/// handle, not the endpoint).
pub struct ByteStreamApp {
	tx: mpsc::UnboundedSender<StreamEvent>,
	rx: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
	read_open: AtomicBool,
}

impl ByteStreamApp {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		Self {
			tx,
			rx: Mutex::new(Some(rx)),
			read_open: AtomicBool::new(true),
		}
	}
}

impl Default for ByteStreamApp {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl ApplicationLayer for ByteStreamApp {
	type Endpoint = ByteStreamEndpoint;

	async fn start(&self) -> Result<(), stackwire_core::StackError> {
		Ok(())
	}

	async fn on_read(&self, data: Bytes) {
		trace!(bytes = data.len(), "byte stream app: data arrived");
		let _ = self.tx.send(StreamEvent::Data(data));
	}

	async fn on_read_closed(&self, cause: Option<CloseCause>) {
		self.read_open.store(false, Ordering::Release);
		let _ = self.tx.send(StreamEvent::Closed(cause));
	}

	fn is_read_open(&self) -> bool {
		self.read_open.load(Ordering::Acquire)
	}

	fn get(&self) -> Self::Endpoint {
		let rx = self.rx.lock().take().expect("endpoint already taken");
		ByteStreamEndpoint { rx, pending: BytesMut::new(), close_cause: None, eof: false }
	}
}

/// The read half of a stack's byte stream, handed to the caller once. Call
/// `close_cause()` after reaching EOF to recover the reason the stack
/// reported, if any.
pub struct ByteStreamEndpoint {
	rx: mpsc::UnboundedReceiver<StreamEvent>,
	pending: BytesMut,
	close_cause: Option<CloseCause>,
	eof: bool,
}

impl ByteStreamEndpoint {
	pub fn close_cause(&self) -> Option<&CloseCause> {
		self.close_cause.as_ref()
	}
}

impl AsyncRead for ByteStreamEndpoint {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		loop {
			if !self.pending.is_empty() {
				let n = self.pending.len().min(buf.remaining());
				let chunk = self.pending.split_to(n);
				buf.put_slice(&chunk);
				return Poll::Ready(Ok(()));
			}
			if self.eof {
				return Poll::Ready(Ok(()));
			}
			match self.rx.poll_recv(cx) {
				Poll::Ready(Some(StreamEvent::Data(data))) => {
					self.pending.extend_from_slice(&data);
					continue;
				},
				Poll::Ready(Some(StreamEvent::Closed(cause))) => {
					self.close_cause = cause;
					self.eof = true;
					return Poll::Ready(Ok(()));
				},
				Poll::Ready(None) => {
					self.eof = true;
					return Poll::Ready(Ok(()));
				},
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}

/// Stub second application layer (spec §4.I). `on_read` drops bytes since no
/// channel protocol is implemented on top of it; `get()` hands out a
/// [`ChannelHandoffEndpoint`] exactly once, same contract as
/// [`ByteStreamApp::get`].
pub struct ChannelHandoffApp {
	tx: Mutex<Option<oneshot::Sender<Option<CloseCause>>>>,
	rx: Mutex<Option<oneshot::Receiver<Option<CloseCause>>>>,
	read_open: AtomicBool,
}

impl ChannelHandoffApp {
	pub fn new() -> Self {
		let (tx, rx) = oneshot::channel();
		Self {
			tx: Mutex::new(Some(tx)),
			rx: Mutex::new(Some(rx)),
			read_open: AtomicBool::new(true),
		}
	}
}

impl Default for ChannelHandoffApp {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl ApplicationLayer for ChannelHandoffApp {
	type Endpoint = ChannelHandoffEndpoint;

	async fn start(&self) -> Result<(), stackwire_core::StackError> {
		Ok(())
	}

	async fn on_read(&self, data: Bytes) {
		trace!(bytes = data.len(), "channel handoff app: dropping bytes, no channel protocol implemented");
	}

	async fn on_read_closed(&self, cause: Option<CloseCause>) {
		self.read_open.store(false, Ordering::Release);
		if let Some(tx) = self.tx.lock().take() {
			let _ = tx.send(cause);
		}
	}

	fn is_read_open(&self) -> bool {
		self.read_open.load(Ordering::Acquire)
	}

	fn get(&self) -> Self::Endpoint {
		let rx = self.rx.lock().take().expect("endpoint already taken");
		ChannelHandoffEndpoint { rx }
	}
}

/// Resolves once the stack closes, yielding the close cause (`None` for a
/// clean close). Handed to the caller once by [`ChannelHandoffApp::get`].
pub struct ChannelHandoffEndpoint {
	rx: oneshot::Receiver<Option<CloseCause>>,
}

impl ChannelHandoffEndpoint {
	/// Consumes this endpoint, yielding the underlying receiver directly.
	pub fn into_receiver(self) -> oneshot::Receiver<Option<CloseCause>> {
		self.rx
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use stackwire_core::StackError;
	use tokio::io::AsyncReadExt;

	#[tokio::test]
	async fn delivers_bytes_pushed_via_on_read() {
		let app = Arc::new(ByteStreamApp::new());
		let mut endpoint = app.get();

		let pusher = app.clone();
		tokio::spawn(async move {
			pusher.on_read(Bytes::from_static(b"hello ")).await;
			pusher.on_read(Bytes::from_static(b"world")).await;
			pusher.on_read_closed(None).await;
		});

		let mut buf = Vec::new();
		endpoint.read_to_end(&mut buf).await.unwrap();
		assert_eq!(buf, b"hello world");
		assert!(endpoint.close_cause().is_none());
	}

	#[tokio::test]
	async fn surfaces_close_cause_after_eof() {
		let app = Arc::new(ByteStreamApp::new());
		let mut endpoint = app.get();
		app.on_read_closed(Some(CloseCause::new(StackError::Closed))).await;

		let mut buf = [0u8; 1];
		let n = endpoint.read(&mut buf).await.unwrap();
		assert_eq!(n, 0);
		assert!(matches!(
			endpoint.close_cause().map(|c| c.primary.as_ref()),
			Some(StackError::Closed)
		));

		// reading again past EOF must keep returning 0, not hang
		let n = endpoint.read(&mut buf).await.unwrap();
		assert_eq!(n, 0);
	}

	#[tokio::test]
	#[should_panic(expected = "endpoint already taken")]
	async fn get_panics_on_second_call() {
		let app = ByteStreamApp::new();
		let _first = app.get();
		let _second = app.get();
	}

	#[tokio::test]
	async fn channel_handoff_resolves_with_close_cause() {
		let app = Arc::new(ChannelHandoffApp::new());
		let endpoint = app.get();

		let closer = app.clone();
		tokio::spawn(async move {
			closer.on_read_closed(Some(CloseCause::new(StackError::Closed))).await;
		});

		let cause = endpoint.into_receiver().await.unwrap();
		assert!(matches!(cause.as_ref().map(|c| c.primary.as_ref()), Some(StackError::Closed)));
	}

	#[tokio::test]
	#[should_panic(expected = "endpoint already taken")]
	async fn channel_handoff_get_panics_on_second_call() {
		let app = ChannelHandoffApp::new();
		let _first = app.get();
		let _second = app.get();
	}
}
