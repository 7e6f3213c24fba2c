//! Ack filter (spec §4.F): rejects peers not speaking this protocol before
//! any secret bits cross the wire.

use crate::layer::{Layer, NeighborHandle};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use stackwire_core::{CloseCause, StackError};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::state::HalfOpenState;

/// `magic` must be non-empty; an empty magic is a configuration error caught
/// at construction rather than deferred to a runtime failure.
pub struct AckFilter {
	magic: Bytes,
	state: HalfOpenState,
	matched: AtomicBool,
	pending: Mutex<BytesMut>,
	io: OnceLock<NeighborHandle>,
}

impl AckFilter {
	pub fn new(magic: impl Into<Bytes>) -> Self {
		let magic = magic.into();
		assert!(!magic.is_empty(), "ack magic must not be empty");
		Self {
			magic,
			state: HalfOpenState::new(),
			matched: AtomicBool::new(false),
			pending: Mutex::new(BytesMut::new()),
			io: OnceLock::new(),
		}
	}

	pub fn default_magic() -> Self {
		Self::new(Bytes::from_static(b"ACK"))
	}

	fn io(&self) -> &NeighborHandle {
		self.io.get().expect("ack filter used before start")
	}
}

#[async_trait]
impl Layer for AckFilter {
	async fn start(&self, io: NeighborHandle) -> Result<(), StackError> {
		// The magic is sent "through the previous hook" so that a caller
		// attempting to doSend before the layer above has started does not
		// race the handshake bytes (spec's re-entrancy note).
		io.send_down(self.magic.clone()).await?;
		let _ = self.io.set(io);
		Ok(())
	}

	async fn accept_recv(&self, data: Bytes) {
		if self.matched.load(Ordering::Acquire) {
			self.io().forward_up(data).await;
			return;
		}

		let mut buf = self.pending.lock().await;
		buf.extend_from_slice(&data);

		let magic_len = self.magic.len();
		if buf.len() < magic_len {
			return;
		}

		if buf[..magic_len] != self.magic[..] {
			let received = buf[..magic_len.min(buf.len())].to_vec();
			drop(buf);
			warn!(?received, expected = ?self.magic, "ack filter: magic mismatch");
			let cause = CloseCause::new(StackError::BadMagic {
				expected: self.magic.to_vec(),
				received,
			});
			self.state.close_send();
			self.state.close_read();
			self.io().close_send_down(Some(cause.clone())).await;
			self.io().close_recv_up(Some(cause)).await;
			return;
		}

		self.matched.store(true, Ordering::Release);
		let overflow = buf.split_off(magic_len);
		drop(buf);
		debug!("ack filter: magic matched");
		if !overflow.is_empty() {
			self.io().forward_up(overflow.freeze()).await;
		}
	}

	async fn accept_send(&self, data: Bytes) -> Result<(), StackError> {
		if !self.state.is_send_open() {
			return Err(StackError::Closed);
		}
		self.io().send_down(data).await
	}

	async fn accept_close_send(&self, cause: Option<CloseCause>) {
		if self.state.close_send() {
			self.io().close_send_down(cause).await;
		}
	}

	async fn accept_recv_closed(&self, cause: Option<CloseCause>) {
		if self.state.close_read() {
			let cause = if self.matched.load(Ordering::Acquire) {
				cause
			} else {
				let received = self.pending.lock().await.to_vec();
				warn!(?received, expected = ?self.magic, "ack filter: closed before magic fully arrived");
				Some(CloseCause::new(StackError::BadMagic { expected: self.magic.to_vec(), received }))
			};
			self.io().close_recv_up(cause).await;
		}
	}

	fn is_send_open(&self) -> bool {
		self.state.is_send_open()
	}

	fn is_read_open(&self) -> bool {
		self.state.is_read_open()
	}
}
