//! Network layer: adapts a transport pair to the bottom of a stack (spec
//! §4.D). Two variants sharing the same [`Layer`] contract.

use crate::layer::{Layer, NeighborHandle};
use async_trait::async_trait;
use bytes::Bytes;
use stackwire_core::{BufferPool, CloseCause, StackError};
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;
use tracing::{trace, warn};

use crate::state::HalfOpenState;

const READ_CHUNK: usize = 64 * 1024;

fn synthesize(cause: Option<CloseCause>) -> CloseCause {
	cause.unwrap_or_else(|| CloseCause::new(StackError::Closed))
}

/// BIO network layer: a dedicated reader task blocks on the source; writes
/// go straight to the sink, awaiting as needed (spec: "a dedicated reader
/// task pulls bytes from the source... a writer submits outbound buffers
/// directly to the sink, blocking as needed"). Grounded on the teacher's
/// generic split-then-pump idiom (`agent-core::copy::BufferedSplitter`).
pub struct BioNetwork<S> {
	state: HalfOpenState,
	write_half: AsyncMutex<Option<WriteHalf<S>>>,
	read_half: AsyncMutex<Option<ReadHalf<S>>>,
	io: OnceLock<NeighborHandle>,
	reader_task: AsyncMutex<Option<AbortHandle>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> BioNetwork<S> {
	pub fn new(stream: S) -> Self {
		let (r, w) = tokio::io::split(stream);
		Self {
			state: HalfOpenState::new(),
			write_half: AsyncMutex::new(Some(w)),
			read_half: AsyncMutex::new(Some(r)),
			io: OnceLock::new(),
			reader_task: AsyncMutex::new(None),
		}
	}
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Layer for BioNetwork<S> {
	async fn start(&self, io: NeighborHandle) -> Result<(), StackError> {
		let mut guard = self.read_half.lock().await;
		let mut read_half = guard.take().expect("BioNetwork::start called once");
		drop(guard);
		let _ = self.io.set(io.clone());

		let handle = tokio::spawn(async move {
			let mut buf = vec![0u8; READ_CHUNK];
			loop {
				match read_half.read(&mut buf).await {
					Ok(0) => {
						trace!("bio network: read EOF");
						io.close_recv_up(None).await;
						break;
					},
					Ok(n) => {
						io.forward_up(Bytes::copy_from_slice(&buf[..n])).await;
					},
					Err(e) => {
						warn!(error = %e, "bio network: read error");
						io.close_recv_up(Some(CloseCause::new(StackError::Transport(e)))).await;
						break;
					},
				}
			}
		});
		*self.reader_task.lock().await = Some(handle.abort_handle());
		Ok(())
	}

	async fn accept_recv(&self, _data: Bytes) {
		debug_assert!(false, "network layer has no lower neighbor to receive from");
	}

	async fn accept_send(&self, data: Bytes) -> Result<(), StackError> {
		if !self.state.is_send_open() {
			return Err(StackError::Closed);
		}
		let mut guard = self.write_half.lock().await;
		match guard.as_mut() {
			Some(w) => w.write_all(&data).await.map_err(StackError::Transport),
			None => Err(StackError::Closed),
		}
	}

	async fn accept_close_send(&self, cause: Option<CloseCause>) {
		if self.state.close_send() {
			let mut guard = self.write_half.lock().await;
			if let Some(mut w) = guard.take() {
				let _ = w.shutdown().await;
			}
		}
		if self.state.close_read() {
			if let Some(task) = self.reader_task.lock().await.take() {
				task.abort();
			}
			if let Some(io) = self.io.get() {
				io.close_recv_up(Some(synthesize(cause))).await;
			}
		}
	}

	async fn accept_recv_closed(&self, _cause: Option<CloseCause>) {
		self.state.close_read();
	}

	fn is_send_open(&self) -> bool {
		self.state.is_send_open()
	}

	fn is_read_open(&self) -> bool {
		self.state.is_read_open()
	}
}

/// NIO network layer: registers with the hub's worker pool instead of
/// spawning a dedicated task of its own; reads land in a pooled buffer, and
/// outbound writes queue up behind a notify-driven drain loop (spec: "on
/// write ready it drains queued outbound buffers; when fully drained, it
/// clears write interest" — modeled here with a `Notify` standing in for
/// the readiness bit, since tokio's own reactor already multiplexes the
/// raw fd).
pub struct NioNetwork<S> {
	state: HalfOpenState,
	write_half: AsyncMutex<Option<WriteHalf<S>>>,
	read_half: AsyncMutex<Option<ReadHalf<S>>>,
	pool: Arc<BufferPool>,
	outbound: Arc<AsyncMutex<VecDeque<Bytes>>>,
	notify: Arc<tokio::sync::Notify>,
	io: OnceLock<NeighborHandle>,
	hub: Arc<stackwire_io::Hub>,
	handle: OnceLock<stackwire_io::hub::Handle>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> NioNetwork<S> {
	pub fn new(stream: S, hub: Arc<stackwire_io::Hub>, pool: Arc<BufferPool>) -> Self {
		let (r, w) = tokio::io::split(stream);
		Self {
			state: HalfOpenState::new(),
			write_half: AsyncMutex::new(Some(w)),
			read_half: AsyncMutex::new(Some(r)),
			pool,
			outbound: Arc::new(AsyncMutex::new(VecDeque::new())),
			notify: Arc::new(tokio::sync::Notify::new()),
			io: OnceLock::new(),
			hub,
			handle: OnceLock::new(),
		}
	}
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Layer for NioNetwork<S> {
	async fn start(&self, io: NeighborHandle) -> Result<(), StackError> {
		let _ = self.io.set(io.clone());

		let reg = self
			.hub
			.register(std::sync::Arc::new(|_: stackwire_io::Interests| {}), stackwire_io::Interests::READ)
			.map_err(|_| StackError::Closed)?;
		let _ = self.handle.set(reg);

		// Reader: dispatched through the hub's bounded worker pool.
		let mut read_half = self.read_half.lock().await.take().expect("start called once");
		let pool = self.pool.clone();
		let reader_io = io.clone();
		self.hub.execute(async move {
			let mut buf = pool.acquire(READ_CHUNK);
			buf.resize(READ_CHUNK, 0);
			loop {
				match read_half.read(&mut buf).await {
					Ok(0) => {
						reader_io.close_recv_up(None).await;
						break;
					},
					Ok(n) => {
						reader_io.forward_up(Bytes::copy_from_slice(&buf[..n])).await;
					},
					Err(e) => {
						reader_io
							.close_recv_up(Some(CloseCause::new(StackError::Transport(e))))
							.await;
						break;
					},
				}
			}
			pool.release(buf);
		});

		// Writer: drains the outbound queue whenever notified.
		let mut write_half = self.write_half.lock().await.take().expect("start called once");
		let notify = self.notify.clone();
		let outbound = self.outbound.clone();
		self.hub.execute(async move {
			loop {
				notify.notified().await;
				loop {
					let next = outbound.lock().await.pop_front();
					match next {
						Some(chunk) => {
							if write_half.write_all(&chunk).await.is_err() {
								return;
							}
						},
						None => break,
					}
				}
			}
		});

		Ok(())
	}

	async fn accept_recv(&self, _data: Bytes) {
		debug_assert!(false, "network layer has no lower neighbor to receive from");
	}

	async fn accept_send(&self, data: Bytes) -> Result<(), StackError> {
		if !self.state.is_send_open() {
			return Err(StackError::Closed);
		}
		self.outbound.lock().await.push_back(data);
		self.notify.notify_one();
		Ok(())
	}

	async fn accept_close_send(&self, cause: Option<CloseCause>) {
		if self.state.close_send() {
			self.notify.notify_one();
		}
		if self.state.close_read() {
			if let Some(h) = self.handle.get() {
				self.hub.deregister(*h);
			}
			if let Some(io) = self.io.get() {
				io.close_recv_up(Some(synthesize(cause))).await;
			}
		}
	}

	async fn accept_recv_closed(&self, _cause: Option<CloseCause>) {
		self.state.close_read();
	}

	fn is_send_open(&self) -> bool {
		self.state.is_send_open()
	}

	fn is_read_open(&self) -> bool {
		self.state.is_read_open()
	}
}
