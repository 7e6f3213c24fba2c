//! Protocol stack composition (spec §4.E): one network layer, an ordered
//! chain of filters, and one application layer.

use crate::app::{AppSink, AppSinkAdapter, ApplicationLayer};
use crate::layer::{Layer, NeighborHandle};
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use stackwire_core::{CloseCause, StackError};
use stackwire_io::{Cancellable, Hub};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub(crate) struct StackCore {
	pub(crate) layers: Vec<Box<dyn Layer>>,
	pub(crate) app: Box<dyn AppSink>,
	pub(crate) name: Option<Arc<str>>,
	idle_watch: SyncMutex<Option<Cancellable>>,
}

impl Drop for StackCore {
	fn drop(&mut self) {
		if let Some(watch) = self.idle_watch.lock().take() {
			watch.cancel();
		}
	}
}

/// A built, running protocol stack. `A::Endpoint` is whatever the
/// application layer chooses to surface to the caller.
pub struct Stack<A: ApplicationLayer> {
	core: Arc<StackCore>,
	app: Arc<A>,
}

impl<A: ApplicationLayer> Stack<A> {
	pub fn name(&self) -> Option<Arc<str>> {
		self.core.name.clone()
	}

	pub fn endpoint(&self) -> A::Endpoint {
		self.app.get()
	}

	/// Send bytes down through the filter chain to the transport (spec's
	/// application-initiated `doSend`).
	pub async fn send(&self, data: Bytes) -> Result<(), StackError> {
		self.top().accept_send(data).await
	}

	/// Half-close the send direction; cascades `doCloseSend` down to the
	/// network layer, which also synthesizes the matching upward
	/// `onRecvClosed` on explicit close (spec §4.E: "An initiator that
	/// calls close on the stack performs both").
	pub async fn close_send(&self) {
		self.top().accept_close_send(None).await;
	}

	/// Fully close the stack with an explicit cause.
	pub async fn close(&self, cause: Option<CloseCause>) {
		if let Some(name) = &self.core.name {
			info!(stack = %name, "close requested");
		} else {
			info!("close requested");
		}
		self.top().accept_close_send(cause).await;
	}

	fn top(&self) -> &dyn Layer {
		self.core.layers.last().expect("stack always has a network layer").as_ref()
	}
}

/// `Stack::builder(network).filter(f).filter(f2).named(name).build(app)`.
pub struct StackBuilder {
	network: Box<dyn Layer>,
	filters: Vec<Box<dyn Layer>>,
	name: Option<String>,
	idle_timeout: Option<(Arc<Hub>, Duration)>,
}

impl StackBuilder {
	pub fn on(network: Box<dyn Layer>) -> Self {
		Self { network, filters: Vec::new(), name: None, idle_timeout: None }
	}

	/// Filters are inserted between transport and application in the order
	/// added: the first filter added is closest to the transport.
	pub fn filter(mut self, f: Box<dyn Layer>) -> Self {
		self.filters.push(f);
		self
	}

	pub fn named(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	/// Force the whole stack closed if the transport sits half-open (one
	/// direction closed, the other still open) for longer than `timeout`
	/// (spec §9 Open Question 1, resolved in SPEC_FULL.md §5 as a bounded
	/// idle interval rather than holding a half-open transport forever).
	/// Polled on the hub's scheduled-task facility.
	pub fn idle_timeout(mut self, hub: Arc<Hub>, timeout: Duration) -> Self {
		self.idle_timeout = Some((hub, timeout));
		self
	}

	pub async fn build<A: ApplicationLayer>(self, app: A) -> Result<Stack<A>, StackError> {
		let app = Arc::new(app);
		let mut layers = Vec::with_capacity(1 + self.filters.len());
		layers.push(self.network);
		layers.extend(self.filters);
		let name: Option<Arc<str>> = self.name.map(Into::into);

		let core = Arc::new(StackCore {
			layers,
			app: Box::new(AppSinkAdapter(app.clone())),
			name,
			idle_watch: SyncMutex::new(None),
		});

		if let Some(name) = &core.name {
			debug!(stack = %name, layers = core.layers.len(), "initializing");
		}

		for (i, layer) in core.layers.iter().enumerate() {
			let handle = NeighborHandle { core: Arc::downgrade(&core), index: i };
			if let Err(err) = layer.start(handle).await {
				return Err(fail_partial_start(&core, i, err).await);
			}
		}
		if let Err(err) = core.app.start().await {
			return Err(fail_partial_start(&core, core.layers.len(), err).await);
		}

		if let Some(name) = &core.name {
			info!(stack = %name, "started");
		}

		if let Some((hub, timeout)) = self.idle_timeout {
			*core.idle_watch.lock() = Some(spawn_idle_watch(&core, hub, timeout));
		}

		Ok(Stack { core, app })
	}
}

/// Polls the network layer's half-open state at `timeout/6` (floored at
/// 100ms) and force-closes the stack once it has sat half-open for at least
/// `timeout`.
fn spawn_idle_watch(core: &Arc<StackCore>, hub: Arc<Hub>, timeout: Duration) -> Cancellable {
	let poll_interval = (timeout / 6).max(Duration::from_millis(100));
	let weak_core = Arc::downgrade(core);
	let half_open_since: Arc<SyncMutex<Option<Instant>>> = Arc::new(SyncMutex::new(None));

	hub.schedule_periodic(poll_interval, move || {
		let weak_core = weak_core.clone();
		let half_open_since = half_open_since.clone();
		async move {
			let Some(core) = weak_core.upgrade() else { return };
			let network = core.layers.first().expect("stack always has a network layer");
			if network.is_send_open() == network.is_read_open() {
				*half_open_since.lock() = None;
				return;
			}
			let since = *half_open_since.lock().get_or_insert_with(Instant::now);
			if since.elapsed() < timeout {
				return;
			}
			if let Some(name) = &core.name {
				warn!(stack = %name, ?timeout, "stack idle half-open past timeout, forcing close");
			} else {
				warn!(?timeout, "stack idle half-open past timeout, forcing close");
			}
			let cause = CloseCause::new(StackError::Timeout(timeout));
			core.layers
				.last()
				.expect("stack always has a network layer")
				.accept_close_send(Some(cause))
				.await;
		}
	})
}

fn clone_error(err: &StackError) -> StackError {
	match err {
		StackError::BadMagic { expected, received } => {
			StackError::BadMagic { expected: expected.clone(), received: received.clone() }
		},
		StackError::Refusal(s) => StackError::Refusal(s.clone()),
		StackError::PermanentRefusal(s) => StackError::PermanentRefusal(s.clone()),
		StackError::HandshakeFailure(s) => StackError::HandshakeFailure(s.clone()),
		StackError::ParseError(s) => StackError::ParseError(s.clone()),
		StackError::Closed => StackError::Closed,
		StackError::Timeout(d) => StackError::Timeout(*d),
		StackError::TruncatedStream => StackError::TruncatedStream,
		StackError::Transport(e) => StackError::Transport(std::io::Error::new(e.kind(), e.to_string())),
	}
}

/// `start` failed at position `failed_at` (network=0..N, app=N). Every
/// layer that already started successfully is told `onReadClosed` with the
/// failing cause, then the original error is re-raised to the builder's
/// caller (spec §4.E).
async fn fail_partial_start(core: &Arc<StackCore>, failed_at: usize, err: StackError) -> StackError {
	let cause = CloseCause::new(clone_error(&err));
	warn!(failed_at, %err, "stack start failed, tearing down already-started layers");
	for layer in core.layers[..failed_at].iter() {
		layer.accept_recv_closed(Some(cause.clone())).await;
	}
	err
}
