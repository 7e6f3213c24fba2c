//! The layer capability set and the index-addressed neighbor handle that
//! layers use to talk to each other (spec §4.E, §9 redesign note: "address
//! neighbors by index; the stack owns all layers").

use crate::stack::StackCore;
use async_trait::async_trait;
use bytes::Bytes;
use stackwire_core::CloseCause;
use std::sync::Weak;

/// One bidirectional transform in a stack: the network layer, or a filter.
/// The application layer is a distinct concept (spec component I) reached
/// through [`NeighborHandle`] rather than stored in the same collection.
#[async_trait]
pub trait Layer: Send + Sync {
	/// Called once, network-to-application order, before any data flows.
	/// `io` is this layer's handle to its neighbors, valid for the layer's
	/// lifetime.
	async fn start(&self, io: NeighborHandle) -> Result<(), stackwire_core::StackError>;

	/// Bytes arriving from the transport-ward neighbor.
	async fn accept_recv(&self, data: Bytes);

	/// Bytes arriving from the application-ward neighbor (or the endpoint
	/// itself, for the outermost filter).
	async fn accept_send(&self, data: Bytes) -> Result<(), stackwire_core::StackError>;

	/// `doCloseSend` traveling down from the application side, carrying the
	/// close cause if the initiator supplied one.
	async fn accept_close_send(&self, cause: Option<CloseCause>);

	/// `onRecvClosed` traveling up from the network side.
	async fn accept_recv_closed(&self, cause: Option<CloseCause>);

	fn is_send_open(&self) -> bool;
	fn is_read_open(&self) -> bool;
}

/// A layer's view of its neighbors, addressed by index into the owning
/// stack rather than by direct reference, so layers never hold a strong
/// cycle back to the stack that owns them.
#[derive(Clone)]
pub struct NeighborHandle {
	pub(crate) core: Weak<StackCore>,
	pub(crate) index: usize,
}

impl NeighborHandle {
	pub fn name(&self) -> Option<std::sync::Arc<str>> {
		self.core.upgrade().and_then(|c| c.name.clone())
	}

	/// Push bytes to the transport-ward neighbor (`doSend` continuing
	/// downward).
	pub async fn send_down(&self, data: Bytes) -> Result<(), stackwire_core::StackError> {
		let core = self.core.upgrade().ok_or(stackwire_core::StackError::Closed)?;
		if self.index == 0 {
			return Err(stackwire_core::StackError::Closed);
		}
		core.layers[self.index - 1].accept_send(data).await
	}

	/// Forward bytes to the application-ward neighbor, or the application
	/// layer itself if this is the outermost filter.
	pub async fn forward_up(&self, data: Bytes) {
		let Some(core) = self.core.upgrade() else { return };
		if self.index + 1 < core.layers.len() {
			core.layers[self.index + 1].accept_recv(data).await;
		} else {
			core.app.on_read(data).await;
		}
	}

	/// Propagate `doCloseSend` further down.
	pub async fn close_send_down(&self, cause: Option<CloseCause>) {
		let Some(core) = self.core.upgrade() else { return };
		if self.index > 0 {
			core.layers[self.index - 1].accept_close_send(cause).await;
		}
	}

	/// Propagate `onRecvClosed` further up.
	pub async fn close_recv_up(&self, cause: Option<CloseCause>) {
		let Some(core) = self.core.upgrade() else { return };
		if self.index + 1 < core.layers.len() {
			core.layers[self.index + 1].accept_recv_closed(cause).await;
		} else {
			core.app.on_read_closed(cause).await;
		}
	}
}
