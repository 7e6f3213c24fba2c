//! The application layer adapter (spec §4.I).

use async_trait::async_trait;
use bytes::Bytes;
use stackwire_core::CloseCause;
use std::sync::Arc;

/// Minimal contract the core consumes from whatever sits above the filter
/// chain.
#[async_trait]
pub trait ApplicationLayer: Send + Sync + 'static {
	/// Whatever the caller wants the stack to surface once it's built: a
	/// byte-oriented handle, or a future for a completed higher-level
	/// session.
	type Endpoint: Send + Sync + 'static;

	async fn start(&self) -> Result<(), stackwire_core::StackError>;
	async fn on_read(&self, data: Bytes);
	async fn on_read_closed(&self, cause: Option<CloseCause>);
	fn is_read_open(&self) -> bool;
	fn get(&self) -> Self::Endpoint;
}

/// Non-generic view of an [`ApplicationLayer`] used internally by
/// [`crate::stack::StackCore`], so the core stack plumbing doesn't need to
/// be generic over the application layer's endpoint type.
#[async_trait]
pub(crate) trait AppSink: Send + Sync {
	async fn start(&self) -> Result<(), stackwire_core::StackError>;
	async fn on_read(&self, data: Bytes);
	async fn on_read_closed(&self, cause: Option<CloseCause>);
	fn is_read_open(&self) -> bool;
}

pub(crate) struct AppSinkAdapter<A: ApplicationLayer>(pub Arc<A>);

#[async_trait]
impl<A: ApplicationLayer> AppSink for AppSinkAdapter<A> {
	async fn start(&self) -> Result<(), stackwire_core::StackError> {
		self.0.start().await
	}
	async fn on_read(&self, data: Bytes) {
		self.0.on_read(data).await
	}
	async fn on_read_closed(&self, cause: Option<CloseCause>) {
		self.0.on_read_closed(cause).await
	}
	fn is_read_open(&self) -> bool {
		self.0.is_read_open()
	}
}
