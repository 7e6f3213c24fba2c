//! The two half-open flags every layer carries (spec §3 "Layer state").

use std::sync::atomic::{AtomicBool, Ordering};

pub struct HalfOpenState {
	send_open: AtomicBool,
	read_open: AtomicBool,
}

impl Default for HalfOpenState {
	fn default() -> Self {
		Self::new()
	}
}

impl HalfOpenState {
	pub fn new() -> Self {
		Self { send_open: AtomicBool::new(true), read_open: AtomicBool::new(true) }
	}

	pub fn is_send_open(&self) -> bool {
		self.send_open.load(Ordering::Acquire)
	}

	pub fn is_read_open(&self) -> bool {
		self.read_open.load(Ordering::Acquire)
	}

	/// Marks the send side closed. Returns `true` the first time this
	/// transitions (idempotent on repeated calls).
	pub fn close_send(&self) -> bool {
		self.send_open.swap(false, Ordering::AcqRel)
	}

	/// Marks the receive side closed. Returns `true` the first time this
	/// transitions.
	pub fn close_read(&self) -> bool {
		self.read_open.swap(false, Ordering::AcqRel)
	}

	pub fn is_fully_closed(&self) -> bool {
		!self.is_send_open() && !self.is_read_open()
	}
}
