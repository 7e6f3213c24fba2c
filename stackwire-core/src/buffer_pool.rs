//! Fixed-capacity LIFO pool of reusable buffers (spec §4.B).
//!
//! The original describes a pool of *direct* `ByteBuffer`s, rejecting
//! release of buffers that are too small, read-only, or when the pool is
//! full. `bytes::BytesMut` has no read-only variant, so that check has no
//! analogue here; capacity and pool-fullness are preserved.

use bytes::BytesMut;
use parking_lot::Mutex;

pub struct BufferPool {
	default_size: usize,
	max_pooled: usize,
	stack: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
	pub fn new(default_size: usize, max_pooled: usize) -> Self {
		Self {
			default_size,
			max_pooled,
			stack: Mutex::new(Vec::with_capacity(max_pooled)),
		}
	}

	/// Returns a cleared buffer with capacity >= `size`.
	pub fn acquire(&self, size: usize) -> BytesMut {
		let mut stack = self.stack.lock();
		if size <= self.default_size {
			if let Some(mut buf) = stack.pop() {
				buf.clear();
				return buf;
			}
		} else if let Some(pos) = stack.iter().position(|b| b.capacity() >= size) {
			let mut buf = stack.swap_remove(pos);
			buf.clear();
			return buf;
		}
		BytesMut::with_capacity(size.max(self.default_size))
	}

	/// Returns a buffer to the pool. Dropped silently if it's smaller than
	/// the default size or the pool is already full.
	pub fn release(&self, buf: BytesMut) {
		if buf.capacity() < self.default_size {
			return;
		}
		let mut stack = self.stack.lock();
		if stack.len() >= self.max_pooled {
			return;
		}
		stack.push(buf);
	}

	pub fn pooled_count(&self) -> usize {
		self.stack.lock().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn acquire_reuses_released_buffer_lifo() {
		let pool = BufferPool::new(64, 4);
		let a = pool.acquire(32);
		let cap = a.capacity();
		pool.release(a);
		let b = pool.acquire(32);
		assert_eq!(b.capacity(), cap);
		assert_eq!(pool.pooled_count(), 0);
	}

	#[test]
	fn acquire_above_default_scans_for_big_enough_buffer() {
		let pool = BufferPool::new(64, 4);
		pool.release(BytesMut::with_capacity(64));
		pool.release(BytesMut::with_capacity(256));
		let big = pool.acquire(200);
		assert!(big.capacity() >= 200);
		// The remaining pooled buffer should be the smaller one.
		assert_eq!(pool.pooled_count(), 1);
	}

	#[test]
	fn release_drops_undersized_buffer() {
		let pool = BufferPool::new(64, 4);
		pool.release(BytesMut::with_capacity(8));
		assert_eq!(pool.pooled_count(), 0);
	}

	#[test]
	fn release_drops_when_pool_full() {
		let pool = BufferPool::new(8, 1);
		pool.release(BytesMut::with_capacity(8));
		pool.release(BytesMut::with_capacity(8));
		assert_eq!(pool.pooled_count(), 1);
	}

	#[test]
	fn acquire_below_default_allocates_fresh_when_pool_empty() {
		let pool = BufferPool::new(64, 4);
		let buf = pool.acquire(16);
		assert_eq!(buf.capacity(), 64);
	}
}
