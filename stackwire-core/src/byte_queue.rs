//! Non-blocking, segment-based byte FIFO (spec §4.A).
//!
//! Bytes are stored as a deque of fixed-size segments. The front segment may
//! have a consumed prefix (tracked by `read_pos`); the back segment is the
//! only one with free capacity. `VecDeque` gives us `pop_front`/`push_back`
//! for free, so "compaction" (spec's term for discarding consumed segments)
//! falls out of `pop_front` instead of a manual array shift. The numeric
//! knobs from spec §4.A (initial capacity 16, shrink-capacity threshold 512,
//! shrink streak 8) are reproduced against `VecDeque`'s own capacity rather
//! than a hand-rolled backing array.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

const INITIAL_CAPACITY: usize = 16;
const SHRINK_CAPACITY_THRESHOLD: usize = 512;
const SHRINK_STREAK: u32 = 8;

/// Queue is empty; a single-byte `get` cannot be satisfied.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("byte queue underflow")]
pub struct Underflow;

pub struct ByteQueue {
	seg_size: usize,
	segments: VecDeque<BytesMut>,
	read_pos: usize,
	len: usize,
	compaction_streak: u32,
}

impl ByteQueue {
	pub fn new(seg_size: usize) -> Self {
		assert!(seg_size > 0, "segment size must be positive");
		Self {
			seg_size,
			segments: VecDeque::with_capacity(INITIAL_CAPACITY),
			read_pos: 0,
			len: 0,
			compaction_streak: 0,
		}
	}

	pub fn segment_size(&self) -> usize {
		self.seg_size
	}

	/// Bytes currently buffered.
	pub fn remaining(&self) -> usize {
		self.len
	}

	/// Like `remaining`, but short-circuits at `limit` (spec: callers that
	/// only care whether "at least N" bytes are available).
	pub fn remaining_limit(&self, limit: usize) -> usize {
		self.len.min(limit)
	}

	pub fn has_remaining(&self, n: usize) -> bool {
		self.len >= n
	}

	fn back_has_room(&self) -> bool {
		matches!(self.segments.back(), Some(s) if s.len() < self.seg_size)
	}

	fn ensure_write_segment(&mut self) {
		if self.back_has_room() {
			return;
		}
		if self.segments.len() == self.segments.capacity() {
			// Array full: grow x2 (spec §4.A).
			let additional = self.segments.capacity().max(1);
			self.segments.reserve(additional);
		}
		self.segments.push_back(BytesMut::with_capacity(self.seg_size));
	}

	/// Drop fully-consumed segments from the front ("compaction"), then
	/// apply the shrink policy.
	fn compact(&mut self) {
		let mut compacted = false;
		while let Some(front) = self.segments.front() {
			if self.read_pos >= front.len() && self.segments.len() > 1 {
				self.segments.pop_front();
				self.read_pos = 0;
				compacted = true;
			} else {
				break;
			}
		}
		if !compacted {
			return;
		}
		let cap = self.segments.capacity();
		if cap >= SHRINK_CAPACITY_THRESHOLD && self.segments.len() < cap / 4 {
			self.compaction_streak += 1;
			if self.compaction_streak >= SHRINK_STREAK {
				self.segments.shrink_to(cap / 2);
				self.compaction_streak = 0;
			}
		} else {
			self.compaction_streak = 0;
		}
	}

	/// Append raw bytes.
	pub fn put(&mut self, mut data: &[u8]) {
		self.len += data.len();
		while !data.is_empty() {
			self.ensure_write_segment();
			let back = self.segments.back_mut().expect("just ensured");
			let space = self.seg_size - back.len();
			let take = space.min(data.len());
			back.put_slice(&data[..take]);
			data = &data[take..];
		}
	}

	pub fn put_byte(&mut self, b: u8) {
		self.put(&[b]);
	}

	/// Append an owned buffer, reusing it whole as a new segment when it is
	/// exactly segment-sized and the queue is currently segment-aligned.
	pub fn put_buffer(&mut self, data: Bytes) {
		if data.len() == self.seg_size && !self.back_has_room() {
			self.len += data.len();
			self.segments.push_back(BytesMut::from(&data[..]));
			return;
		}
		self.put(&data);
	}

	/// Copy without consuming.
	pub fn peek(&self, dst: &mut [u8]) -> usize {
		let mut written = 0;
		let mut skip = self.read_pos;
		for seg in &self.segments {
			if written >= dst.len() {
				break;
			}
			if skip >= seg.len() {
				skip -= seg.len();
				continue;
			}
			let avail = &seg[skip..];
			let take = avail.len().min(dst.len() - written);
			dst[written..written + take].copy_from_slice(&avail[..take]);
			written += take;
			skip = 0;
		}
		written
	}

	/// Copy and consume.
	pub fn get(&mut self, dst: &mut [u8]) -> usize {
		let mut written = 0;
		while written < dst.len() {
			let Some(front) = self.segments.front() else {
				break;
			};
			let avail = front.len() - self.read_pos;
			if avail == 0 {
				break;
			}
			let take = avail.min(dst.len() - written);
			dst[written..written + take]
				.copy_from_slice(&front[self.read_pos..self.read_pos + take]);
			self.read_pos += take;
			written += take;
			self.compact();
		}
		self.len -= written;
		written
	}

	/// Consume and return a single byte, or `Underflow` if empty.
	pub fn get_u8(&mut self) -> Result<u8, Underflow> {
		let mut buf = [0u8; 1];
		if self.get(&mut buf) == 1 {
			Ok(buf[0])
		} else {
			Err(Underflow)
		}
	}

	/// Discard up to `n` bytes; returns the actual number skipped.
	pub fn skip(&mut self, n: usize) -> usize {
		let mut skipped = 0;
		while skipped < n {
			let Some(front) = self.segments.front() else {
				break;
			};
			let avail = front.len() - self.read_pos;
			if avail == 0 {
				break;
			}
			let take = avail.min(n - skipped);
			self.read_pos += take;
			skipped += take;
			self.compact();
		}
		self.len -= skipped;
		skipped
	}

	/// Prepend bytes so the next `get` returns them first.
	pub fn unget(&mut self, data: &[u8]) {
		if data.is_empty() {
			return;
		}
		// Fast path: room in the already-consumed prefix of the front segment.
		if let Some(front) = self.segments.front_mut() {
			if data.len() <= self.read_pos {
				let start = self.read_pos - data.len();
				front[start..self.read_pos].copy_from_slice(data);
				self.read_pos = start;
				self.len += data.len();
				return;
			}
		}
		// Otherwise, push whole new segments onto the front, in reverse
		// chunk order so the logical byte order is preserved.
		let mut chunks: Vec<BytesMut> = data
			.chunks(self.seg_size)
			.map(BytesMut::from)
			.collect();
		while let Some(chunk) = chunks.pop() {
			self.segments.push_front(chunk);
		}
		self.read_pos = 0;
		self.len += data.len();
	}

	/// Drain the whole queue into a freshly allocated `Vec`.
	pub fn to_byte_array(&mut self) -> Vec<u8> {
		let mut out = vec![0u8; self.len];
		let n = self.get(&mut out);
		debug_assert_eq!(n, out.len());
		out
	}
}

/// A `std::io::Read` view over a `ByteQueue`, with bounded mark/reset.
pub struct QueueReader<'q> {
	queue: &'q mut ByteQueue,
	mark: Option<Mark>,
}

struct Mark {
	buf: Vec<u8>,
	limit: usize,
}

impl<'q> QueueReader<'q> {
	pub fn new(queue: &'q mut ByteQueue) -> Self {
		Self { queue, mark: None }
	}

	/// Remember the current position; up to `limit` bytes may be read
	/// before `reset` before the mark is invalidated.
	pub fn mark(&mut self, limit: usize) {
		self.mark = Some(Mark {
			buf: Vec::with_capacity(limit.min(64)),
			limit,
		});
	}

	/// Rewind to the marked position. Fails if the mark was never set or
	/// has since been invalidated by reading past its limit.
	pub fn reset(&mut self) -> Result<(), std::io::Error> {
		match self.mark.take() {
			Some(m) => {
				self.queue.unget(&m.buf);
				Ok(())
			},
			None => Err(std::io::Error::new(
				std::io::ErrorKind::Other,
				"mark invalid or not set",
			)),
		}
	}
}

impl std::io::Read for QueueReader<'_> {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		let n = self.queue.get(buf);
		if let Some(mark) = &mut self.mark {
			if mark.buf.len() + n > mark.limit {
				self.mark = None;
			} else {
				mark.buf.extend_from_slice(&buf[..n]);
			}
		}
		Ok(n)
	}
}

/// A `std::io::Write` view that simply appends to a `ByteQueue`.
pub struct QueueWriter<'q> {
	queue: &'q mut ByteQueue,
}

impl<'q> QueueWriter<'q> {
	pub fn new(queue: &'q mut ByteQueue) -> Self {
		Self { queue }
	}
}

impl std::io::Write for QueueWriter<'_> {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.queue.put(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

/// Reads at most a fixed number of bytes from a queue, irrespective of how
/// much the queue actually holds.
pub struct LimitedReader<'q> {
	inner: QueueReader<'q>,
	remaining: usize,
}

impl<'q> LimitedReader<'q> {
	pub fn new(queue: &'q mut ByteQueue, limit: usize) -> Self {
		Self {
			inner: QueueReader::new(queue),
			remaining: limit,
		}
	}
}

impl std::io::Read for LimitedReader<'_> {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		let cap = self.remaining.min(buf.len());
		let n = self.inner.read(&mut buf[..cap])?;
		self.remaining -= n;
		Ok(n)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::{Read, Write};

	#[test]
	fn put_then_drain_is_identity() {
		let mut q = ByteQueue::new(8);
		q.put(b"Here is some sample data");
		assert_eq!(q.to_byte_array(), b"Here is some sample data");
	}

	#[test]
	fn put_unget_get_round_trips() {
		let mut q = ByteQueue::new(8);
		q.put(b"hello world");
		let mut first = [0u8; 5];
		assert_eq!(q.get(&mut first), 5);
		assert_eq!(&first, b"hello");
		q.unget(b"hello");
		let mut full = [0u8; 11];
		assert_eq!(q.get(&mut full), 11);
		assert_eq!(&full, b"hello world");
	}

	#[test]
	fn remaining_tracks_puts_and_consumption() {
		let mut q = ByteQueue::new(4);
		q.put(b"0123456789");
		assert_eq!(q.remaining(), 10);
		let mut buf = [0u8; 3];
		q.get(&mut buf);
		assert_eq!(q.remaining(), 7);
		q.skip(2);
		assert_eq!(q.remaining(), 5);
	}

	#[test]
	fn get_u8_underflow_on_empty_queue() {
		let mut q = ByteQueue::new(4);
		assert_eq!(q.get_u8(), Err(Underflow));
		q.put_byte(9);
		assert_eq!(q.get_u8(), Ok(9));
		assert_eq!(q.get_u8(), Err(Underflow));
	}

	#[test]
	fn skip_saturates_at_available_bytes() {
		let mut q = ByteQueue::new(4);
		q.put(b"abc");
		assert_eq!(q.skip(100), 3);
		assert_eq!(q.remaining(), 0);
	}

	#[test]
	fn peek_does_not_consume() {
		let mut q = ByteQueue::new(4);
		q.put(b"abcdef");
		let mut buf = [0u8; 3];
		assert_eq!(q.peek(&mut buf), 3);
		assert_eq!(&buf, b"abc");
		assert_eq!(q.remaining(), 6);
	}

	#[test]
	fn spans_multiple_segments() {
		let mut q = ByteQueue::new(4);
		for i in 0..100u8 {
			q.put_byte(i);
		}
		let out = q.to_byte_array();
		assert_eq!(out, (0..100).collect::<Vec<u8>>());
	}

	#[test]
	fn queue_reader_mark_reset() {
		let mut q = ByteQueue::new(4);
		q.put(b"abcdefgh");
		let mut r = QueueReader::new(&mut q);
		let mut b3 = [0u8; 3];
		r.read_exact(&mut b3).unwrap();
		assert_eq!(&b3, b"abc");
		r.mark(10);
		let mut b2 = [0u8; 2];
		r.read_exact(&mut b2).unwrap();
		assert_eq!(&b2, b"de");
		r.reset().unwrap();
		let mut b2again = [0u8; 2];
		r.read_exact(&mut b2again).unwrap();
		assert_eq!(&b2again, b"de");
	}

	#[test]
	fn queue_reader_mark_invalidated_past_limit() {
		let mut q = ByteQueue::new(4);
		q.put(b"abcdefgh");
		let mut r = QueueReader::new(&mut q);
		r.mark(2);
		let mut b3 = [0u8; 3];
		r.read_exact(&mut b3).unwrap();
		assert!(r.reset().is_err());
	}

	#[test]
	fn queue_writer_appends() {
		let mut q = ByteQueue::new(4);
		{
			let mut w = QueueWriter::new(&mut q);
			w.write_all(b"xyz").unwrap();
		}
		assert_eq!(q.to_byte_array(), b"xyz");
	}

	#[test]
	fn limited_reader_caps_reads() {
		let mut q = ByteQueue::new(4);
		q.put(b"0123456789");
		let mut lr = LimitedReader::new(&mut q, 3);
		let mut out = Vec::new();
		lr.read_to_end(&mut out).unwrap();
		assert_eq!(out, b"012");
	}

	#[test]
	fn shrink_policy_reclaims_capacity_after_sustained_drain() {
		let mut q = ByteQueue::new(1);
		// Grow well past the shrink-capacity threshold.
		for i in 0..2000u32 {
			q.put_byte(i as u8);
		}
		let grown_cap = q.segments.capacity();
		assert!(grown_cap >= SHRINK_CAPACITY_THRESHOLD);
		// Drain down to a handful of segments, one byte at a time, so each
		// `get` triggers a compaction.
		let mut one = [0u8; 1];
		while q.remaining() > 4 {
			q.get(&mut one);
		}
		assert!(q.segments.capacity() < grown_cap);
	}
}
