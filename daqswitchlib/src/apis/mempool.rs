//! The Mempool pre-allocates every packet buffer the switch will ever use
//!
//! Buffers are handed out to `Mbuf`s and come back when the `Mbuf` is dropped.
//! The free list is a crossbeam `ArrayQueue`, so any core can allocate or free without a lock.

use crossbeam::queue::ArrayQueue;
use std::{
	fmt,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use super::MemoryError;

pub struct Mempool {
	name: String,
	free: ArrayQueue<Vec<u8>>,
	capacity: usize,
	buf_size: usize,
	alloc_failed: AtomicU64,
}

impl Mempool {
	pub const RX_MBUF_DATA_SIZE: usize = 2048;
	pub const NUM_MBUFS: usize = 32767; // 2^15 - 1

	pub fn new(name: &str, n_bufs: usize, buf_size: usize) -> Result<Arc<Self>, MemoryError> {
		if n_bufs == 0 || buf_size == 0 {
			log::error!("mempool {}: invalid size {} x {}", name, n_bufs, buf_size);
			return Err(MemoryError::Invalid);
		}
		let free = ArrayQueue::new(n_bufs);
		for _ in 0..n_bufs {
			// the queue was sized for exactly n_bufs entries
			let _ = free.push(Vec::with_capacity(buf_size));
		}
		log::info!("created mempool: {} ({} buffers of {} bytes)", name, n_bufs, buf_size);
		Ok(Arc::new(Self {
			name: name.to_owned(),
			free,
			capacity: n_bufs,
			buf_size,
			alloc_failed: AtomicU64::new(0),
		}))
	}

	/// Take a cleared buffer from the pool
	#[inline]
	pub(crate) fn get(&self) -> Option<Vec<u8>> {
		match self.free.pop() {
			Some(buf) => Some(buf),
			None => {
				self.alloc_failed.fetch_add(1, Ordering::Relaxed);
				None
			}
		}
	}

	/// Return a buffer to the pool
	#[inline]
	pub(crate) fn put(&self, mut buf: Vec<u8>) {
		buf.clear();
		// the pool never holds more buffers than it created
		let _ = self.free.push(buf);
	}

	/// Returns the name of the mempool
	#[inline]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[inline]
	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Largest frame a buffer can hold
	#[inline]
	pub fn buf_size(&self) -> usize {
		self.buf_size
	}

	/// Number of buffers currently held by `Mbuf`s
	#[inline]
	pub fn in_use(&self) -> usize {
		self.capacity - self.free.len()
	}

	#[inline]
	pub fn available(&self) -> usize {
		self.free.len()
	}

	pub fn alloc_failed(&self) -> u64 {
		self.alloc_failed.load(Ordering::Relaxed)
	}
}

impl fmt::Debug for Mempool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct(&self.name)
			.field("capacity", &self.capacity)
			.field("buf size", &self.buf_size)
			.field("in use", &self.in_use())
			.field("alloc failed", &self.alloc_failed())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_empty_pool() {
		assert!(matches!(Mempool::new("empty", 0, 2048), Err(MemoryError::Invalid)));
	}

	#[test]
	fn counts_buffers_in_use() {
		let mp = Mempool::new("count", 4, 64).unwrap();
		let a = mp.get().unwrap();
		let b = mp.get().unwrap();
		assert_eq!(mp.in_use(), 2);
		mp.put(a);
		mp.put(b);
		assert_eq!(mp.in_use(), 0);
		assert_eq!(mp.available(), 4);
	}

	#[test]
	fn exhausted_pool_counts_failures() {
		let mp = Mempool::new("tiny", 1, 64).unwrap();
		let buf = mp.get().unwrap();
		assert!(mp.get().is_none());
		assert_eq!(mp.alloc_failed(), 1);
		mp.put(buf);
		assert!(mp.get().is_some());
	}
}
