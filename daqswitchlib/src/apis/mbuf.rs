//! The Mbuf structure owns one received or generated frame
//!
//! Its storage comes from a `Mempool` and goes back there exactly once, when the `Mbuf` is dropped.
//! Moving an `Mbuf` through a ring or a port queue transfers ownership, the bytes are never copied.
//!
//! Besides the frame an `Mbuf` carries the metadata written by the receiving stage:
//! 	the ingress port
//! 	the flow director id, when a hardware filter matched the frame
//! 	the flow key parsed at ingress

use std::{fmt, mem, sync::Arc};

use super::{BufError, MemoryError, Mempool};
use crate::flow::FlowKey;

pub struct Mbuf {
	data: Vec<u8>,
	pool: Arc<Mempool>,
	pub port: u16,
	pub fdir_id: Option<u32>,
	pub flow_key: FlowKey,
}

impl Mbuf {
	pub fn new(mp: &Arc<Mempool>) -> Result<Self, MemoryError> {
		match mp.get() {
			Some(data) => Ok(Self {
				data,
				pool: Arc::clone(mp),
				port: 0,
				fdir_id: None,
				flow_key: FlowKey::default(),
			}),
			None => Err(MemoryError::NoBuf),
		}
	}

	/// Create a new message buffer from a byte array
	#[inline]
	pub fn from_bytes(data: &[u8], mp: &Arc<Mempool>) -> Result<Self, MemoryError> {
		let mut mbuf = Mbuf::new(mp)?;
		if !data.is_empty() {
			mbuf.extend(0, data.len())?;
			mbuf.write_data_slice(0, data)?;
		}
		Ok(mbuf)
	}

	/// Returns amount of data stored in the buffer
	#[inline]
	pub fn data_len(&self) -> usize {
		self.data.len()
	}

	#[inline]
	pub fn data(&self) -> &[u8] {
		&self.data[..]
	}

	#[inline]
	pub fn data_mut(&mut self) -> &mut [u8] {
		&mut self.data[..]
	}

	/// Returns the amount of bytes left in the buffer
	#[inline]
	fn tailroom(&self) -> usize {
		self.pool.buf_size() - self.data.len()
	}

	/// Extends the data buffer at offset `len`
	///
	/// If the offset is not the end of data
	/// data after offset is shifted down to make room
	#[inline]
	pub fn extend(&mut self, offset: usize, len: usize) -> Result<(), BufError> {
		if len == 0 || offset > self.data_len() || len > self.tailroom() {
			return Err(BufError::NotResized);
		}
		let old_len = self.data.len();
		self.data.resize(old_len + len, 0);
		// shift down data to make room
		self.data.copy_within(offset..old_len, offset + len);
		Ok(())
	}

	/// Writes a slice to the data buffer at offset
	///
	/// Before writing to the data buffer, should call `Mbuf::extend` first
	/// to make sure enough space is allocated for the write and data is not
	/// being overridden.
	#[inline]
	pub fn write_data_slice(&mut self, offset: usize, slice: &[u8]) -> Result<(), BufError> {
		if offset > self.data_len() {
			return Err(BufError::BadOffset(offset, self.data_len()));
		}
		if offset + slice.len() > self.data_len() {
			return Err(BufError::OutOfBuffer(slice.len(), self.data_len() - offset));
		}
		self.data[offset..offset + slice.len()].copy_from_slice(slice);
		Ok(())
	}

	/// Allocates a Vec of `Mbuf`s of `len` size.
	///
	/// Either all `len` buffers are allocated or none is.
	pub fn alloc_bulk(len: usize, mp: &Arc<Mempool>) -> Result<Vec<Mbuf>, MemoryError> {
		if mp.available() < len {
			return Err(MemoryError::NoBuf);
		}
		let mut mbufs = Vec::with_capacity(len);
		for _ in 0..len {
			// another core may have raced us to the last buffers,
			// dropping `mbufs` hands the partial batch back
			mbufs.push(Mbuf::new(mp)?);
		}
		Ok(mbufs)
	}

	/// Frees the message buffers in bulk.
	pub fn free_bulk(mbufs: Vec<Mbuf>) {
		drop(mbufs);
	}

	/// The pool the buffer returns to
	#[inline]
	pub fn pool(&self) -> &Arc<Mempool> {
		&self.pool
	}
}

impl fmt::Debug for Mbuf {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct(&format!("mbuf@{:p}", self.data.as_ptr()))
			.field("buf_len", &self.pool.buf_size())
			.field("data_len", &self.data.len())
			.field("port", &self.port)
			.field("fdir_id", &self.fdir_id)
			.finish()
	}
}

impl Drop for Mbuf {
	fn drop(&mut self) {
		self.pool.put(mem::take(&mut self.data));
	}
}
