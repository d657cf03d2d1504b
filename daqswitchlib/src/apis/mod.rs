//! This module defines the buffer and port structures every datapath core works with
//!
//! Errors related to buffer, pool and port operations

mod mbuf;
mod mempool;
mod port;

pub use mbuf::*;
pub use mempool::*;
pub use port::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
	#[error("pool size or buffer size is invalid")]
	Invalid,
	#[error("not enough memory")]
	NoBuf,
	#[error("buffer error: {}", _0)]
	Buf(BufError),
}

impl From<BufError> for MemoryError {
	fn from(err: BufError) -> Self {
		MemoryError::Buf(err)
	}
}

#[derive(Error, Debug)]
pub enum BufError {
	/// The offset exceeds the buffer length
	#[error("Offset {} exceed the buffer length {}", _0, _1)]
	BadOffset(usize, usize),

	/// The buffer is not resized
	#[error("Buffer is not resized")]
	NotResized,

	/// The struct exceeds the remaining buffer length
	#[error("Struct size {} exceeds the remaining buffer length {}", _0, _1)]
	OutOfBuffer(usize, usize),
}

#[derive(Error, Debug, PartialEq)]
pub enum PortError {
	#[error("No such device: port {}", _0)]
	NoDevice(u16),
	#[error("port {} has no queue {}", _0, _1)]
	NoQueue(u16, u16),
	#[error("invalid port configuration: {}", _0)]
	Invalid(&'static str),
	#[error("port {} is already started", _0)]
	AlreadyStarted(u16),
	#[error("port {} is not started", _0)]
	NotStarted(u16),
	#[error("port {} is not configured", _0)]
	NotConfigured(u16),
	#[error("flow director table of port {} is full", _0)]
	NoSpace(u16),
	#[error("no such flow director filter on port {}", _0)]
	NoFilter(u16),
}
