//! Per-port table of data flow slots
//!
//! Every port owns `MAX_DATA_FLOWS` slots. A slot binds a (peer, sink) pair to one software ring
//! of that port and is identified by its index, which is also the low bits of the flow director
//! id of the filters steering packets into it.
//!
//! The classification core is the only writer of slot records. The transmit cores only look at
//! the per-port `active` and `request` masks, published with release and read with acquire
//! ordering, and stamp the last time they moved packets of a slot.
//!
//! Slot lifecycle:
//! 	Free -> Active       allocate_slot
//! 	Active -> Draining   begin_drain, the steering filters are removed by the caller
//! 	Draining -> Free     release_slot, once the slot's ring is empty
//! An explicit release may skip the draining state.

use crossbeam::{sync::ShardedLock, utils::CachePadded};
use std::{
	sync::atomic::{AtomicU64, Ordering},
	time::{Duration, Instant},
};
use thiserror::Error;

use crate::apis::FdirFilter;

pub const MAX_DATA_FLOWS: usize = 64;
/// Sink id of upstream (request) flows
pub const SINK_ID_REQUEST: u32 = 0xffff_ffff;

#[derive(Error, Debug, PartialEq)]
pub enum FlowError {
	#[error("no free data flow slot on port {}", _0)]
	Exhausted(u16),
	#[error("no such data flow")]
	NotFound,
	#[error("port {} is out of range", _0)]
	NoPort(u16),
	#[error("slot {} of port {} is not in use", _1, _0)]
	NotInUse(u16, usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
	Free,
	Active,
	Draining,
}

impl Default for SlotState {
	fn default() -> Self {
		SlotState::Free
	}
}

/// A steering filter feeding a slot, and the port it is installed on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SteeringFilter {
	pub port: u16,
	pub filter: FdirFilter,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataFlow {
	pub state: SlotState,
	pub req_flow: bool,
	pub dest_ip: u32,
	pub sink_id: u32,
	pub filters: Vec<SteeringFilter>,
}

pub struct FlowTable {
	slots: ShardedLock<Vec<Vec<DataFlow>>>,
	active: Vec<CachePadded<AtomicU64>>,
	request: Vec<CachePadded<AtomicU64>>,
	last_seen: Vec<Vec<AtomicU64>>,
	epoch: Instant,
}

impl FlowTable {
	pub fn new(nb_ports: u16) -> Self {
		let n = nb_ports as usize;
		Self {
			slots: ShardedLock::new(vec![vec![DataFlow::default(); MAX_DATA_FLOWS]; n]),
			active: (0..n).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
			request: (0..n).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
			last_seen: (0..n)
				.map(|_| (0..MAX_DATA_FLOWS).map(|_| AtomicU64::new(0)).collect())
				.collect(),
			epoch: Instant::now(),
		}
	}

	#[inline]
	pub fn nb_ports(&self) -> u16 {
		self.active.len() as u16
	}

	#[inline]
	fn check_port(&self, port: u16) -> Result<usize, FlowError> {
		if (port as usize) < self.active.len() {
			Ok(port as usize)
		} else {
			Err(FlowError::NoPort(port))
		}
	}

	#[inline]
	fn stamp(&self, now: Instant) -> u64 {
		now.saturating_duration_since(self.epoch).as_micros() as u64
	}

	/// Active slot bound to (peer, sink) on `port`
	pub fn find_slot(&self, port: u16, peer: u32, sink_id: u32) -> Result<usize, FlowError> {
		let p = self.check_port(port)?;
		let slots = match self.slots.read() {
			Ok(s) => s,
			Err(p_err) => p_err.into_inner(),
		};
		slots[p]
			.iter()
			.position(|f| f.state == SlotState::Active && f.dest_ip == peer && f.sink_id == sink_id)
			.ok_or(FlowError::NotFound)
	}

	/// Bind the first free slot of `port` to (peer, sink) and publish it to the transmit core
	pub fn allocate_slot(
		&self,
		port: u16,
		peer: u32,
		sink_id: u32,
		is_request: bool,
		now: Instant,
	) -> Result<usize, FlowError> {
		let p = self.check_port(port)?;
		let mut slots = match self.slots.write() {
			Ok(s) => s,
			Err(p_err) => p_err.into_inner(),
		};
		let slot = slots[p]
			.iter()
			.position(|f| f.state == SlotState::Free)
			.ok_or(FlowError::Exhausted(port))?;
		slots[p][slot] = DataFlow {
			state: SlotState::Active,
			req_flow: is_request,
			dest_ip: peer,
			sink_id,
			filters: Vec::new(),
		};
		drop(slots);

		self.last_seen[p][slot].store(self.stamp(now), Ordering::Relaxed);
		let bit = 1u64 << slot;
		if is_request {
			self.request[p].fetch_or(bit, Ordering::Release);
		} else {
			self.request[p].fetch_and(!bit, Ordering::Release);
		}
		self.active[p].fetch_or(bit, Ordering::Release);
		Ok(slot)
	}

	/// Remember a filter steering packets into the slot
	pub fn add_filter(&self, port: u16, slot: usize, filter: SteeringFilter) -> Result<(), FlowError> {
		let p = self.check_port(port)?;
		let mut slots = match self.slots.write() {
			Ok(s) => s,
			Err(p_err) => p_err.into_inner(),
		};
		let flow = slots[p].get_mut(slot).ok_or(FlowError::NotInUse(port, slot))?;
		if flow.state == SlotState::Free {
			return Err(FlowError::NotInUse(port, slot));
		}
		if !flow.filters.contains(&filter) {
			flow.filters.push(filter);
		}
		Ok(())
	}

	pub fn has_filter(&self, port: u16, slot: usize, filter: &SteeringFilter) -> bool {
		let slots = match self.slots.read() {
			Ok(s) => s,
			Err(p_err) => p_err.into_inner(),
		};
		slots
			.get(port as usize)
			.and_then(|s| s.get(slot))
			.map(|f| f.filters.contains(filter))
			.unwrap_or(false)
	}

	/// Stop steering new packets into the slot
	///
	/// The slot stays active, so the transmit core keeps draining its ring.
	/// Returns the filters the caller has to remove from the ports.
	pub fn begin_drain(&self, port: u16, slot: usize) -> Result<Vec<SteeringFilter>, FlowError> {
		let p = self.check_port(port)?;
		let mut slots = match self.slots.write() {
			Ok(s) => s,
			Err(p_err) => p_err.into_inner(),
		};
		let flow = slots[p].get_mut(slot).ok_or(FlowError::NotInUse(port, slot))?;
		if flow.state != SlotState::Active {
			return Err(FlowError::NotInUse(port, slot));
		}
		flow.state = SlotState::Draining;
		Ok(flow.filters.drain(..).collect())
	}

	/// Free the slot and stop the transmit core polling its ring
	///
	/// Returns the released record, filters still attached to it have to be removed by the caller.
	pub fn release_slot(&self, port: u16, slot: usize) -> Result<DataFlow, FlowError> {
		let p = self.check_port(port)?;
		let mut slots = match self.slots.write() {
			Ok(s) => s,
			Err(p_err) => p_err.into_inner(),
		};
		let flow = slots[p].get_mut(slot).ok_or(FlowError::NotInUse(port, slot))?;
		if flow.state == SlotState::Free {
			return Err(FlowError::NotInUse(port, slot));
		}
		let released = std::mem::take(flow);
		drop(slots);

		let bit = 1u64 << slot;
		self.active[p].fetch_and(!bit, Ordering::Release);
		self.request[p].fetch_and(!bit, Ordering::Release);
		Ok(released)
	}

	pub fn state(&self, port: u16, slot: usize) -> SlotState {
		let slots = match self.slots.read() {
			Ok(s) => s,
			Err(p_err) => p_err.into_inner(),
		};
		slots
			.get(port as usize)
			.and_then(|s| s.get(slot))
			.map(|f| f.state)
			.unwrap_or(SlotState::Free)
	}

	/// Bitmask of the slots whose rings the transmit core of `port` polls
	#[inline]
	pub fn active_flows(&self, port: u16) -> u64 {
		self.active
			.get(port as usize)
			.map(|a| a.load(Ordering::Acquire))
			.unwrap_or(0)
	}

	#[inline]
	pub fn request_flows(&self, port: u16) -> u64 {
		self.request
			.get(port as usize)
			.map(|r| r.load(Ordering::Acquire))
			.unwrap_or(0)
	}

	#[inline]
	pub fn is_request(&self, port: u16, slot: usize) -> bool {
		if slot >= MAX_DATA_FLOWS {
			return false;
		}
		self.request_flows(port) & (1u64 << slot) != 0
	}

	/// Record activity on a slot
	#[inline]
	pub fn touch(&self, port: u16, slot: usize, now: Instant) {
		if let Some(s) = self.last_seen.get(port as usize).and_then(|s| s.get(slot)) {
			s.store(self.stamp(now), Ordering::Relaxed);
		}
	}

	pub fn idle_for(&self, port: u16, slot: usize, now: Instant) -> Duration {
		let last = self
			.last_seen
			.get(port as usize)
			.and_then(|s| s.get(slot))
			.map(|s| s.load(Ordering::Relaxed))
			.unwrap_or(0);
		Duration::from_micros(self.stamp(now).saturating_sub(last))
	}

	/// Copy of every slot in use, as (port, slot, record)
	pub fn snapshot(&self) -> Vec<(u16, usize, DataFlow)> {
		let slots = match self.slots.read() {
			Ok(s) => s,
			Err(p_err) => p_err.into_inner(),
		};
		slots
			.iter()
			.enumerate()
			.flat_map(|(port, flows)| {
				flows
					.iter()
					.enumerate()
					.filter(|(_, f)| f.state != SlotState::Free)
					.map(move |(slot, f)| (port as u16, slot, f.clone()))
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allocate_publishes_masks() {
		let ft = FlowTable::new(2);
		let now = Instant::now();
		let down = ft.allocate_slot(0, 0x0a00_0001, 42, false, now).unwrap();
		let up = ft.allocate_slot(1, 0x1401_0701, SINK_ID_REQUEST, true, now).unwrap();
		assert_eq!(down, 0);
		assert_eq!(up, 0);
		assert_eq!(ft.active_flows(0), 1);
		assert_eq!(ft.active_flows(1), 1);
		assert!(!ft.is_request(0, down));
		assert!(ft.is_request(1, up));
		assert_eq!(ft.find_slot(0, 0x0a00_0001, 42), Ok(0));
		assert_eq!(ft.find_slot(0, 0x0a00_0001, 43), Err(FlowError::NotFound));
	}

	#[test]
	fn exhaustion_keeps_existing_slots() {
		let ft = FlowTable::new(1);
		let now = Instant::now();
		for sink in 0..MAX_DATA_FLOWS as u32 {
			ft.allocate_slot(0, 1, sink, false, now).unwrap();
		}
		assert_eq!(ft.active_flows(0), u64::MAX);
		assert_eq!(ft.allocate_slot(0, 1, 999, false, now), Err(FlowError::Exhausted(0)));
		assert_eq!(ft.active_flows(0), u64::MAX);
		assert_eq!(ft.find_slot(0, 1, 63), Ok(63));
	}

	#[test]
	fn slots_past_the_table_are_never_requests() {
		let ft = FlowTable::new(1);
		let now = Instant::now();
		for peer in 0..MAX_DATA_FLOWS as u32 {
			ft.allocate_slot(0, peer, SINK_ID_REQUEST, true, now).unwrap();
		}
		assert!(ft.is_request(0, MAX_DATA_FLOWS - 1));
		assert!(!ft.is_request(0, MAX_DATA_FLOWS));
		assert!(!ft.is_request(0, 1000));
	}

	#[test]
	fn drain_then_release() {
		let ft = FlowTable::new(1);
		let now = Instant::now();
		let slot = ft.allocate_slot(0, 7, 8, false, now).unwrap();
		let sf = SteeringFilter {
			port: 0,
			filter: FdirFilter::tcp(1, 2, 3, 4),
		};
		ft.add_filter(0, slot, sf).unwrap();
		ft.add_filter(0, slot, sf).unwrap();
		assert!(ft.has_filter(0, slot, &sf));

		let removed = ft.begin_drain(0, slot).unwrap();
		assert_eq!(removed, vec![sf]);
		assert_eq!(ft.state(0, slot), SlotState::Draining);
		// still polled while draining, but no longer found for new packets
		assert_eq!(ft.active_flows(0), 1);
		assert_eq!(ft.find_slot(0, 7, 8), Err(FlowError::NotFound));

		ft.release_slot(0, slot).unwrap();
		assert_eq!(ft.active_flows(0), 0);
		assert_eq!(ft.state(0, slot), SlotState::Free);
		assert_eq!(ft.release_slot(0, slot), Err(FlowError::NotInUse(0, slot)));
	}

	#[test]
	fn idle_time_follows_touch() {
		let ft = FlowTable::new(1);
		let t0 = Instant::now();
		let slot = ft.allocate_slot(0, 7, 8, false, t0).unwrap();
		let later = t0 + Duration::from_secs(5);
		assert!(ft.idle_for(0, slot, later) >= Duration::from_secs(4));
		ft.touch(0, slot, later);
		assert!(ft.idle_for(0, slot, later) < Duration::from_millis(1));
	}

	#[test]
	fn bad_port_is_rejected() {
		let ft = FlowTable::new(1);
		assert_eq!(
			ft.allocate_slot(3, 1, 1, false, Instant::now()),
			Err(FlowError::NoPort(3))
		);
		assert_eq!(ft.active_flows(3), 0);
	}
}
