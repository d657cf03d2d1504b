//! The Nic trait is the only way the datapath talks to the ports
//!
//! `SoftNic` implements it in memory: every queue is a bounded `ArrayQueue` sized by its descriptor
//! count, and a software flow director steers frames matching a perfect filter to the filter's
//! rx queue, tagging them with the filter's id.

use crossbeam::{queue::ArrayQueue, sync::ShardedLock};
use std::{
	collections::HashMap,
	fmt,
	net::Ipv4Addr,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
};

use super::{Mbuf, MemoryError, Mempool, PortError};
use crate::flow::FlowKey;

pub const RX_BURST_MAX: usize = 32;
pub const TX_BURST_MAX: usize = 32;

/// Per port queue and descriptor configuration
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PortConf {
	pub nb_rxq: u16,
	pub nb_txq: u16,
	pub nb_rxd: u16,
	pub nb_txd: u16,
	/// `None` leaves the flow director disabled
	pub fdir_masks: Option<FdirMasks>,
}

impl PortConf {
	pub const RX_DESC_DEFAULT: u16 = 512;
	pub const TX_DESC_DEFAULT: u16 = 512;
}

impl Default for PortConf {
	fn default() -> Self {
		Self {
			nb_rxq: 1,
			nb_txq: 1,
			nb_rxd: Self::RX_DESC_DEFAULT,
			nb_txd: Self::TX_DESC_DEFAULT,
			fdir_masks: None,
		}
	}
}

/// Bits of the tuple a perfect filter compares
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdirMasks {
	pub proto: u8,
	pub src_ip: u32,
	pub dst_ip: u32,
	pub src_port: u16,
	pub dst_port: u16,
}

impl FdirMasks {
	pub const EXACT: FdirMasks = FdirMasks {
		proto: 0xff,
		src_ip: 0xffff_ffff,
		dst_ip: 0xffff_ffff,
		src_port: 0xffff,
		dst_port: 0xffff,
	};

	/// Only the destination address counts, whatever the protocol
	pub const DST_IP: FdirMasks = FdirMasks {
		proto: 0,
		src_ip: 0,
		dst_ip: 0xffff_ffff,
		src_port: 0,
		dst_port: 0,
	};
}

/// Perfect match filter on the IPv4 5-tuple
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FdirFilter {
	pub proto: u8,
	pub src_ip: u32,
	pub src_port: u16,
	pub dst_ip: u32,
	pub dst_port: u16,
}

impl FdirFilter {
	pub fn tcp(src_ip: u32, src_port: u16, dst_ip: u32, dst_port: u16) -> Self {
		Self {
			proto: FlowKey::IPPROTO_TCP,
			src_ip,
			src_port,
			dst_ip,
			dst_port,
		}
	}

	/// The tuple a frame presents to the flow director
	pub fn from_key(key: &FlowKey) -> Self {
		Self {
			proto: key.proto,
			src_ip: key.sip,
			src_port: key.sport,
			dst_ip: key.dip,
			dst_port: key.dport,
		}
	}

	/// Same flow, opposite direction
	pub fn mirror(&self) -> Self {
		Self {
			proto: self.proto,
			src_ip: self.dst_ip,
			src_port: self.dst_port,
			dst_ip: self.src_ip,
			dst_port: self.src_port,
		}
	}

	pub fn masked(&self, m: &FdirMasks) -> Self {
		Self {
			proto: self.proto & m.proto,
			src_ip: self.src_ip & m.src_ip,
			src_port: self.src_port & m.src_port,
			dst_ip: self.dst_ip & m.dst_ip,
			dst_port: self.dst_port & m.dst_port,
		}
	}
}

impl fmt::Display for FdirFilter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}:{} -> {}:{} proto {}",
			Ipv4Addr::from(self.src_ip),
			self.src_port,
			Ipv4Addr::from(self.dst_ip),
			self.dst_port,
			self.proto
		)
	}
}

/// Flow director table counters
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FdirInfo {
	pub free: u32,
	pub add: u64,
	pub remove: u64,
	pub f_add: u64,
	pub f_remove: u64,
	pub collision: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FlowCtrlMode {
	None,
	RxPause,
	TxPause,
	Full,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlowCtrl {
	pub mode: FlowCtrlMode,
	pub pause_time: u16,
	pub autoneg: bool,
}

impl Default for FlowCtrl {
	fn default() -> Self {
		Self {
			mode: FlowCtrlMode::RxPause,
			pause_time: 0x680,
			autoneg: true,
		}
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PortStats {
	pub ipackets: u64,
	pub opackets: u64,
	pub ibytes: u64,
	pub obytes: u64,
	pub imissed: u64,
	pub rx_nombuf: u64,
	pub oerrors: u64,
	pub rx_pause_xon: u64,
	pub rx_pause_xoff: u64,
}

/// The operations the switch needs from a NIC
pub trait Nic: Send + Sync {
	fn nb_ports(&self) -> u16;
	fn socket_id(&self, port: u16) -> Result<u32, PortError>;

	fn configure(&self, port: u16, conf: &PortConf) -> Result<(), PortError>;
	fn start(&self, port: u16) -> Result<(), PortError>;
	fn link_up(&self, port: u16) -> bool;

	/// Append up to `max` received frames to `out`, returns how many were appended
	fn rx_burst(&self, port: u16, queue: u16, out: &mut Vec<Mbuf>, max: usize) -> usize;
	/// Send frames from the front of `pkts`
	///
	/// Sent frames are removed, the rest stay in `pkts` for a retry.
	fn tx_burst(&self, port: u16, queue: u16, pkts: &mut Vec<Mbuf>) -> usize;

	fn add_fdir_filter(
		&self,
		port: u16,
		filter: &FdirFilter,
		fdir_id: u32,
		rx_queue: u16,
	) -> Result<(), PortError>;
	fn remove_fdir_filter(&self, port: u16, filter: &FdirFilter) -> Result<(), PortError>;
	fn fdir_info(&self, port: u16) -> Result<FdirInfo, PortError>;
	fn set_fdir_masks(&self, port: u16, masks: &FdirMasks) -> Result<(), PortError>;

	fn set_queue_rate_limit(&self, port: u16, queue: u16, mbps: u32) -> Result<(), PortError>;
	fn set_flow_ctrl(&self, port: u16, fc: &FlowCtrl) -> Result<(), PortError>;

	fn stats(&self, port: u16) -> Result<PortStats, PortError>;
	fn stats_reset(&self, port: u16) -> Result<(), PortError>;
}

#[derive(Default)]
struct Queues {
	rx: Vec<ArrayQueue<Mbuf>>,
	tx: Vec<ArrayQueue<Mbuf>>,
	rate: Vec<u32>,
}

#[derive(Default)]
struct FdirTable {
	masks: Option<FdirMasks>,
	filters: HashMap<FdirFilter, (u32, u16)>,
	info: FdirInfo,
}

#[derive(Default)]
struct Counters {
	ipackets: AtomicU64,
	opackets: AtomicU64,
	ibytes: AtomicU64,
	obytes: AtomicU64,
	imissed: AtomicU64,
	rx_nombuf: AtomicU64,
}

struct SoftPort {
	socket: u32,
	queues: ShardedLock<Queues>,
	fdir: ShardedLock<FdirTable>,
	flow_ctrl: ShardedLock<Option<FlowCtrl>>,
	started: AtomicBool,
	counters: Counters,
}

/// In-memory NIC with a software flow director
pub struct SoftNic {
	ports: Vec<SoftPort>,
	pool: Arc<Mempool>,
}

impl SoftNic {
	/// Perfect filters one port can hold
	pub const FDIR_MAX_FILTERS: usize = 8192;

	pub fn new(sockets: &[u32], pool: Arc<Mempool>) -> Self {
		let ports = sockets
			.iter()
			.map(|&socket| SoftPort {
				socket,
				queues: ShardedLock::new(Queues::default()),
				fdir: ShardedLock::new(FdirTable::default()),
				flow_ctrl: ShardedLock::new(None),
				started: AtomicBool::new(false),
				counters: Counters::default(),
			})
			.collect();
		Self { ports, pool }
	}

	#[inline]
	fn port(&self, port: u16) -> Result<&SoftPort, PortError> {
		self.ports.get(port as usize).ok_or(PortError::NoDevice(port))
	}

	pub fn pool(&self) -> &Arc<Mempool> {
		&self.pool
	}

	/// Deliver a frame to `port` as if it came from the wire
	///
	/// Returns the rx queue the frame was steered to.
	pub fn inject(&self, port: u16, frame: &[u8]) -> Result<u16, PortError> {
		let p = self.port(port)?;
		if !p.started.load(Ordering::Acquire) {
			return Err(PortError::NotStarted(port));
		}
		let mut mbuf = match Mbuf::from_bytes(frame, &self.pool) {
			Ok(m) => m,
			Err(MemoryError::NoBuf) => {
				p.counters.rx_nombuf.fetch_add(1, Ordering::Relaxed);
				return Err(PortError::NoSpace(port));
			}
			Err(_) => return Err(PortError::Invalid("frame does not fit into a buffer")),
		};
		mbuf.port = port;

		let (queue, fdir_id) = {
			let fdir = match p.fdir.read() {
				Ok(f) => f,
				Err(p_err) => p_err.into_inner(),
			};
			match fdir.masks {
				Some(m) if !fdir.filters.is_empty() => {
					let tuple = FdirFilter::from_key(&FlowKey::parse(frame)).masked(&m);
					match fdir.filters.get(&tuple) {
						Some(&(id, queue)) => (queue, Some(id)),
						None => (0, None),
					}
				}
				_ => (0, None),
			}
		};
		mbuf.fdir_id = fdir_id;

		let queues = match p.queues.read() {
			Ok(q) => q,
			Err(p_err) => p_err.into_inner(),
		};
		let rxq = queues.rx.get(queue as usize).ok_or(PortError::NoQueue(port, queue))?;
		match rxq.push(mbuf) {
			Ok(()) => {
				p.counters.ipackets.fetch_add(1, Ordering::Relaxed);
				p.counters.ibytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
				Ok(queue)
			}
			Err(_dropped) => {
				p.counters.imissed.fetch_add(1, Ordering::Relaxed);
				Err(PortError::NoSpace(port))
			}
		}
	}

	/// Take every frame transmitted on a queue
	pub fn drain_tx(&self, port: u16, queue: u16) -> Vec<Mbuf> {
		let mut out = Vec::new();
		if let Ok(p) = self.port(port) {
			let queues = match p.queues.read() {
				Ok(q) => q,
				Err(p_err) => p_err.into_inner(),
			};
			if let Some(txq) = queues.tx.get(queue as usize) {
				while let Some(m) = txq.pop() {
					out.push(m);
				}
			}
		}
		out
	}

	/// Frames waiting on an rx queue
	pub fn rx_pending(&self, port: u16, queue: u16) -> usize {
		self.port(port)
			.ok()
			.and_then(|p| {
				let queues = match p.queues.read() {
					Ok(q) => q,
					Err(p_err) => p_err.into_inner(),
				};
				queues.rx.get(queue as usize).map(|q| q.len())
			})
			.unwrap_or(0)
	}

	pub fn nb_tx_queues(&self, port: u16) -> u16 {
		self.port(port)
			.map(|p| match p.queues.read() {
				Ok(q) => q.tx.len() as u16,
				Err(p_err) => p_err.into_inner().tx.len() as u16,
			})
			.unwrap_or(0)
	}

	pub fn queue_rate_limit(&self, port: u16, queue: u16) -> Option<u32> {
		let p = self.port(port).ok()?;
		let queues = match p.queues.read() {
			Ok(q) => q,
			Err(p_err) => p_err.into_inner(),
		};
		queues.rate.get(queue as usize).copied()
	}

	pub fn flow_ctrl(&self, port: u16) -> Option<FlowCtrl> {
		let p = self.port(port).ok()?;
		match p.flow_ctrl.read() {
			Ok(fc) => *fc,
			Err(p_err) => *p_err.into_inner(),
		}
	}

	/// Installed filters as (filter, id, rx queue)
	pub fn fdir_filters(&self, port: u16) -> Vec<(FdirFilter, u32, u16)> {
		match self.port(port) {
			Ok(p) => {
				let fdir = match p.fdir.read() {
					Ok(f) => f,
					Err(p_err) => p_err.into_inner(),
				};
				fdir.filters.iter().map(|(f, &(id, q))| (*f, id, q)).collect()
			}
			Err(_) => Vec::new(),
		}
	}
}

impl Nic for SoftNic {
	fn nb_ports(&self) -> u16 {
		self.ports.len() as u16
	}

	fn socket_id(&self, port: u16) -> Result<u32, PortError> {
		Ok(self.port(port)?.socket)
	}

	fn configure(&self, port: u16, conf: &PortConf) -> Result<(), PortError> {
		let p = self.port(port)?;
		if p.started.load(Ordering::Acquire) {
			return Err(PortError::AlreadyStarted(port));
		}
		if conf.nb_rxq == 0 || conf.nb_txq == 0 {
			return Err(PortError::Invalid("a port needs at least one rx and one tx queue"));
		}
		if conf.nb_rxd == 0 || conf.nb_txd == 0 {
			return Err(PortError::Invalid("descriptor count must not be zero"));
		}
		let mut queues = match p.queues.write() {
			Ok(q) => q,
			Err(p_err) => p_err.into_inner(),
		};
		queues.rx = (0..conf.nb_rxq)
			.map(|_| ArrayQueue::new(conf.nb_rxd as usize))
			.collect();
		queues.tx = (0..conf.nb_txq)
			.map(|_| ArrayQueue::new(conf.nb_txd as usize))
			.collect();
		queues.rate = vec![0; conf.nb_txq as usize];
		log::info!(
			"configured port {}: nb_rxq={}, nb_txq={}, socket_id={}",
			port,
			conf.nb_rxq,
			conf.nb_txq,
			p.socket
		);
		Ok(())
	}

	fn start(&self, port: u16) -> Result<(), PortError> {
		let p = self.port(port)?;
		let configured = match p.queues.read() {
			Ok(q) => !q.rx.is_empty(),
			Err(p_err) => !p_err.into_inner().rx.is_empty(),
		};
		if !configured {
			return Err(PortError::NotConfigured(port));
		}
		if p.started.swap(true, Ordering::AcqRel) {
			return Err(PortError::AlreadyStarted(port));
		}
		Ok(())
	}

	fn link_up(&self, port: u16) -> bool {
		self.port(port)
			.map(|p| p.started.load(Ordering::Acquire))
			.unwrap_or(false)
	}

	fn rx_burst(&self, port: u16, queue: u16, out: &mut Vec<Mbuf>, max: usize) -> usize {
		let p = match self.port(port) {
			Ok(p) => p,
			Err(_) => return 0,
		};
		let queues = match p.queues.read() {
			Ok(q) => q,
			Err(p_err) => p_err.into_inner(),
		};
		let rxq = match queues.rx.get(queue as usize) {
			Some(q) => q,
			None => return 0,
		};
		let mut n = 0;
		while n < max {
			match rxq.pop() {
				Some(m) => {
					out.push(m);
					n += 1;
				}
				None => break,
			}
		}
		n
	}

	fn tx_burst(&self, port: u16, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
		let p = match self.port(port) {
			Ok(p) => p,
			Err(_) => return 0,
		};
		let queues = match p.queues.read() {
			Ok(q) => q,
			Err(p_err) => p_err.into_inner(),
		};
		let txq = match queues.tx.get(queue as usize) {
			Some(q) => q,
			None => return 0,
		};
		let n = pkts.len().min(txq.capacity() - txq.len());
		let mut bytes = 0;
		for m in pkts.drain(..n) {
			bytes += m.data_len() as u64;
			// this core is the queue's only producer, the room was checked above
			let _ = txq.push(m);
		}
		p.counters.opackets.fetch_add(n as u64, Ordering::Relaxed);
		p.counters.obytes.fetch_add(bytes, Ordering::Relaxed);
		n
	}

	fn add_fdir_filter(
		&self,
		port: u16,
		filter: &FdirFilter,
		fdir_id: u32,
		rx_queue: u16,
	) -> Result<(), PortError> {
		let p = self.port(port)?;
		let nb_rxq = match p.queues.read() {
			Ok(q) => q.rx.len(),
			Err(p_err) => p_err.into_inner().rx.len(),
		};
		let mut fdir = match p.fdir.write() {
			Ok(f) => f,
			Err(p_err) => p_err.into_inner(),
		};
		let masks = match fdir.masks {
			Some(m) => m,
			None => {
				fdir.info.f_add += 1;
				return Err(PortError::Invalid("flow director is not enabled"));
			}
		};
		if rx_queue as usize >= nb_rxq {
			fdir.info.f_add += 1;
			return Err(PortError::NoQueue(port, rx_queue));
		}
		let key = filter.masked(&masks);
		if fdir.filters.contains_key(&key) {
			fdir.info.collision += 1;
		} else if fdir.filters.len() >= Self::FDIR_MAX_FILTERS {
			fdir.info.f_add += 1;
			return Err(PortError::NoSpace(port));
		}
		fdir.filters.insert(key, (fdir_id, rx_queue));
		fdir.info.add += 1;
		Ok(())
	}

	fn remove_fdir_filter(&self, port: u16, filter: &FdirFilter) -> Result<(), PortError> {
		let p = self.port(port)?;
		let mut fdir = match p.fdir.write() {
			Ok(f) => f,
			Err(p_err) => p_err.into_inner(),
		};
		let key = match fdir.masks {
			Some(m) => filter.masked(&m),
			None => *filter,
		};
		match fdir.filters.remove(&key) {
			Some(_) => {
				fdir.info.remove += 1;
				Ok(())
			}
			None => {
				fdir.info.f_remove += 1;
				Err(PortError::NoFilter(port))
			}
		}
	}

	fn fdir_info(&self, port: u16) -> Result<FdirInfo, PortError> {
		let p = self.port(port)?;
		let fdir = match p.fdir.read() {
			Ok(f) => f,
			Err(p_err) => p_err.into_inner(),
		};
		let mut info = fdir.info;
		info.free = (Self::FDIR_MAX_FILTERS - fdir.filters.len()) as u32;
		Ok(info)
	}

	fn set_fdir_masks(&self, port: u16, masks: &FdirMasks) -> Result<(), PortError> {
		let p = self.port(port)?;
		let mut fdir = match p.fdir.write() {
			Ok(f) => f,
			Err(p_err) => p_err.into_inner(),
		};
		fdir.masks = Some(*masks);
		// existing filters were stored under the old masks
		let old: Vec<_> = fdir.filters.drain().collect();
		for (f, v) in old {
			fdir.filters.insert(f.masked(masks), v);
		}
		Ok(())
	}

	fn set_queue_rate_limit(&self, port: u16, queue: u16, mbps: u32) -> Result<(), PortError> {
		let p = self.port(port)?;
		let mut queues = match p.queues.write() {
			Ok(q) => q,
			Err(p_err) => p_err.into_inner(),
		};
		match queues.rate.get_mut(queue as usize) {
			Some(r) => {
				*r = mbps;
				Ok(())
			}
			None => Err(PortError::NoQueue(port, queue)),
		}
	}

	fn set_flow_ctrl(&self, port: u16, fc: &FlowCtrl) -> Result<(), PortError> {
		let p = self.port(port)?;
		let mut cur = match p.flow_ctrl.write() {
			Ok(c) => c,
			Err(p_err) => p_err.into_inner(),
		};
		*cur = Some(*fc);
		Ok(())
	}

	fn stats(&self, port: u16) -> Result<PortStats, PortError> {
		let c = &self.port(port)?.counters;
		Ok(PortStats {
			ipackets: c.ipackets.load(Ordering::Relaxed),
			opackets: c.opackets.load(Ordering::Relaxed),
			ibytes: c.ibytes.load(Ordering::Relaxed),
			obytes: c.obytes.load(Ordering::Relaxed),
			imissed: c.imissed.load(Ordering::Relaxed),
			rx_nombuf: c.rx_nombuf.load(Ordering::Relaxed),
			..PortStats::default()
		})
	}

	fn stats_reset(&self, port: u16) -> Result<(), PortError> {
		let c = &self.port(port)?.counters;
		for a in [
			&c.ipackets,
			&c.opackets,
			&c.ibytes,
			&c.obytes,
			&c.imissed,
			&c.rx_nombuf,
		]
		.iter()
		{
			a.store(0, Ordering::Relaxed);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testutil::tcp_frame;

	fn nic(nb_rxq: u16, nb_rxd: u16) -> SoftNic {
		let pool = Mempool::new("softnic_test", 64, 2048).unwrap();
		let nic = SoftNic::new(&[0, 1], pool);
		for port in 0..2 {
			let conf = PortConf {
				nb_rxq,
				nb_txq: 2,
				nb_rxd,
				nb_txd: 8,
				fdir_masks: None,
			};
			nic.configure(port, &conf).unwrap();
			nic.start(port).unwrap();
		}
		nic
	}

	#[test]
	fn unmatched_frames_land_on_queue_zero() {
		let nic = nic(2, 8);
		let frame = tcp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, None);
		assert_eq!(nic.inject(0, &frame), Ok(0));
		let mut out = Vec::new();
		assert_eq!(nic.rx_burst(0, 0, &mut out, RX_BURST_MAX), 1);
		assert_eq!(out[0].port, 0);
		assert_eq!(out[0].fdir_id, None);
		assert_eq!(out[0].data(), &frame[..]);
	}

	#[test]
	fn filter_steers_and_tags() {
		let nic = nic(3, 8);
		nic.set_fdir_masks(1, &FdirMasks::EXACT).unwrap();
		let f = FdirFilter::tcp(
			u32::from(Ipv4Addr::new(10, 0, 0, 1)),
			1000,
			u32::from(Ipv4Addr::new(10, 0, 0, 2)),
			2000,
		);
		nic.add_fdir_filter(1, &f, 0x45, 2).unwrap();
		let frame = tcp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, None);
		assert_eq!(nic.inject(1, &frame), Ok(2));
		let mirrored = tcp_frame([10, 0, 0, 2], 2000, [10, 0, 0, 1], 1000, None);
		assert_eq!(nic.inject(1, &mirrored), Ok(0));

		let mut out = Vec::new();
		nic.rx_burst(1, 2, &mut out, RX_BURST_MAX);
		assert_eq!(out[0].fdir_id, Some(0x45));

		nic.remove_fdir_filter(1, &f).unwrap();
		assert_eq!(nic.remove_fdir_filter(1, &f), Err(PortError::NoFilter(1)));
		assert_eq!(nic.inject(1, &frame), Ok(0));
		let info = nic.fdir_info(1).unwrap();
		assert_eq!((info.add, info.remove, info.f_remove), (1, 1, 1));
	}

	#[test]
	fn filter_needs_masks() {
		let nic = nic(2, 8);
		let f = FdirFilter::tcp(1, 2, 3, 4);
		assert!(nic.add_fdir_filter(0, &f, 1, 1).is_err());
		nic.set_fdir_masks(0, &FdirMasks::EXACT).unwrap();
		assert_eq!(nic.add_fdir_filter(0, &f, 1, 5), Err(PortError::NoQueue(0, 5)));
		nic.add_fdir_filter(0, &f, 1, 1).unwrap();
		nic.add_fdir_filter(0, &f, 2, 1).unwrap();
		assert_eq!(nic.fdir_filters(0), vec![(f, 2, 1)]);
		assert_eq!(nic.fdir_info(0).unwrap().collision, 1);
	}

	#[test]
	fn destination_masks_ignore_protocol_and_source() {
		let nic = nic(3, 8);
		nic.set_fdir_masks(0, &FdirMasks::DST_IP).unwrap();
		let f = FdirFilter {
			dst_ip: u32::from(Ipv4Addr::new(20, 1, 8, 1)),
			..FdirFilter::default()
		};
		nic.add_fdir_filter(0, &f, 3, 2).unwrap();
		let tcp = tcp_frame([10, 0, 0, 1], 1000, [20, 1, 8, 1], 2000, None);
		let udp = crate::testutil::udp_frame([10, 9, 9, 9], [20, 1, 8, 1]);
		let other = tcp_frame([10, 0, 0, 1], 1000, [20, 1, 7, 1], 2000, None);
		assert_eq!(nic.inject(0, &tcp), Ok(2));
		assert_eq!(nic.inject(0, &udp), Ok(2));
		assert_eq!(nic.inject(0, &other), Ok(0));
	}

	#[test]
	fn full_rx_queue_counts_missed() {
		let nic = nic(1, 2);
		let frame = tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, None);
		nic.inject(0, &frame).unwrap();
		nic.inject(0, &frame).unwrap();
		assert_eq!(nic.inject(0, &frame), Err(PortError::NoSpace(0)));
		let st = nic.stats(0).unwrap();
		assert_eq!(st.ipackets, 2);
		assert_eq!(st.imissed, 1);
		// the dropped frame went back to the pool
		assert_eq!(nic.pool().in_use(), 2);
	}

	#[test]
	fn tx_keeps_unsent_frames() {
		let nic = nic(1, 8);
		let pool = Arc::clone(nic.pool());
		let mut pkts: Vec<Mbuf> = (0..10u8)
			.map(|i| Mbuf::from_bytes(&[i; 60], &pool).unwrap())
			.collect();
		assert_eq!(nic.tx_burst(0, 1, &mut pkts), 8);
		assert_eq!(pkts.len(), 2);
		assert_eq!(pkts[0].data()[0], 8);
		let sent = nic.drain_tx(0, 1);
		assert_eq!(sent.len(), 8);
		assert_eq!(sent[0].data()[0], 0);
		assert_eq!(nic.stats(0).unwrap().obytes, 480);
	}

	#[test]
	fn lifecycle_errors() {
		let pool = Mempool::new("softnic_lc", 4, 2048).unwrap();
		let nic = SoftNic::new(&[0], pool);
		assert_eq!(nic.start(0), Err(PortError::NotConfigured(0)));
		assert_eq!(nic.inject(0, &[0u8; 60]), Err(PortError::NotStarted(0)));
		nic.configure(0, &PortConf::default()).unwrap();
		nic.start(0).unwrap();
		assert!(nic.link_up(0));
		assert_eq!(nic.start(0), Err(PortError::AlreadyStarted(0)));
		assert_eq!(
			nic.configure(0, &PortConf::default()),
			Err(PortError::AlreadyStarted(0))
		);
		assert_eq!(nic.socket_id(4), Err(PortError::NoDevice(4)));
	}
}
