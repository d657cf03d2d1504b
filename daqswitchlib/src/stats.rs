//! Per port and per queue packet counters
//!
//! Every rx and tx burst bumps the packet and burst counters of its (port, queue). Reports are the
//! difference of two snapshots taken an interval apart.

use crossbeam::utils::CachePadded;
use std::{
	fmt,
	sync::atomic::{AtomicU64, Ordering},
	time::Duration,
};

use crate::apis::{Nic, PortStats};

pub const MAX_QUEUES_PER_PORT: usize = 64;

#[derive(Default)]
struct QueueCounters {
	total_packets: AtomicU64,
	total_bursts: AtomicU64,
}

impl QueueCounters {
	#[inline]
	fn add(&self, pkts: usize) {
		self.total_packets.fetch_add(pkts as u64, Ordering::Relaxed);
		self.total_bursts.fetch_add(1, Ordering::Relaxed);
	}

	fn get(&self) -> QueueStats {
		QueueStats {
			total_packets: self.total_packets.load(Ordering::Relaxed),
			total_bursts: self.total_bursts.load(Ordering::Relaxed),
		}
	}

	fn reset(&self) {
		self.total_packets.store(0, Ordering::Relaxed);
		self.total_bursts.store(0, Ordering::Relaxed);
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QueueStats {
	pub total_packets: u64,
	pub total_bursts: u64,
}

pub struct Stats {
	rx: Vec<Vec<CachePadded<QueueCounters>>>,
	tx: Vec<Vec<CachePadded<QueueCounters>>>,
	flow_exhausted: AtomicU64,
	filter_failures: AtomicU64,
	dropped: AtomicU64,
}

impl Stats {
	pub fn new(nb_ports: u16) -> Self {
		let queues = || {
			(0..nb_ports)
				.map(|_| {
					(0..MAX_QUEUES_PER_PORT)
						.map(|_| CachePadded::new(QueueCounters::default()))
						.collect()
				})
				.collect()
		};
		Self {
			rx: queues(),
			tx: queues(),
			flow_exhausted: AtomicU64::new(0),
			filter_failures: AtomicU64::new(0),
			dropped: AtomicU64::new(0),
		}
	}

	#[inline]
	pub fn rx_burst(&self, port: u16, queue: u16, pkts: usize) {
		if let Some(q) = self.rx.get(port as usize).and_then(|p| p.get(queue as usize)) {
			q.add(pkts);
		}
	}

	#[inline]
	pub fn tx_burst(&self, port: u16, queue: u16, pkts: usize) {
		if let Some(q) = self.tx.get(port as usize).and_then(|p| p.get(queue as usize)) {
			q.add(pkts);
		}
	}

	pub fn rx(&self, port: u16, queue: u16) -> QueueStats {
		self.rx
			.get(port as usize)
			.and_then(|p| p.get(queue as usize))
			.map(|q| q.get())
			.unwrap_or_default()
	}

	pub fn tx(&self, port: u16, queue: u16) -> QueueStats {
		self.tx
			.get(port as usize)
			.and_then(|p| p.get(queue as usize))
			.map(|q| q.get())
			.unwrap_or_default()
	}

	/// A new flow found no free slot
	#[inline]
	pub fn flow_exhausted(&self) {
		self.flow_exhausted.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn filter_failed(&self) {
		self.filter_failures.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn dropped(&self, pkts: usize) {
		self.dropped.fetch_add(pkts as u64, Ordering::Relaxed);
	}

	pub fn nb_flow_exhausted(&self) -> u64 {
		self.flow_exhausted.load(Ordering::Relaxed)
	}

	pub fn nb_filter_failures(&self) -> u64 {
		self.filter_failures.load(Ordering::Relaxed)
	}

	pub fn nb_dropped(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}

	/// Counters of the switch and of the NIC ports
	pub fn snapshot(&self, nic: &dyn Nic) -> StatsSnapshot {
		let copy = |qs: &Vec<Vec<CachePadded<QueueCounters>>>| {
			qs.iter()
				.map(|p| p.iter().map(|q| q.get()).collect())
				.collect()
		};
		StatsSnapshot {
			ports: (0..self.rx.len() as u16)
				.map(|p| nic.stats(p).unwrap_or_default())
				.collect(),
			rx: copy(&self.rx),
			tx: copy(&self.tx),
			flow_exhausted: self.nb_flow_exhausted(),
			filter_failures: self.nb_filter_failures(),
			dropped: self.nb_dropped(),
		}
	}

	pub fn reset(&self, nic: &dyn Nic) {
		for port in 0..self.rx.len() {
			if let Err(e) = nic.stats_reset(port as u16) {
				log::warn!("cannot reset stats of port {}: {}", port, e);
			}
			for q in self.rx[port].iter().chain(self.tx[port].iter()) {
				q.reset();
			}
		}
		self.flow_exhausted.store(0, Ordering::Relaxed);
		self.filter_failures.store(0, Ordering::Relaxed);
		self.dropped.store(0, Ordering::Relaxed);
	}
}

#[derive(Clone, Debug, Default)]
pub struct StatsSnapshot {
	pub ports: Vec<PortStats>,
	pub rx: Vec<Vec<QueueStats>>,
	pub tx: Vec<Vec<QueueStats>>,
	pub flow_exhausted: u64,
	pub filter_failures: u64,
	pub dropped: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PortReport {
	pub port: u16,
	pub rx_dropped: u64,
	pub rx_pause_on: u64,
	pub rx_pause_off: u64,
	pub bw_rx: f64,
	pub bw_tx: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueueReport {
	pub port: u16,
	pub queue: u16,
	pub rx: QueueStats,
	pub tx: QueueStats,
}

impl QueueReport {
	pub fn avg_rx_burst(&self) -> f64 {
		avg(self.rx)
	}

	pub fn avg_tx_burst(&self) -> f64 {
		avg(self.tx)
	}
}

fn avg(q: QueueStats) -> f64 {
	if q.total_bursts == 0 {
		0.0
	} else {
		q.total_packets as f64 / q.total_bursts as f64
	}
}

/// Difference of two snapshots
#[derive(Clone, Debug, PartialEq)]
pub struct StatsReport {
	pub ports: Vec<PortReport>,
	pub queues: Vec<QueueReport>,
	pub total_rx_dropped: u64,
	pub total_bw_rx: f64,
	pub total_bw_tx: f64,
	pub flow_exhausted: u64,
	pub filter_failures: u64,
	pub dropped: u64,
}

/// bandwidth in Gbps
#[inline]
fn gbps(bytes: u64, interval_ms: f64) -> f64 {
	bytes as f64 * 8.0 / interval_ms * 1.0e-6
}

impl StatsReport {
	pub fn between(before: &StatsSnapshot, after: &StatsSnapshot, interval: Duration) -> Self {
		let ms = (interval.as_secs_f64() * 1000.0).max(1.0);
		let mut total_rx_bytes = 0;
		let mut total_tx_bytes = 0;
		let mut total_rx_dropped = 0;

		let ports = after
			.ports
			.iter()
			.zip(before.ports.iter())
			.enumerate()
			.map(|(port, (a, b))| {
				let rx_bytes = a.ibytes.saturating_sub(b.ibytes);
				let tx_bytes = a.obytes.saturating_sub(b.obytes);
				let rx_dropped = a.imissed + a.rx_nombuf;
				total_rx_bytes += rx_bytes;
				total_tx_bytes += tx_bytes;
				total_rx_dropped += rx_dropped;
				PortReport {
					port: port as u16,
					rx_dropped,
					rx_pause_on: a.rx_pause_xon,
					rx_pause_off: a.rx_pause_xoff,
					bw_rx: gbps(rx_bytes, ms),
					bw_tx: gbps(tx_bytes, ms),
				}
			})
			.collect();

		let diff = |a: QueueStats, b: QueueStats| QueueStats {
			total_packets: a.total_packets.saturating_sub(b.total_packets),
			total_bursts: a.total_bursts.saturating_sub(b.total_bursts),
		};
		let mut queues = Vec::new();
		for port in 0..after.rx.len().min(before.rx.len()) {
			for queue in 0..after.rx[port].len() {
				let rx = diff(after.rx[port][queue], before.rx[port][queue]);
				let tx = diff(after.tx[port][queue], before.tx[port][queue]);
				if rx.total_packets == 0 && tx.total_packets == 0 {
					continue;
				}
				queues.push(QueueReport {
					port: port as u16,
					queue: queue as u16,
					rx,
					tx,
				});
			}
		}

		Self {
			ports,
			queues,
			total_rx_dropped,
			total_bw_rx: gbps(total_rx_bytes, ms),
			total_bw_tx: gbps(total_tx_bytes, ms),
			flow_exhausted: after.flow_exhausted.saturating_sub(before.flow_exhausted),
			filter_failures: after.filter_failures.saturating_sub(before.filter_failures),
			dropped: after.dropped.saturating_sub(before.dropped),
		}
	}
}

impl fmt::Display for StatsReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let sep1 = "+------+---------------+-------------+--------------+---------------+---------------+";
		writeln!(f)?;
		writeln!(f, "{}", sep1)?;
		writeln!(
			f,
			"| Port | Rx Dropped    | Rx Pause On | Rx Pause Off | Bw Rx [Gbps]  | Bw Tx [Gbps]  |"
		)?;
		writeln!(f, "{}", sep1)?;
		for p in &self.ports {
			writeln!(
				f,
				"| {:4} | {:13} | {:11} | {:12} | {:13.8} | {:13.8} |",
				p.port, p.rx_dropped, p.rx_pause_on, p.rx_pause_off, p.bw_rx, p.bw_tx
			)?;
		}
		writeln!(f, "{}", sep1)?;
		writeln!(
			f,
			"| ALL  | {:13} |             |              | {:13.8} | {:13.8} |",
			self.total_rx_dropped, self.total_bw_rx, self.total_bw_tx
		)?;

		let sep2 = "+------+-------+---------------+---------------+--------------+--------------+----------------+----------------+";
		writeln!(f, "{}", sep2)?;
		writeln!(
			f,
			"| Port | Queue | Avg rx burst  | Avg tx burst  | Total pkt rx | Total pkt tx | Total burst rx | Total burst tx |"
		)?;
		writeln!(f, "{}", sep2)?;
		for q in &self.queues {
			writeln!(
				f,
				"| {:4} | {:5} | {:13.4} | {:13.4} | {:12} | {:12} | {:14} | {:14} |",
				q.port,
				q.queue,
				q.avg_rx_burst(),
				q.avg_tx_burst(),
				q.rx.total_packets,
				q.tx.total_packets,
				q.rx.total_bursts,
				q.tx.total_bursts
			)?;
		}
		writeln!(f, "{}", sep2)?;
		writeln!(
			f,
			"flows exhausted: {}, filter failures: {}, dropped: {}",
			self.flow_exhausted, self.filter_failures, self.dropped
		)
	}
}
