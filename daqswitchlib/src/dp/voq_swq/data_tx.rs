//! Data tx lcores drain the slot rings of their ports
//!
//! Only slots in the port's active mask are looked at. Request flows are drained on every pass,
//! data flows at most once per drain interval so that their packets leave in bursts.

use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use super::{keep_running, VoqRings, TXQ_DATA, TXQ_REQ};
use crate::{
	apis::{Mbuf, TX_BURST_MAX},
	dp::LcoreParams,
	flow::{FlowTable, MAX_DATA_FLOWS},
	pipeline::PipelineCtx,
	sched::delay,
};

pub struct DataTxLcore {
	id: u32,
	ports: Vec<u16>,
	table: Arc<FlowTable>,
	rings: Arc<VoqRings>,
	ctx: PipelineCtx,
	drain_interval: Duration,
	/// `[port_idx][slot]`
	last_drain: Vec<Vec<Option<Instant>>>,
	burst: Vec<Mbuf>,
	port_idx: usize,
}

impl DataTxLcore {
	pub const RETRY_DELAY: Duration = Duration::from_micros(10);

	pub fn new(
		lp: &LcoreParams,
		table: Arc<FlowTable>,
		rings: Arc<VoqRings>,
		ctx: PipelineCtx,
		drain_interval: Duration,
	) -> Self {
		Self {
			id: lp.id,
			ports: lp.tx_ports.clone(),
			table,
			rings,
			ctx,
			drain_interval,
			last_drain: vec![vec![None; MAX_DATA_FLOWS]; lp.tx_ports.len()],
			burst: Vec::with_capacity(TX_BURST_MAX),
			port_idx: 0,
		}
	}

	#[inline]
	pub fn id(&self) -> u32 {
		self.id
	}

	#[inline]
	fn due(&self, pi: usize, slot: usize, now: Instant) -> bool {
		match self.last_drain[pi][slot] {
			Some(last) => now.saturating_duration_since(last) >= self.drain_interval,
			None => true,
		}
	}

	/// Drain the active slots of the next port, returns the packets sent
	pub fn poll(&mut self, now: Instant) -> usize {
		if self.ports.is_empty() {
			return 0;
		}
		let pi = self.port_idx;
		self.port_idx = (pi + 1) % self.ports.len();
		let port = self.ports[pi];

		let requests = self.table.request_flows(port);
		let mut active = self.table.active_flows(port);
		let mut total = 0;
		while active != 0 {
			let slot = active.trailing_zeros() as usize;
			active &= active - 1;

			let is_request = requests & (1u64 << slot) != 0;
			if !is_request && !self.due(pi, slot, now) {
				continue;
			}
			let ring = match self.rings.get(port, slot) {
				Some(r) => r,
				None => continue,
			};
			self.burst.clear();
			let n = ring.dequeue_burst(&mut self.burst, TX_BURST_MAX);
			if n == 0 {
				continue;
			}
			let queue = if is_request { TXQ_REQ } else { TXQ_DATA };
			self.send(port, queue);

			self.last_drain[pi][slot] = Some(now);
			self.table.touch(port, slot, now);
			total += n;
		}
		total
	}

	/// Send the whole burst, waiting for room on the tx queue
	fn send(&mut self, port: u16, queue: u16) {
		loop {
			let sent = self.ctx.nic.tx_burst(port, queue, &mut self.burst);
			self.ctx.stats.tx_burst(port, queue, sent);
			if self.burst.is_empty() {
				return;
			}
			if !keep_running(&self.ctx) {
				break;
			}
			delay(Self::RETRY_DELAY);
		}
		self.ctx.stats.dropped(self.burst.len());
		self.burst.clear();
	}

	pub fn run(mut self) {
		log::info!("lcore {}: data tx, entering main loop", self.id);
		for p in self.ports.iter() {
			log::info!("lcore {}: data tx port {}", self.id, p);
		}
		while keep_running(&self.ctx) {
			self.poll(Instant::now());
		}
		log::info!("lcore {}: data tx, leaving main loop", self.id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		apis::{Mempool, Nic, PortConf, SoftNic},
		config::Backpressure,
		dp::LcoreRole,
		stats::Stats,
	};
	use std::sync::atomic::AtomicBool;

	struct Fixture {
		nic: Arc<SoftNic>,
		table: Arc<FlowTable>,
		rings: Arc<VoqRings>,
		lcore: DataTxLcore,
	}

	fn fixture(nb_txd: u16) -> Fixture {
		let pool = Mempool::new("data_tx_test", 256, 256).unwrap();
		let nic = Arc::new(SoftNic::new(&[0, 0], pool));
		for p in 0..2 {
			let conf = PortConf {
				nb_rxq: 3,
				nb_txq: 3,
				nb_rxd: 64,
				nb_txd,
				fdir_masks: None,
			};
			nic.configure(p, &conf).unwrap();
			nic.start(p).unwrap();
		}
		let ctx = PipelineCtx {
			nic: nic.clone(),
			stats: Arc::new(Stats::new(2)),
			policy: Backpressure::Retry,
			keep_running: Arc::new(AtomicBool::new(true)),
		};
		let table = Arc::new(FlowTable::new(2));
		let rings = Arc::new(VoqRings::new(2, 128).unwrap());
		let lp = LcoreParams {
			id: 2,
			socket: 0,
			role: LcoreRole::DataTx,
			rx_ports: Vec::new(),
			tx_ports: vec![1],
		};
		let lcore = DataTxLcore::new(
			&lp,
			table.clone(),
			rings.clone(),
			ctx,
			Duration::from_micros(10),
		);
		Fixture {
			nic,
			table,
			rings,
			lcore,
		}
	}

	fn fill(f: &Fixture, port: u16, slot: usize, n: usize) {
		let mut pkts = Mbuf::alloc_bulk(n, f.nic.pool()).unwrap();
		assert_eq!(f.rings.get(port, slot).unwrap().enqueue_burst(&mut pkts), n);
	}

	#[test]
	fn slots_drain_to_their_queue() {
		let mut f = fixture(64);
		let t0 = Instant::now();
		let data = f.table.allocate_slot(1, 1, 7, false, t0).unwrap();
		let req = f.table.allocate_slot(1, 2, 0xffff_ffff, true, t0).unwrap();
		fill(&f, 1, data, 3);
		fill(&f, 1, req, 2);

		assert_eq!(f.lcore.poll(t0), 5);
		assert_eq!(f.nic.drain_tx(1, TXQ_DATA).len(), 3);
		assert_eq!(f.nic.drain_tx(1, TXQ_REQ).len(), 2);
		assert_eq!(f.lcore.ctx.stats.tx(1, TXQ_DATA).total_packets, 3);
	}

	#[test]
	fn data_slots_wait_for_the_drain_interval() {
		let mut f = fixture(64);
		let t0 = Instant::now();
		let data = f.table.allocate_slot(1, 1, 7, false, t0).unwrap();
		let req = f.table.allocate_slot(1, 2, 0xffff_ffff, true, t0).unwrap();
		fill(&f, 1, data, 1);
		assert_eq!(f.lcore.poll(t0), 1);

		fill(&f, 1, data, 1);
		fill(&f, 1, req, 1);
		// request flows are always served
		assert_eq!(f.lcore.poll(t0 + Duration::from_micros(5)), 1);
		assert_eq!(f.rings.occupancy(1, data), 1);
		assert_eq!(f.lcore.poll(t0 + Duration::from_micros(10)), 1);
		assert_eq!(f.rings.occupancy(1, data), 0);
	}

	#[test]
	fn inactive_slots_are_not_polled() {
		let mut f = fixture(64);
		fill(&f, 1, 9, 4);
		assert_eq!(f.lcore.poll(Instant::now()), 0);
		assert_eq!(f.rings.occupancy(1, 9), 4);
	}

	#[test]
	fn draining_touches_the_slot() {
		let mut f = fixture(64);
		let t0 = Instant::now();
		let data = f.table.allocate_slot(1, 1, 7, false, t0).unwrap();
		fill(&f, 1, data, 1);
		let later = t0 + Duration::from_secs(20);
		f.lcore.poll(later);
		assert!(f.table.idle_for(1, data, later) < Duration::from_secs(1));
	}

	#[test]
	fn full_tx_queue_is_retried() {
		let mut f = fixture(4);
		let t0 = Instant::now();
		let data = f.table.allocate_slot(1, 1, 7, false, t0).unwrap();
		fill(&f, 1, data, 6);

		let nic = f.nic.clone();
		let drainer = std::thread::spawn(move || {
			let mut got = 0;
			while got < 6 {
				got += nic.drain_tx(1, TXQ_DATA).len();
				std::thread::yield_now();
			}
			got
		});
		assert_eq!(f.lcore.poll(t0), 6);
		assert_eq!(drainer.join().unwrap(), 6);
		assert_eq!(f.lcore.ctx.stats.nb_dropped(), 0);
	}
}
