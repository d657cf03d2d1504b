//! Data rx lcores move steered packets from the data rx queues into the slot rings
//!
//! The low six bits of the flow director id name the slot, the rx queue names the output port.
//! One port is served per iteration. A queue that returned a partial burst is left alone for
//! the poll interval.

use std::{
	sync::Arc,
	time::{Duration, Instant},
};
use voq_ring::Ring;

use super::{keep_running, VoqRings};
use crate::{
	apis::{Mbuf, RX_BURST_MAX},
	config::Backpressure,
	dp::{LcoreParams, RxPortConf},
	pipeline::{Pipeline, PipelineCtx},
	sched::PollSchedule,
};

pub struct DataRxLcore {
	id: u32,
	ports: Vec<RxPortConf>,
	rings: Arc<VoqRings>,
	ctx: PipelineCtx,
	schedule: PollSchedule,
	burst: Vec<Mbuf>,
	group: Vec<Mbuf>,
	port_idx: usize,
}

#[inline]
fn slot_of(m: &Mbuf) -> Option<usize> {
	m.fdir_id
		.map(|id| (id & Pipeline::FDIR_OUT_QUEUE_MASK) as usize)
}

impl DataRxLcore {
	pub fn new(
		lp: &LcoreParams,
		rings: Arc<VoqRings>,
		ctx: PipelineCtx,
		poll_interval: Duration,
	) -> Self {
		let queues: Vec<usize> = lp.rx_ports.iter().map(|p| p.queues.len()).collect();
		Self {
			id: lp.id,
			ports: lp.rx_ports.clone(),
			rings,
			ctx,
			schedule: PollSchedule::new(poll_interval, &queues),
			burst: Vec::with_capacity(RX_BURST_MAX),
			group: Vec::with_capacity(RX_BURST_MAX),
			port_idx: 0,
		}
	}

	#[inline]
	pub fn id(&self) -> u32 {
		self.id
	}

	/// Serve the data queues of the next port, returns the packets read
	pub fn poll(&mut self, now: Instant) -> usize {
		if self.ports.is_empty() {
			return 0;
		}
		let pi = self.port_idx;
		self.port_idx = (pi + 1) % self.ports.len();

		let DataRxLcore {
			ports,
			rings,
			ctx,
			schedule,
			burst,
			group,
			..
		} = self;
		let port = &ports[pi];
		let mut total = 0;

		for (qi, q) in port.queues.iter().enumerate() {
			if !schedule.is_due(pi, qi, now) {
				continue;
			}
			burst.clear();
			let n = ctx.nic.rx_burst(port.port_id, q.queue_id, burst, RX_BURST_MAX);
			if n == 0 {
				continue;
			}
			if n < RX_BURST_MAX {
				schedule.mark(pi, qi, now);
			}
			ctx.stats.rx_burst(port.port_id, q.queue_id, n);
			total += n;

			// packets of one slot arrive in runs, move each run with one enqueue
			while !burst.is_empty() {
				let slot = slot_of(&burst[0]);
				let run = burst.iter().take_while(|m| slot_of(m) == slot).count();
				group.extend(burst.drain(..run));
				match slot.and_then(|s| rings.get(q.out_port, s)) {
					Some(ring) => enqueue_data(ctx, ring, group),
					None => {
						#[cfg(feature = "debug")]
						log::debug!(
							"port {} queue {}: {} packets without slot",
							port.port_id,
							q.queue_id,
							group.len()
						);
						ctx.stats.dropped(group.len());
						group.clear();
					}
				}
			}
		}
		total
	}

	pub fn run(mut self) {
		log::info!("lcore {}: data rx, entering main loop", self.id);
		for p in self.ports.iter() {
			log::info!("lcore {}: data rx port {}, {} queues", self.id, p.port_id, p.queues.len());
		}
		while keep_running(&self.ctx) {
			self.poll(Instant::now());
		}
		log::info!("lcore {}: data rx, leaving main loop", self.id);
	}
}

/// Put `pkts` into a slot ring, retrying or dropping per the backpressure policy
fn enqueue_data(ctx: &PipelineCtx, ring: &Ring<Mbuf>, pkts: &mut Vec<Mbuf>) {
	loop {
		ring.enqueue_burst(pkts);
		if pkts.is_empty() {
			return;
		}
		if ctx.policy == Backpressure::Lossy || !keep_running(ctx) {
			break;
		}
		std::hint::spin_loop();
	}
	ctx.stats.dropped(pkts.len());
	pkts.clear();
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		apis::{FdirFilter, FdirMasks, Mempool, Nic, PortConf, SoftNic},
		dp::{LcoreRole, RxQueueConf},
		stats::Stats,
		testutil::tcp_frame,
	};
	use std::{net::Ipv4Addr, sync::atomic::AtomicBool};

	fn setup(policy: Backpressure, ring_size: usize) -> (Arc<SoftNic>, DataRxLcore, Arc<VoqRings>) {
		let pool = Mempool::new("data_rx_test", 256, 2048).unwrap();
		let nic = Arc::new(SoftNic::new(&[0, 0], pool));
		for p in 0..2 {
			let conf = PortConf {
				nb_rxq: 3,
				nb_txq: 3,
				nb_rxd: 128,
				nb_txd: 128,
				fdir_masks: Some(FdirMasks::EXACT),
			};
			nic.configure(p, &conf).unwrap();
			nic.start(p).unwrap();
			nic.set_fdir_masks(p, &FdirMasks::EXACT).unwrap();
		}
		let ctx = PipelineCtx {
			nic: nic.clone(),
			stats: Arc::new(Stats::new(2)),
			policy,
			keep_running: Arc::new(AtomicBool::new(true)),
		};
		let rings = Arc::new(VoqRings::new(2, ring_size).unwrap());
		let lp = LcoreParams {
			id: 1,
			socket: 0,
			role: LcoreRole::DataRx,
			rx_ports: vec![RxPortConf {
				port_id: 0,
				queues: vec![
					RxQueueConf {
						queue_id: 1,
						out_port: 0,
					},
					RxQueueConf {
						queue_id: 2,
						out_port: 1,
					},
				],
			}],
			tx_ports: Vec::new(),
		};
		let lcore = DataRxLcore::new(&lp, rings.clone(), ctx, Duration::from_micros(100));
		(nic, lcore, rings)
	}

	fn steer(nic: &SoftNic, src: [u8; 4], sport: u16, slot: u32) -> Vec<u8> {
		let dst = [10, 0, 1, 1];
		let filter = FdirFilter::tcp(
			u32::from(Ipv4Addr::from(src)),
			sport,
			u32::from(Ipv4Addr::from(dst)),
			9000,
		);
		nic.add_fdir_filter(0, &filter, (3 << 6) | slot, 2).unwrap();
		tcp_frame(src, sport, dst, 9000, None)
	}

	#[test]
	fn runs_go_to_their_slot_rings() {
		let (nic, mut lcore, rings) = setup(Backpressure::Retry, 64);
		let a = steer(&nic, [20, 1, 7, 1], 1000, 5);
		let b = steer(&nic, [20, 1, 8, 1], 1001, 6);
		for f in [&a, &a, &b, &a].iter() {
			assert_eq!(nic.inject(0, f), Ok(2));
		}
		assert_eq!(lcore.poll(Instant::now()), 4);
		assert_eq!(rings.occupancy(1, 5), 3);
		assert_eq!(rings.occupancy(1, 6), 1);
		assert_eq!(rings.occupancy(0, 5), 0);
		assert_eq!(lcore.ctx.stats.rx(0, 2).total_packets, 4);
	}

	#[test]
	fn partial_burst_closes_the_gate() {
		let (nic, mut lcore, rings) = setup(Backpressure::Retry, 64);
		let a = steer(&nic, [20, 1, 7, 1], 1000, 5);
		let t0 = Instant::now();
		nic.inject(0, &a).unwrap();
		assert_eq!(lcore.poll(t0), 1);
		nic.inject(0, &a).unwrap();
		assert_eq!(lcore.poll(t0 + Duration::from_micros(50)), 0);
		assert_eq!(lcore.poll(t0 + Duration::from_micros(100)), 1);
		assert_eq!(rings.occupancy(1, 5), 2);
	}

	#[test]
	fn lossy_drops_what_does_not_fit() {
		let (nic, mut lcore, rings) = setup(Backpressure::Lossy, 4);
		let a = steer(&nic, [20, 1, 7, 1], 1000, 5);
		for _ in 0..6 {
			nic.inject(0, &a).unwrap();
		}
		assert_eq!(lcore.poll(Instant::now()), 6);
		assert_eq!(rings.occupancy(1, 5), 4);
		assert_eq!(lcore.ctx.stats.nb_dropped(), 2);
		assert_eq!(nic.pool().in_use(), 4);
	}
}
