//! Virtual output queues in hardware
//!
//! The flow director steers every packet to the rx queue numbered after its output port, so rx
//! queue `p` of every port holds what leaves through port `p`. The lcore owning port `p` polls
//! that queue on all ports and transmits on the single tx queue of `p`. Only host routes can be
//! steered. Frames no filter matches land on rx queue 0 and leave through port 0.

use std::{
	fmt::Write,
	net::Ipv4Addr,
	time::{Duration, Instant},
};

use super::{
	default_ipv4_rules, keep_running, spawn_lcore, Dataplane, DpError, LcoreParams, LcorePlan,
	LcoreThread,
};
use crate::{
	apis::{FdirFilter, FdirMasks, Mbuf, PortConf, PortError, RX_BURST_MAX},
	config::{Backpressure, SwitchConfig},
	pipeline::PipelineCtx,
	sched::{delay, PollGate},
};

pub const NB_RXD: u16 = 4096;
pub const NB_TXD: u16 = 4096;
pub const TXQ: u16 = 0;

pub struct TxQueueLcore {
	id: u32,
	/// output ports owned by this lcore
	ports: Vec<u16>,
	nb_ports: u16,
	ctx: PipelineCtx,
	/// one per owned port
	gates: Vec<PollGate>,
	burst: Vec<Mbuf>,
}

impl TxQueueLcore {
	pub const RX_POLL_INTERVAL: Duration = Duration::from_micros(50);
	pub const RETRY_DELAY: Duration = Duration::from_micros(10);

	pub fn new(lp: &LcoreParams, nb_ports: u16, ctx: PipelineCtx) -> Self {
		Self {
			id: lp.id,
			ports: lp.tx_ports.clone(),
			nb_ports,
			ctx,
			gates: vec![PollGate::new(Self::RX_POLL_INTERVAL); lp.tx_ports.len()],
			burst: Vec::with_capacity(RX_BURST_MAX),
		}
	}

	#[inline]
	pub fn id(&self) -> u32 {
		self.id
	}

	fn send_all(ctx: &PipelineCtx, port: u16, pkts: &mut Vec<Mbuf>) {
		loop {
			let sent = ctx.nic.tx_burst(port, TXQ, pkts);
			ctx.stats.tx_burst(port, TXQ, sent);
			if pkts.is_empty() {
				return;
			}
			if ctx.policy == Backpressure::Lossy || !keep_running(ctx) {
				break;
			}
			delay(Self::RETRY_DELAY);
		}
		ctx.stats.dropped(pkts.len());
		pkts.clear();
	}

	/// Move the queue of every due port, from all ingress ports, onto the port
	///
	/// A port whose queue gave a full burst stays due for the next pass.
	pub fn poll(&mut self, now: Instant) -> usize {
		let mut total = 0;
		for i in 0..self.ports.len() {
			if !self.gates[i].is_due(now) {
				continue;
			}
			let out = self.ports[i];
			let mut full = false;
			for ingress in 0..self.nb_ports {
				self.burst.clear();
				let n = self.ctx.nic.rx_burst(ingress, out, &mut self.burst, RX_BURST_MAX);
				if n == 0 {
					continue;
				}
				full |= n == RX_BURST_MAX;
				self.ctx.stats.rx_burst(ingress, out, n);
				total += n;
				Self::send_all(&self.ctx, out, &mut self.burst);
			}
			if !full {
				self.gates[i].mark(now);
			}
		}
		total
	}

	pub fn run(mut self) {
		log::info!(
			"lcore {}: tx queue, ports {:?}, entering main loop",
			self.id,
			self.ports
		);
		while keep_running(&self.ctx) {
			self.poll(Instant::now());
		}
		log::info!("lcore {}: tx queue, leaving main loop", self.id);
	}
}

pub struct VoqHwq {
	cfg: SwitchConfig,
	ctx: PipelineCtx,
	plan: Option<LcorePlan>,
	workers: Vec<TxQueueLcore>,
	/// installed host routes as (address, output port)
	routes: Vec<(u32, u16)>,
	next_fdir_id: u32,
}

impl VoqHwq {
	pub fn new(cfg: SwitchConfig, ctx: PipelineCtx) -> Self {
		Self {
			cfg,
			ctx,
			plan: None,
			workers: Vec::new(),
			routes: Vec::new(),
			next_fdir_id: 0,
		}
	}

	pub fn routes(&self) -> &[(u32, u16)] {
		&self.routes
	}

	/// The configured loops, for running them by hand
	pub fn take_workers(&mut self) -> Vec<TxQueueLcore> {
		std::mem::take(&mut self.workers)
	}
}

impl Dataplane for VoqHwq {
	fn name(&self) -> &'static str {
		"voq_hwq"
	}

	fn init(&mut self, ports: &mut [PortConf]) -> Result<(), DpError> {
		log::info!("initializing lcores...");
		let plan = LcorePlan::voq_hwq(&self.cfg)?;
		for conf in ports.iter_mut() {
			conf.nb_rxq = self.cfg.nb_ports();
			conf.nb_txq = 1;
			conf.nb_rxd = NB_RXD;
			conf.nb_txd = NB_TXD;
			conf.fdir_masks = Some(FdirMasks::DST_IP);
		}
		self.plan = Some(plan);
		Ok(())
	}

	fn configure(&mut self) -> Result<(), DpError> {
		let plan = self.plan.as_ref().ok_or(DpError::NotInitialized)?;
		self.workers = plan
			.lcores()
			.iter()
			.filter(|lp| !lp.tx_ports.is_empty())
			.map(|lp| {
				log::debug!("lcore {} tx queue, configuring...", lp.id);
				TxQueueLcore::new(lp, self.cfg.nb_ports(), self.ctx.clone())
			})
			.collect();
		Ok(())
	}

	fn launch(&mut self) -> Result<Vec<LcoreThread>, DpError> {
		if self.workers.is_empty() {
			return Err(DpError::NotConfigured);
		}
		let mut threads = Vec::with_capacity(self.workers.len());
		for w in self.take_workers() {
			let lcore = w.id();
			threads.push(spawn_lcore(lcore, self.cfg.pin_threads, move || w.run())?);
		}
		Ok(threads)
	}

	fn install_default_tables(&mut self) -> Result<(), DpError> {
		for (addr, depth, port) in default_ipv4_rules(self.cfg.nb_ports()) {
			self.add_ipv4_rule(addr, depth, port)?;
		}
		Ok(())
	}

	/// Steer `addr` to rx queue `port` on every port
	///
	/// Every port is tried, the first failure is returned.
	fn add_ipv4_rule(&mut self, addr: u32, depth: u8, port: u16) -> Result<(), DpError> {
		if depth != 32 {
			return Err(PortError::Invalid("only /32 routes can be steered").into());
		}
		let nb_ports = self.cfg.nb_ports();
		if port >= nb_ports {
			return Err(PortError::NoDevice(port).into());
		}
		let filter = FdirFilter {
			dst_ip: addr,
			..FdirFilter::default()
		};
		let fdir_id = self.next_fdir_id;
		self.next_fdir_id += 1;
		let mut first_err = None;
		for p in 0..nb_ports {
			if let Err(e) = self.ctx.nic.add_fdir_filter(p, &filter, fdir_id, port) {
				log::error!(
					"port {}: cannot steer {} to queue {}: {}",
					p,
					Ipv4Addr::from(addr),
					port,
					e
				);
				self.ctx.stats.filter_failed();
				first_err.get_or_insert(e);
			}
		}
		if let Some(e) = first_err {
			return Err(e.into());
		}
		self.routes.retain(|r| r.0 != addr);
		self.routes.push((addr, port));
		log::debug!("rule {}/32 -> port {}", Ipv4Addr::from(addr), port);
		Ok(())
	}

	fn release_flow(&mut self, _port: u16, _slot: usize) -> Result<(), DpError> {
		Err(DpError::Unsupported("voq_hwq"))
	}

	fn plan(&self) -> Option<&LcorePlan> {
		self.plan.as_ref()
	}

	fn dump(&self) -> String {
		let mut out = String::new();
		if let Some(plan) = &self.plan {
			for (i, lp) in plan.lcores().iter().enumerate() {
				let _ = writeln!(out, "\n############### dp lcore id: {} ###############", i);
				let _ = writeln!(out, "lcore id: {}", lp.id);
				let _ = writeln!(out, "type: {}", lp.role);
				for p in lp.tx_ports.iter() {
					let _ = writeln!(out, "\ttx port {:3}", p);
				}
			}
		}
		for (addr, port) in self.routes.iter() {
			let _ = writeln!(out, "rule {}/32 -> port {}", Ipv4Addr::from(*addr), port);
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		apis::{Mempool, Nic, SoftNic},
		config::{Datapath, LcoreInfo},
		stats::Stats,
		testutil::{tcp_frame, udp_frame},
	};
	use std::sync::{atomic::AtomicBool, Arc};

	struct Bench {
		nic: Arc<SoftNic>,
		stats: Arc<Stats>,
		dp: VoqHwq,
		confs: Vec<PortConf>,
		workers: Vec<TxQueueLcore>,
		clock: Instant,
	}

	impl Bench {
		/// two ports on socket 0, lcore 0 manages, lcores 1 and 2 own ports 0 and 1
		fn new() -> Self {
			Self::build(true)
		}

		fn build(fdir: bool) -> Self {
			let pool = Mempool::new("voq_hwq_test", 256, 2048).unwrap();
			let nic = Arc::new(SoftNic::new(&[0, 0], pool));
			let stats = Arc::new(Stats::new(2));
			let ctx = PipelineCtx {
				nic: nic.clone(),
				stats: stats.clone(),
				policy: Backpressure::Retry,
				keep_running: Arc::new(AtomicBool::new(true)),
			};
			let cfg = SwitchConfig {
				datapath: Datapath::VoqHwq,
				port_sockets: vec![0, 0],
				lcores: (0..3).map(|id| LcoreInfo { id, socket: 0 }).collect(),
				pin_threads: false,
				..SwitchConfig::default()
			};
			let mut dp = VoqHwq::new(cfg, ctx);
			let mut confs = vec![PortConf::default(); 2];
			dp.init(&mut confs).unwrap();
			for (p, conf) in confs.iter().enumerate() {
				let small = PortConf {
					nb_rxd: 128,
					nb_txd: 128,
					..conf.clone()
				};
				nic.configure(p as u16, &small).unwrap();
				nic.start(p as u16).unwrap();
				if fdir {
					nic.set_fdir_masks(p as u16, &FdirMasks::DST_IP).unwrap();
				}
			}
			dp.configure().unwrap();
			if fdir {
				dp.install_default_tables().unwrap();
			}
			let workers = dp.take_workers();
			Self {
				nic,
				stats,
				dp,
				confs,
				workers,
				clock: Instant::now(),
			}
		}

		fn poll(&mut self, step: Duration) {
			self.clock += step;
			let now = self.clock;
			for w in self.workers.iter_mut() {
				w.poll(now);
			}
		}
	}

	#[test]
	fn init_gives_every_port_a_queue_per_output() {
		let b = Bench::new();
		for conf in b.confs.iter() {
			assert_eq!(conf.nb_rxq, 2);
			assert_eq!(conf.nb_txq, 1);
			assert_eq!(conf.nb_rxd, NB_RXD);
			assert_eq!(conf.fdir_masks, Some(FdirMasks::DST_IP));
		}
		assert_eq!(b.workers.len(), 2);
		assert_eq!(b.workers[0].ports, vec![0]);
		assert_eq!(b.workers[1].ports, vec![1]);
		// 20.1.7.1 -> 0 and 20.1.8.1 -> 1 on both ports
		assert_eq!(b.nic.fdir_filters(0).len(), 2);
		assert_eq!(b.nic.fdir_filters(1).len(), 2);
		assert_eq!(b.dp.routes().len(), 2);
	}

	#[test]
	fn forwards_by_destination_filter() {
		let mut b = Bench::new();
		let to_one = tcp_frame([10, 0, 0, 1], 1000, [20, 1, 8, 1], 2000, None);
		assert_eq!(b.nic.inject(0, &to_one), Ok(1));
		assert_eq!(b.nic.inject(1, &udp_frame([10, 0, 0, 2], [20, 1, 7, 1])), Ok(0));
		b.poll(Duration::from_micros(0));

		let sent = b.nic.drain_tx(1, TXQ);
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].fdir_id, Some(1));
		assert_eq!(sent[0].data(), &to_one[..]);
		assert_eq!(b.nic.drain_tx(0, TXQ).len(), 1);
		assert_eq!(b.stats.rx(0, 1).total_packets, 1);
		assert_eq!(b.stats.tx(1, TXQ).total_packets, 1);
	}

	#[test]
	fn queues_wait_for_the_poll_interval_unless_full() {
		let mut b = Bench::new();
		let frame = tcp_frame([10, 0, 0, 1], 1000, [20, 1, 8, 1], 2000, None);
		b.poll(Duration::from_micros(0));

		b.nic.inject(0, &frame).unwrap();
		b.poll(Duration::from_micros(10));
		assert!(b.nic.drain_tx(1, TXQ).is_empty());
		b.poll(Duration::from_micros(40));
		assert_eq!(b.nic.drain_tx(1, TXQ).len(), 1);

		for _ in 0..40 {
			b.nic.inject(0, &frame).unwrap();
		}
		b.poll(Duration::from_micros(50));
		assert_eq!(b.nic.drain_tx(1, TXQ).len(), RX_BURST_MAX);
		// the full burst kept the gate open
		b.poll(Duration::from_micros(1));
		assert_eq!(b.nic.drain_tx(1, TXQ).len(), 8);
		b.nic.inject(0, &frame).unwrap();
		b.poll(Duration::from_micros(1));
		assert!(b.nic.drain_tx(1, TXQ).is_empty());
	}

	#[test]
	fn unmatched_frames_leave_through_port_zero() {
		let mut b = Bench::new();
		let frame = tcp_frame([10, 0, 0, 1], 1000, [30, 0, 0, 1], 2000, None);
		assert_eq!(b.nic.inject(1, &frame), Ok(0));
		b.poll(Duration::from_micros(0));
		assert_eq!(b.nic.drain_tx(0, TXQ).len(), 1);
		assert!(b.nic.drain_tx(1, TXQ).is_empty());
	}

	#[test]
	fn only_host_routes_are_installed() {
		let mut b = Bench::new();
		let net = u32::from(Ipv4Addr::new(30, 0, 0, 0));
		assert!(matches!(
			b.dp.add_ipv4_rule(net, 8, 1),
			Err(DpError::Port(PortError::Invalid(_)))
		));
		assert!(matches!(
			b.dp.add_ipv4_rule(net, 32, 2),
			Err(DpError::Port(PortError::NoDevice(2)))
		));

		let host = u32::from(Ipv4Addr::new(30, 0, 0, 1));
		b.dp.add_ipv4_rule(host, 32, 1).unwrap();
		let steered = b.nic.fdir_filters(0);
		assert!(steered.iter().any(|&(f, id, q)| f.dst_ip == host && id == 2 && q == 1));
		assert!(b.dp.dump().contains("rule 30.0.0.1/32 -> port 1"));
		assert!(b.dp.dump().contains("type: tx queue"));
		assert!(matches!(b.dp.release_flow(0, 0), Err(DpError::Unsupported(_))));
	}

	#[test]
	fn failed_filters_are_counted_on_every_port() {
		let mut b = Bench::build(false);
		let host = u32::from(Ipv4Addr::new(20, 1, 8, 1));
		assert!(matches!(
			b.dp.add_ipv4_rule(host, 32, 1),
			Err(DpError::Port(PortError::Invalid(_)))
		));
		assert_eq!(b.stats.nb_filter_failures(), 2);
		assert!(b.dp.routes().is_empty());
	}
}
