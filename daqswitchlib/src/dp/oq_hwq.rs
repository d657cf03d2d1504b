//! Output queues in hardware
//!
//! Every lcore polls queue 0 of its ports, looks the destination up in a shared LPM table and
//! transmits on its own tx queue of the output port. Nothing is buffered in software beyond a
//! small per-port tx buffer. Misses and non IPv4 frames leave through the ingress port.

use byteorder::{BigEndian, ByteOrder};
use crossbeam::sync::ShardedLock;
use std::{
	fmt::Write,
	net::Ipv4Addr,
	sync::Arc,
	time::{Duration, Instant},
};

use super::{
	default_ipv4_rules, keep_running, spawn_lcore, Dataplane, DpError, LcoreParams, LcorePlan,
	LcoreThread,
};
use crate::{
	apis::{Mbuf, PortConf, RX_BURST_MAX},
	config::SwitchConfig,
	flow::FlowKey,
	lpm::Lpm,
	pipeline::PipelineCtx,
	sched::delay,
};

pub const NB_RXD: u16 = 2048;
pub const NB_TXD: u16 = 4096;
pub const RXQ: u16 = 0;
pub const LPM_RULES_MAX: usize = 1024;

/// Destination address to output port
pub type SharedLpm = Arc<ShardedLock<Lpm<u16>>>;

#[inline]
fn is_ipv4(frame: &[u8]) -> bool {
	frame.len() >= 14 && BigEndian::read_u16(&frame[12..14]) == FlowKey::ETHERTYPE_IPV4
}

pub struct ForwardLcore {
	id: u32,
	/// tx queue owned by this lcore on every port
	txq: u16,
	ports: Vec<u16>,
	lpm: SharedLpm,
	ctx: PipelineCtx,
	drain_interval: Duration,
	last_drain: Option<Instant>,
	tx_bufs: Vec<Vec<Mbuf>>,
	/// packets of the current burst per output port
	groups: Vec<Vec<Mbuf>>,
	burst: Vec<Mbuf>,
	/// the four packets looked up together
	quad: Vec<Mbuf>,
}

impl ForwardLcore {
	pub const TX_BUFFER_SIZE: usize = 32;
	/// a group at least this large skips an empty tx buffer
	pub const DIRECT_TX_MIN: usize = 16;
	pub const RETRY_DELAY: Duration = Duration::from_micros(10);

	pub fn new(
		lp: &LcoreParams,
		txq: u16,
		nb_ports: u16,
		lpm: SharedLpm,
		ctx: PipelineCtx,
		drain_interval: Duration,
	) -> Self {
		let n = nb_ports as usize;
		Self {
			id: lp.id,
			txq,
			ports: lp.rx_ports.iter().map(|p| p.port_id).collect(),
			lpm,
			ctx,
			drain_interval,
			last_drain: None,
			tx_bufs: (0..n).map(|_| Vec::with_capacity(Self::TX_BUFFER_SIZE)).collect(),
			groups: (0..n).map(|_| Vec::with_capacity(RX_BURST_MAX)).collect(),
			burst: Vec::with_capacity(RX_BURST_MAX),
			quad: Vec::with_capacity(4),
		}
	}

	#[inline]
	pub fn id(&self) -> u32 {
		self.id
	}

	/// Transmit all of `pkts`, retrying while the queue is full
	fn send_all(ctx: &PipelineCtx, port: u16, txq: u16, pkts: &mut Vec<Mbuf>) {
		loop {
			let sent = ctx.nic.tx_burst(port, txq, pkts);
			ctx.stats.tx_burst(port, txq, sent);
			if pkts.is_empty() {
				return;
			}
			if !keep_running(ctx) {
				break;
			}
			delay(Self::RETRY_DELAY);
		}
		ctx.stats.dropped(pkts.len());
		pkts.clear();
	}

	fn drain(&mut self) {
		for (port, buf) in self.tx_bufs.iter_mut().enumerate() {
			if !buf.is_empty() {
				Self::send_all(&self.ctx, port as u16, self.txq, buf);
			}
		}
	}

	/// Output port of every packet of the burst, misses go back to `ingress`
	fn route(&mut self, ingress: u16) {
		let ForwardLcore {
			lpm,
			ctx,
			groups,
			burst,
			quad,
			..
		} = self;
		let lpm = match lpm.read() {
			Ok(l) => l,
			Err(p_err) => p_err.into_inner(),
		};
		let mut dropped = 0;
		let mut pkts = burst.drain(..);
		loop {
			quad.extend(pkts.by_ref().take(4));
			if quad.is_empty() {
				break;
			}
			let mut ips = [0u32; 4];
			let mut ipv4 = [false; 4];
			for (i, m) in quad.iter().enumerate() {
				ipv4[i] = is_ipv4(m.data());
				if ipv4[i] {
					ips[i] = FlowKey::parse(m.data()).dip;
				}
			}
			let out = lpm.lookup_x4(ips, [ingress; 4]);
			for (i, m) in quad.drain(..).enumerate() {
				let port = if ipv4[i] { out[i] } else { ingress };
				match groups.get_mut(port as usize) {
					Some(g) => g.push(m),
					None => dropped += 1,
				}
			}
		}
		if dropped > 0 {
			ctx.stats.dropped(dropped);
		}
	}

	/// Move the routed groups to the tx buffers or straight to the ports
	fn flush_groups(&mut self) {
		let ForwardLcore {
			ctx,
			txq,
			tx_bufs,
			groups,
			..
		} = self;
		for (port, (group, buf)) in groups.iter_mut().zip(tx_bufs.iter_mut()).enumerate() {
			if group.is_empty() {
				continue;
			}
			if group.len() >= Self::DIRECT_TX_MIN && buf.is_empty() {
				Self::send_all(ctx, port as u16, *txq, group);
				continue;
			}
			for m in group.drain(..) {
				buf.push(m);
				if buf.len() == Self::TX_BUFFER_SIZE {
					Self::send_all(ctx, port as u16, *txq, buf);
				}
			}
		}
	}

	/// Drain the tx buffers if due, then one burst from each port
	pub fn poll(&mut self, now: Instant) -> usize {
		let due = match self.last_drain {
			Some(last) => now.saturating_duration_since(last) >= self.drain_interval,
			None => true,
		};
		if due {
			self.drain();
			self.last_drain = Some(now);
		}

		let mut total = 0;
		for i in 0..self.ports.len() {
			let port = self.ports[i];
			self.burst.clear();
			let n = self.ctx.nic.rx_burst(port, RXQ, &mut self.burst, RX_BURST_MAX);
			if n == 0 {
				continue;
			}
			self.ctx.stats.rx_burst(port, RXQ, n);
			total += n;
			self.route(port);
			self.flush_groups();
		}
		total
	}

	pub fn run(mut self) {
		log::info!(
			"lcore {}: forward, tx queue {}, ports {:?}, entering main loop",
			self.id,
			self.txq,
			self.ports
		);
		while keep_running(&self.ctx) {
			self.poll(Instant::now());
		}
		self.drain();
		log::info!("lcore {}: forward, leaving main loop", self.id);
	}
}

pub struct OqHwq {
	cfg: SwitchConfig,
	ctx: PipelineCtx,
	lpm: SharedLpm,
	plan: Option<LcorePlan>,
	workers: Vec<ForwardLcore>,
}

impl OqHwq {
	pub fn new(cfg: SwitchConfig, ctx: PipelineCtx) -> Self {
		Self {
			cfg,
			ctx,
			lpm: Arc::new(ShardedLock::new(Lpm::new(LPM_RULES_MAX))),
			plan: None,
			workers: Vec::new(),
		}
	}

	pub fn lpm(&self) -> &SharedLpm {
		&self.lpm
	}

	/// The configured loops, for running them by hand
	pub fn take_workers(&mut self) -> Vec<ForwardLcore> {
		std::mem::take(&mut self.workers)
	}
}

impl Dataplane for OqHwq {
	fn name(&self) -> &'static str {
		"oq_hwq"
	}

	fn init(&mut self, ports: &mut [PortConf]) -> Result<(), DpError> {
		log::info!("initializing lcores...");
		let plan = LcorePlan::oq_hwq(&self.cfg)?;
		for conf in ports.iter_mut() {
			conf.nb_rxq = 1;
			conf.nb_txq = plan.len() as u16;
			conf.nb_rxd = NB_RXD;
			conf.nb_txd = NB_TXD;
			conf.fdir_masks = None;
		}
		self.plan = Some(plan);
		Ok(())
	}

	fn configure(&mut self) -> Result<(), DpError> {
		let plan = self.plan.as_ref().ok_or(DpError::NotInitialized)?;
		let mut workers = Vec::new();
		for (idx, lp) in plan.lcores().iter().enumerate() {
			if lp.rx_ports.is_empty() {
				log::debug!("lcore {} has no ports, nothing to configure", lp.id);
				continue;
			}
			log::debug!("lcore {} forward, configuring...", lp.id);
			workers.push(ForwardLcore::new(
				lp,
				idx as u16,
				self.cfg.nb_ports(),
				self.lpm.clone(),
				self.ctx.clone(),
				self.cfg.tx_drain_interval,
			));
		}
		self.workers = workers;
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

	fn add_ipv4_rule(&mut self, addr: u32, depth: u8, port: u16) -> Result<(), DpError> {
		let mut lpm = match self.lpm.write() {
			Ok(l) => l,
			Err(p_err) => p_err.into_inner(),
		};
		lpm.insert(addr, depth, port)?;
		log::debug!("rule {}/{} -> port {}", Ipv4Addr::from(addr), depth, port);
		Ok(())
	}

	fn release_flow(&mut self, _port: u16, _slot: usize) -> Result<(), DpError> {
		Err(DpError::Unsupported("oq_hwq"))
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
				let _ = writeln!(out, "tx queue: {}", i);
				for p in lp.rx_ports.iter() {
					let _ = writeln!(out, "\tport_id {:3}", p.port_id);
				}
			}
		}
		let lpm = match self.lpm.read() {
			Ok(l) => l,
			Err(p_err) => p_err.into_inner(),
		};
		for (addr, depth, port) in lpm.rules() {
			let _ = writeln!(out, "rule {}/{} -> port {}", Ipv4Addr::from(addr), depth, port);
		}
		out
	}
}
