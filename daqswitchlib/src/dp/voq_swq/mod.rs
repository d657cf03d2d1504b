//! Virtual output queues in software
//!
//! Queue 0 of every port carries everything not yet classified. The default lcore forwards it
//! by LPM and, on a fragment request, binds a data flow slot in each direction and steers the
//! flow's packets into a dedicated rx queue with a flow director filter. Data rx lcores move
//! those packets into the slot's ring, data tx lcores drain the rings of active slots onto the
//! request or data tx queue of the slot's port.
//!
//! Queue layout per port:
//! 	rx 0            default
//! 	rx 1 + p        data flows leaving through port p
//! 	tx 0, 1, 2      default, request flows, data flows

mod data_rx;
mod data_tx;
mod default;

pub use data_rx::*;
pub use data_tx::*;
pub use default::*;

use std::{
	fmt::Write,
	net::Ipv4Addr,
	sync::Arc,
	time::Instant,
};
use voq_ring::{Ring, RingType};

use super::{
	default_ipv4_rules, keep_running, spawn_lcore, Dataplane, DpError, LcorePlan, LcoreRole,
	LcoreThread,
};
use crate::{
	apis::{FdirMasks, Mbuf, PortConf},
	config::SwitchConfig,
	flow::{FlowTable, MAX_DATA_FLOWS},
	pipeline::{PipelineCtx, PipelineHandle, PipelineRequest},
	sched::delay,
};

pub const RXQ_DEFAULT: u16 = 0;
pub const RXQ_DATA_MIN: u16 = 1;
pub const TXQ_DEFAULT: u16 = 0;
pub const TXQ_REQ: u16 = 1;
pub const TXQ_DATA: u16 = 2;
pub const NB_TXQ: u16 = 3;
pub const NB_DESC: u16 = 4096;

/// One multi-producer ring per (port, slot)
pub struct VoqRings {
	rings: Vec<Vec<Arc<Ring<Mbuf>>>>,
}

impl VoqRings {
	pub fn new(nb_ports: u16, size: usize) -> Result<Self, DpError> {
		let mut rings = Vec::with_capacity(nb_ports as usize);
		for _ in 0..nb_ports {
			let mut port = Vec::with_capacity(MAX_DATA_FLOWS);
			for _ in 0..MAX_DATA_FLOWS {
				port.push(Arc::new(Ring::new(size, RingType::MpSc)?));
			}
			rings.push(port);
		}
		Ok(Self { rings })
	}

	#[inline]
	pub fn get(&self, port: u16, slot: usize) -> Option<&Arc<Ring<Mbuf>>> {
		self.rings.get(port as usize).and_then(|p| p.get(slot))
	}

	/// Packets waiting in a slot's ring
	pub fn occupancy(&self, port: u16, slot: usize) -> usize {
		self.get(port, slot).map(|r| r.count()).unwrap_or(0)
	}
}

/// The loop run by one lcore
pub enum Worker {
	Default(DefaultLcore),
	DataRx(DataRxLcore),
	DataTx(DataTxLcore),
}

impl Worker {
	pub fn lcore_id(&self) -> u32 {
		match self {
			Worker::Default(w) => w.id(),
			Worker::DataRx(w) => w.id(),
			Worker::DataTx(w) => w.id(),
		}
	}

	/// One iteration of the loop without its pacing delay
	pub fn poll(&mut self, now: Instant) -> usize {
		match self {
			Worker::Default(w) => w.poll(now),
			Worker::DataRx(w) => w.poll(now),
			Worker::DataTx(w) => w.poll(now),
		}
	}

	pub fn run(self) {
		match self {
			Worker::Default(w) => w.run(),
			Worker::DataRx(w) => w.run(),
			Worker::DataTx(w) => w.run(),
		}
	}
}

pub struct VoqSwq {
	cfg: SwitchConfig,
	ctx: PipelineCtx,
	table: Arc<FlowTable>,
	plan: Option<LcorePlan>,
	rings: Option<Arc<VoqRings>>,
	workers: Vec<Worker>,
	default_handle: Option<PipelineHandle>,
	running: bool,
}

impl VoqSwq {
	pub fn new(cfg: SwitchConfig, ctx: PipelineCtx) -> Self {
		let table = Arc::new(FlowTable::new(cfg.nb_ports()));
		Self {
			cfg,
			ctx,
			table,
			plan: None,
			rings: None,
			workers: Vec::new(),
			default_handle: None,
			running: false,
		}
	}

	pub fn flow_table(&self) -> &Arc<FlowTable> {
		&self.table
	}

	pub fn rings(&self) -> Option<&Arc<VoqRings>> {
		self.rings.as_ref()
	}

	/// The configured loops, for running them by hand
	pub fn take_workers(&mut self) -> Vec<Worker> {
		std::mem::take(&mut self.workers)
	}

	fn default_worker(&mut self) -> Option<&mut DefaultLcore> {
		self.workers.iter_mut().find_map(|w| match w {
			Worker::Default(d) => Some(d),
			_ => None,
		})
	}

	fn request(&mut self, req: PipelineRequest) -> Result<(), DpError> {
		if let Some(w) = self.default_worker() {
			return w.serve(req).map_err(DpError::from);
		}
		match &self.default_handle {
			Some(h) if self.running => h.request(req).map_err(DpError::from),
			_ => Err(DpError::NotRunning),
		}
	}
}

impl Dataplane for VoqSwq {
	fn name(&self) -> &'static str {
		"voq_swq"
	}

	fn init(&mut self, ports: &mut [PortConf]) -> Result<(), DpError> {
		let nb_ports = self.cfg.nb_ports();

		log::info!("initializing datapath rings...");
		self.rings = Some(Arc::new(VoqRings::new(nb_ports, self.cfg.ring_size)?));

		log::info!("initializing lcores...");
		self.plan = Some(LcorePlan::voq_swq(&self.cfg)?);

		for conf in ports.iter_mut() {
			conf.nb_rxd = NB_DESC;
			conf.nb_txd = NB_DESC;
			// one rx queue per output port and the default queue
			conf.nb_rxq = nb_ports + 1;
			conf.nb_txq = NB_TXQ;
			conf.fdir_masks = Some(FdirMasks::EXACT);
		}
		Ok(())
	}

	fn configure(&mut self) -> Result<(), DpError> {
		let plan = self.plan.as_ref().ok_or(DpError::NotInitialized)?;
		let rings = self.rings.as_ref().ok_or(DpError::NotInitialized)?;
		let mut workers = Vec::with_capacity(plan.len());
		let mut default_handle = None;

		for lp in plan.lcores() {
			match lp.role {
				LcoreRole::Default => {
					log::debug!("lcore {} default, configuring...", lp.id);
					let detector = FlowDetector::new(
						self.table.clone(),
						rings.clone(),
						&self.ctx,
						self.cfg.flow_idle_timeout,
					);
					let (w, h) = DefaultLcore::new(
						lp,
						self.cfg.nb_ports(),
						self.ctx.clone(),
						detector,
						self.cfg.default_run_interval,
					)?;
					workers.push(Worker::Default(w));
					default_handle = Some(h);
				}
				LcoreRole::DataRx => {
					log::debug!("lcore {} data rx, configuring...", lp.id);
					workers.push(Worker::DataRx(DataRxLcore::new(
						lp,
						rings.clone(),
						self.ctx.clone(),
						self.cfg.rx_poll_interval,
					)));
				}
				LcoreRole::DataTx => {
					log::debug!("lcore {} data tx, configuring...", lp.id);
					workers.push(Worker::DataTx(DataTxLcore::new(
						lp,
						self.table.clone(),
						rings.clone(),
						self.ctx.clone(),
						self.cfg.tx_drain_interval,
					)));
				}
				LcoreRole::Unused | LcoreRole::Forward | LcoreRole::TxQueue => {
					log::debug!("lcore {} disabled, nothing to configure", lp.id);
				}
			}
		}
		self.workers = workers;
		self.default_handle = default_handle;
		Ok(())
	}

	fn launch(&mut self) -> Result<Vec<LcoreThread>, DpError> {
		if self.workers.is_empty() {
			return Err(DpError::NotConfigured);
		}
		let mut threads = Vec::with_capacity(self.workers.len());
		for w in self.take_workers() {
			let lcore = w.lcore_id();
			threads.push(spawn_lcore(lcore, self.cfg.pin_threads, move || w.run())?);
		}
		self.running = true;
		Ok(threads)
	}

	fn install_default_tables(&mut self) -> Result<(), DpError> {
		for (addr, depth, port) in default_ipv4_rules(self.cfg.nb_ports()) {
			self.add_ipv4_rule(addr, depth, port)?;
		}
		Ok(())
	}

	fn add_ipv4_rule(&mut self, addr: u32, depth: u8, port: u16) -> Result<(), DpError> {
		self.request(PipelineRequest::AddIpv4Rule {
			addr,
			depth,
			port_id: port,
		})
	}

	fn release_flow(&mut self, port: u16, slot: usize) -> Result<(), DpError> {
		self.request(PipelineRequest::ReleaseFlow {
			port_id: port,
			slot,
		})
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
				for p in lp.rx_ports.iter() {
					let _ = writeln!(out, "\tport_id {:3}", p.port_id);
				}
				for &p in lp.tx_ports.iter() {
					let _ = writeln!(
						out,
						"\tport_id {:3} active_flows 0x{:X}",
						p,
						self.table.active_flows(p)
					);
				}
			}
		}
		if let Some(rings) = &self.rings {
			out.push_str(&dump_flows(&self.table, rings));
		}
		out
	}
}

const FLOW_TABLE_RULE: &str =
	"+------+-------+----------------+------------+-----------------+-----------------+\n";

/// Slots in use with their peer, sink and ring occupancy
pub fn dump_flows(table: &FlowTable, rings: &VoqRings) -> String {
	let mut out = String::new();
	out.push_str(FLOW_TABLE_RULE);
	out.push_str(
		"| Port | Queue | Destination IP |  Sink Id   | Is request flow | Ring occupancy  |\n",
	);
	out.push_str(FLOW_TABLE_RULE);
	for (port, slot, flow) in table.snapshot() {
		let _ = writeln!(
			out,
			"| {:4} | {:5} | {:>14} | 0x{:08x} | {:>15} | {:15} |",
			port,
			slot,
			Ipv4Addr::from(flow.dest_ip),
			flow.sink_id,
			flow.req_flow as u8,
			rings.occupancy(port, slot)
		);
	}
	out.push_str(FLOW_TABLE_RULE);
	out
}

/// Pause between two iterations of a loop
#[inline]
fn pause(d: std::time::Duration) {
	if d > std::time::Duration::from_secs(0) {
		delay(d);
	}
}
