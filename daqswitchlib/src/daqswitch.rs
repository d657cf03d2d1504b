//! Lifecycle of the switch
//!
//! `DaqSwitch` owns the NIC, the statistics, the per-port configuration and the datapath. It is
//! driven init -> configure -> start and finally stop. Each step runs once, in this order.

use std::{
	fmt::Write,
	net::Ipv4Addr,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread,
	time::Duration,
};
use thiserror::Error;
use voq_ring::RingError;

use crate::{
	apis::{FdirMasks, FlowCtrl, MemoryError, Mempool, Nic, PortConf, PortError, SoftNic},
	config::{Datapath, SwitchConfig},
	dp::{
		oq_hwq::OqHwq, voq_hwq::VoqHwq, voq_swq::VoqSwq, Dataplane, DpError, LcoreError,
		LcorePlan, LcoreThread,
	},
	pipeline::{PipelineCtx, PipelineError},
	stats::{Stats, StatsSnapshot},
};

#[derive(Error, Debug)]
pub enum SwitchError {
	#[error("switch is already initialized")]
	AlreadyInitialized,
	#[error("switch is not initialized")]
	NotInitialized,
	#[error("switch is already configured")]
	AlreadyConfigured,
	#[error("switch is not configured")]
	NotConfigured,
	#[error("switch is already started")]
	AlreadyStarted,
	#[error("switch is not started")]
	NotStarted,
	#[error("invalid configuration: {}", _0)]
	InvalidConfig(String),
	#[error("port: {}", _0)]
	Port(PortError),
	#[error("datapath: {}", _0)]
	Dp(DpError),
	#[error("memory: {}", _0)]
	Memory(MemoryError),
}

impl From<PortError> for SwitchError {
	fn from(err: PortError) -> Self {
		SwitchError::Port(err)
	}
}

impl From<DpError> for SwitchError {
	fn from(err: DpError) -> Self {
		SwitchError::Dp(err)
	}
}

impl From<LcoreError> for SwitchError {
	fn from(err: LcoreError) -> Self {
		SwitchError::Dp(DpError::Lcore(err))
	}
}

impl From<PipelineError> for SwitchError {
	fn from(err: PipelineError) -> Self {
		SwitchError::Dp(DpError::Pipeline(err))
	}
}

impl From<RingError> for SwitchError {
	fn from(err: RingError) -> Self {
		SwitchError::Dp(DpError::Ring(err))
	}
}

impl From<MemoryError> for SwitchError {
	fn from(err: MemoryError) -> Self {
		SwitchError::Memory(err)
	}
}

pub struct DaqSwitch {
	cfg: SwitchConfig,
	nic: Arc<dyn Nic>,
	stats: Arc<Stats>,
	keep_running: Arc<AtomicBool>,
	port_confs: Vec<PortConf>,
	dp: Box<dyn Dataplane>,
	threads: Vec<LcoreThread>,
	/// rules added at runtime, as (address, depth, port)
	routes: Vec<(u32, u8, u16)>,
	initialized: bool,
	configured: bool,
	started: bool,
}

impl DaqSwitch {
	pub const LINK_CHECK_INTERVAL: Duration = Duration::from_millis(100);
	/// 9 s in total
	pub const LINK_CHECK_ROUNDS: u32 = 90;

	pub fn new(cfg: SwitchConfig, nic: Arc<dyn Nic>) -> Result<Self, SwitchError> {
		cfg.validate()?;
		if nic.nb_ports() < cfg.nb_ports() {
			return Err(SwitchError::InvalidConfig(format!(
				"{} ports configured, the NIC has {}",
				cfg.nb_ports(),
				nic.nb_ports()
			)));
		}
		let stats = Arc::new(Stats::new(cfg.nb_ports()));
		let keep_running = Arc::new(AtomicBool::new(true));
		let ctx = PipelineCtx {
			nic: nic.clone(),
			stats: stats.clone(),
			policy: cfg.backpressure,
			keep_running: keep_running.clone(),
		};
		let dp: Box<dyn Dataplane> = match cfg.datapath {
			Datapath::VoqSwq => Box::new(VoqSwq::new(cfg.clone(), ctx)),
			Datapath::OqHwq => Box::new(OqHwq::new(cfg.clone(), ctx)),
			Datapath::VoqHwq => Box::new(VoqHwq::new(cfg.clone(), ctx)),
		};
		log::info!(
			"{} datapath, {} ports, {} lcores",
			dp.name(),
			cfg.nb_ports(),
			cfg.lcores.len()
		);
		Ok(Self {
			cfg,
			nic,
			stats,
			keep_running,
			port_confs: Vec::new(),
			dp,
			threads: Vec::new(),
			routes: Vec::new(),
			initialized: false,
			configured: false,
			started: false,
		})
	}

	/// A switch on an in-memory NIC with one port per configured socket
	pub fn with_soft_nic(cfg: SwitchConfig) -> Result<(Self, Arc<SoftNic>), SwitchError> {
		let pool = Mempool::new("mbuf_pool", cfg.nb_mbufs, Mempool::RX_MBUF_DATA_SIZE)?;
		let nic = Arc::new(SoftNic::new(&cfg.port_sockets, pool));
		let switch = Self::new(cfg, nic.clone())?;
		Ok((switch, nic))
	}

	pub fn config(&self) -> &SwitchConfig {
		&self.cfg
	}

	pub fn nic(&self) -> &Arc<dyn Nic> {
		&self.nic
	}

	pub fn stats(&self) -> &Arc<Stats> {
		&self.stats
	}

	pub fn stats_snapshot(&self) -> StatsSnapshot {
		self.stats.snapshot(self.nic.as_ref())
	}

	pub fn stats_reset(&self) {
		self.stats.reset(self.nic.as_ref());
	}

	/// Flag shared with every lcore, clearing it stops them
	pub fn keep_running(&self) -> Arc<AtomicBool> {
		self.keep_running.clone()
	}

	pub fn plan(&self) -> Option<&LcorePlan> {
		self.dp.plan()
	}

	pub fn is_started(&self) -> bool {
		self.started
	}

	pub fn init(&mut self) -> Result<(), SwitchError> {
		if self.initialized {
			return Err(SwitchError::AlreadyInitialized);
		}
		log::info!("initializing ports...");
		self.port_confs = vec![PortConf::default(); self.cfg.nb_ports() as usize];
		self.dp.init(&mut self.port_confs)?;
		self.initialized = true;
		Ok(())
	}

	fn port_conf_mut(&mut self, port: u16) -> Result<&mut PortConf, SwitchError> {
		if !self.initialized {
			return Err(SwitchError::NotInitialized);
		}
		if self.configured {
			return Err(SwitchError::AlreadyConfigured);
		}
		self.port_confs
			.get_mut(port as usize)
			.ok_or(SwitchError::Port(PortError::NoDevice(port)))
	}

	pub fn port_conf(&self, port: u16) -> Option<&PortConf> {
		self.port_confs.get(port as usize)
	}

	pub fn set_port_queues(
		&mut self,
		port: u16,
		nb_rxq: u16,
		nb_txq: u16,
	) -> Result<(), SwitchError> {
		let conf = self.port_conf_mut(port)?;
		conf.nb_rxq = nb_rxq;
		conf.nb_txq = nb_txq;
		Ok(())
	}

	pub fn set_port_descriptors(
		&mut self,
		port: u16,
		nb_rxd: u16,
		nb_txd: u16,
	) -> Result<(), SwitchError> {
		let conf = self.port_conf_mut(port)?;
		conf.nb_rxd = nb_rxd;
		conf.nb_txd = nb_txd;
		Ok(())
	}

	pub fn set_port_fdir_masks(
		&mut self,
		port: u16,
		masks: Option<FdirMasks>,
	) -> Result<(), SwitchError> {
		self.port_conf_mut(port)?.fdir_masks = masks;
		Ok(())
	}

	pub fn configure(&mut self) -> Result<(), SwitchError> {
		if self.configured {
			return Err(SwitchError::AlreadyConfigured);
		}
		if !self.initialized {
			return Err(SwitchError::NotInitialized);
		}
		log::info!("configuring lcores...");
		self.dp.configure()?;
		log::info!("configuring ports...");
		for (port, conf) in self.port_confs.iter().enumerate() {
			self.nic.configure(port as u16, conf)?;
		}
		self.configured = true;
		Ok(())
	}

	fn start_ports(&self) -> Result<(), SwitchError> {
		for (port, conf) in self.port_confs.iter().enumerate() {
			let port = port as u16;
			self.nic.start(port)?;
			if let Err(e) = self.nic.set_flow_ctrl(port, &FlowCtrl::default()) {
				log::warn!("port {}: cannot set flow control: {}", port, e);
			}
			if let Some(masks) = &conf.fdir_masks {
				self.nic.set_fdir_masks(port, masks)?;
			}
		}
		self.wait_for_links();
		Ok(())
	}

	/// Wait until every link is up or the check times out, then log the link states
	fn wait_for_links(&self) {
		let nb_ports = self.cfg.nb_ports();
		log::info!("checking link status...");
		for _ in 0..Self::LINK_CHECK_ROUNDS {
			if (0..nb_ports).all(|p| self.nic.link_up(p)) {
				break;
			}
			thread::sleep(Self::LINK_CHECK_INTERVAL);
		}
		for p in 0..nb_ports {
			if self.nic.link_up(p) {
				log::info!("port {} link up", p);
			} else {
				log::warn!("port {} link down", p);
			}
		}
	}

	pub fn start(&mut self) -> Result<(), SwitchError> {
		if self.started {
			return Err(SwitchError::AlreadyStarted);
		}
		if !self.configured {
			return Err(SwitchError::NotConfigured);
		}
		log::info!("starting ports...");
		self.start_ports()?;
		self.keep_running.store(true, Ordering::SeqCst);
		self.threads = self.dp.launch()?;
		self.started = true;
		log::info!("installing default forwarding table...");
		self.dp.install_default_tables()?;
		Ok(())
	}

	/// Stop every lcore and wait for its thread
	pub fn stop(&mut self) -> Result<(), SwitchError> {
		if !self.started {
			return Err(SwitchError::NotStarted);
		}
		self.keep_running.store(false, Ordering::SeqCst);
		for t in self.threads.drain(..) {
			if t.handle.join().is_err() {
				log::error!("lcore {} panicked", t.lcore);
			}
		}
		self.started = false;
		log::info!("switch stopped");
		Ok(())
	}

	/// Route `ip/depth` to `port` at runtime
	pub fn ipv4_flow_add(&mut self, ip: Ipv4Addr, depth: u8, port: u16) -> Result<(), SwitchError> {
		if !self.started {
			return Err(SwitchError::NotStarted);
		}
		if port >= self.cfg.nb_ports() {
			return Err(SwitchError::Port(PortError::NoDevice(port)));
		}
		let addr = u32::from(ip);
		self.dp.add_ipv4_rule(addr, depth, port)?;
		self.routes.push((addr, depth, port));
		Ok(())
	}

	/// The rules added at runtime
	pub fn ipv4_flow_dump(&self) -> String {
		let mut out = String::new();
		for (i, (addr, depth, port)) in self.routes.iter().enumerate() {
			let _ = writeln!(out, "{:4}: {}/{} -> port {}", i, Ipv4Addr::from(*addr), depth, port);
		}
		out
	}

	pub fn release_flow(&mut self, port: u16, slot: usize) -> Result<(), SwitchError> {
		if !self.started {
			return Err(SwitchError::NotStarted);
		}
		self.dp.release_flow(port, slot)?;
		Ok(())
	}

	/// Lcores, their ports and the data flows
	pub fn dump(&self) -> String {
		self.dp.dump()
	}

	/// Flow director counters of every port
	pub fn dump_fdir(&self) -> String {
		let mut out = String::new();
		for port in 0..self.cfg.nb_ports() {
			match self.nic.fdir_info(port) {
				Ok(info) => {
					let _ = writeln!(
						out,
						"port {:3}: free {:6} add {:8} remove {:8} f_add {:6} f_remove {:6} collision {:6}",
						port,
						info.free,
						info.add,
						info.remove,
						info.f_add,
						info.f_remove,
						info.collision
					);
				}
				Err(e) => {
					let _ = writeln!(out, "port {:3}: {}", port, e);
				}
			}
		}
		out
	}
}

impl Drop for DaqSwitch {
	fn drop(&mut self) {
		if self.started {
			let _ = self.stop();
		}
	}
}
