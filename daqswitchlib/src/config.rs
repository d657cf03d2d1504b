//! Switch wide configuration

use std::{fmt, str::FromStr, time::Duration};

use crate::{apis::Mempool, daqswitch::SwitchError};

/// Which datapath the switch runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Datapath {
	/// software virtual output queues, one ring per data flow
	VoqSwq,
	/// straight LPM forwarding on hardware queues
	OqHwq,
	/// flow director steering into one hardware queue per output port
	VoqHwq,
}

impl FromStr for Datapath {
	type Err = SwitchError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"voq_swq" => Ok(Datapath::VoqSwq),
			"oq_hwq" => Ok(Datapath::OqHwq),
			"voq_hwq" => Ok(Datapath::VoqHwq),
			_ => Err(SwitchError::InvalidConfig(format!("unknown datapath {}", s))),
		}
	}
}

impl fmt::Display for Datapath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Datapath::VoqSwq => write!(f, "voq_swq"),
			Datapath::OqHwq => write!(f, "oq_hwq"),
			Datapath::VoqHwq => write!(f, "voq_hwq"),
		}
	}
}

/// What a sender does with packets a full ring or queue did not take
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backpressure {
	/// busy retry until everything is placed
	Retry,
	/// free what did not fit
	Lossy,
}

impl Default for Backpressure {
	fn default() -> Self {
		if cfg!(feature = "lossy") {
			Backpressure::Lossy
		} else {
			Backpressure::Retry
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LcoreInfo {
	pub id: u32,
	pub socket: u32,
}

#[derive(Clone, Debug)]
pub struct SwitchConfig {
	pub datapath: Datapath,
	/// NUMA socket of every port, the port count is its length
	pub port_sockets: Vec<u32>,
	pub lcores: Vec<LcoreInfo>,
	/// never gets a datapath role
	pub management_lcore: u32,
	pub rx_poll_interval: Duration,
	pub tx_drain_interval: Duration,
	pub default_run_interval: Duration,
	pub ring_size: usize,
	pub nb_mbufs: usize,
	pub backpressure: Backpressure,
	/// zero disables flow aging
	pub flow_idle_timeout: Duration,
	pub stats_interval: Duration,
	pub cli_enabled: bool,
	/// pin every datapath thread to its core
	pub pin_threads: bool,
}

impl SwitchConfig {
	pub const RX_POLL_INTERVAL_US: u64 = 100;
	pub const TX_DRAIN_INTERVAL_US: u64 = 10;
	pub const DEFAULT_RUN_INTERVAL_US: u64 = 200;
	pub const RING_SIZE: usize = 4096;
	pub const FLOW_IDLE_TIMEOUT_S: u64 = 30;
	pub const STATS_INTERVAL_S: u64 = 30;

	/// `nb_ports` ports and `nb_lcores` cores, all on socket 0
	pub fn new(nb_ports: u16, nb_lcores: u32) -> Self {
		Self {
			port_sockets: vec![0; nb_ports as usize],
			lcores: (0..nb_lcores).map(|id| LcoreInfo { id, socket: 0 }).collect(),
			..Self::default()
		}
	}

	#[inline]
	pub fn nb_ports(&self) -> u16 {
		self.port_sockets.len() as u16
	}

	pub fn validate(&self) -> Result<(), SwitchError> {
		if self.port_sockets.is_empty() {
			return Err(SwitchError::InvalidConfig("no ports".into()));
		}
		if !self.ring_size.is_power_of_two() {
			return Err(SwitchError::InvalidConfig(format!(
				"ring size {} is not a power of two",
				self.ring_size
			)));
		}
		if self.nb_mbufs == 0 {
			return Err(SwitchError::InvalidConfig("no packet buffers".into()));
		}
		let mut ids: Vec<u32> = self.lcores.iter().map(|l| l.id).collect();
		ids.sort_unstable();
		ids.dedup();
		if ids.len() != self.lcores.len() {
			return Err(SwitchError::InvalidConfig("lcore listed twice".into()));
		}
		Ok(())
	}
}

impl Default for SwitchConfig {
	fn default() -> Self {
		Self {
			datapath: Datapath::VoqSwq,
			port_sockets: Vec::new(),
			lcores: Vec::new(),
			management_lcore: 0,
			rx_poll_interval: Duration::from_micros(Self::RX_POLL_INTERVAL_US),
			tx_drain_interval: Duration::from_micros(Self::TX_DRAIN_INTERVAL_US),
			default_run_interval: Duration::from_micros(Self::DEFAULT_RUN_INTERVAL_US),
			ring_size: Self::RING_SIZE,
			nb_mbufs: Mempool::NUM_MBUFS,
			backpressure: Backpressure::default(),
			flow_idle_timeout: Duration::from_secs(Self::FLOW_IDLE_TIMEOUT_S),
			stats_interval: Duration::from_secs(Self::STATS_INTERVAL_S),
			cli_enabled: true,
			pin_threads: true,
		}
	}
}
