//! Lcore roles and the binding of ports to lcores
//!
//! The management lcore never gets a role. Among the others the first one classifies, the rest
//! alternate between data rx and data tx so that both roles exist on every socket with enough
//! lcores. Ports are then handed to the lcores of a role round-robin, preferring lcores on the
//! port's socket.

use std::fmt;
use thiserror::Error;

use crate::{config::SwitchConfig, stats::MAX_QUEUES_PER_PORT};

#[derive(Error, Debug, PartialEq)]
pub enum LcoreError {
	#[error("not enough lcores: {} free, {} needed", _0, _1)]
	NotEnough(usize, usize),
	#[error("no {} lcore left for port {}", _0, _1)]
	NoneLeft(LcoreRole, u16),
	#[error("{} ports, at most {} supported", _0, _1)]
	TooManyPorts(u16, usize),
	#[error("cannot pin thread to lcore {}: os error {}", _0, _1)]
	Affinity(u32, i32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LcoreRole {
	Unused,
	/// classification pipeline on queue 0 of every port
	Default,
	DataRx,
	DataTx,
	/// rx, LPM and tx in one loop
	Forward,
	/// drains the per output port rx queues of every port onto its tx ports
	TxQueue,
}

impl fmt::Display for LcoreRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			LcoreRole::Unused => write!(f, "unused"),
			LcoreRole::Default => write!(f, "default"),
			LcoreRole::DataRx => write!(f, "data rx"),
			LcoreRole::DataTx => write!(f, "data tx"),
			LcoreRole::Forward => write!(f, "forward"),
			LcoreRole::TxQueue => write!(f, "tx queue"),
		}
	}
}

/// An rx queue polled by a data rx lcore and the port its packets leave from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxQueueConf {
	pub queue_id: u16,
	pub out_port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxPortConf {
	pub port_id: u16,
	pub queues: Vec<RxQueueConf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LcoreParams {
	pub id: u32,
	pub socket: u32,
	pub role: LcoreRole,
	pub rx_ports: Vec<RxPortConf>,
	pub tx_ports: Vec<u16>,
}

impl LcoreParams {
	fn new(id: u32, socket: u32) -> Self {
		Self {
			id,
			socket,
			role: LcoreRole::Unused,
			rx_ports: Vec::new(),
			tx_ports: Vec::new(),
		}
	}

	#[inline]
	pub fn nb_ports(&self) -> usize {
		self.rx_ports.len() + self.tx_ports.len()
	}

	/// Every port the lcore serves, in assignment order
	pub fn ports(&self) -> Vec<u16> {
		let mut ports: Vec<u16> = self.rx_ports.iter().map(|p| p.port_id).collect();
		ports.extend_from_slice(&self.tx_ports);
		ports
	}
}

/// Roles and ports of every datapath lcore
#[derive(Clone, Debug, PartialEq)]
pub struct LcorePlan {
	lcores: Vec<LcoreParams>,
}

impl LcorePlan {
	pub const PORTS_PER_LCORE_MAX: usize = 16;
	/// index of the classification lcore in the plan
	pub const DEFAULT_LCORE: usize = 0;

	fn eligible(cfg: &SwitchConfig) -> Vec<LcoreParams> {
		cfg.lcores
			.iter()
			.filter(|l| l.id != cfg.management_lcore)
			.map(|l| LcoreParams::new(l.id, l.socket))
			.collect()
	}

	/// One default lcore, data rx and data tx for the rest
	///
	/// Every port gets one data rx lcore polling one queue per output port and one data tx lcore.
	pub fn voq_swq(cfg: &SwitchConfig) -> Result<Self, LcoreError> {
		let nb_ports = cfg.nb_ports();
		// rx queue 0 is the default queue, data queues follow
		if nb_ports as usize >= MAX_QUEUES_PER_PORT {
			return Err(LcoreError::TooManyPorts(nb_ports, MAX_QUEUES_PER_PORT - 1));
		}
		let mut plan = Self {
			lcores: Self::eligible(cfg),
		};
		if plan.lcores.is_empty() {
			return Err(LcoreError::NotEnough(0, 3));
		}
		plan.lcores[Self::DEFAULT_LCORE].role = LcoreRole::Default;

		let free = plan.lcores.len() - 1;
		if free < 2 {
			return Err(LcoreError::NotEnough(free, 2));
		}
		let n = plan.lcores.len();
		let mut i = Self::DEFAULT_LCORE + 1;
		while i < n {
			plan.lcores[i].role = LcoreRole::DataRx;
			i += 1;
			if i < n {
				plan.lcores[i].role = LcoreRole::DataTx;
				i += 1;
			}
		}

		let mut prev = Self::DEFAULT_LCORE;
		for (port_id, &socket) in cfg.port_sockets.iter().enumerate() {
			let port_id = port_id as u16;
			let idx = plan
				.next_lcore(prev, LcoreRole::DataRx, socket)
				.ok_or(LcoreError::NoneLeft(LcoreRole::DataRx, port_id))?;
			let queues = (0..nb_ports)
				.map(|q| RxQueueConf {
					queue_id: q + 1,
					out_port: q,
				})
				.collect();
			plan.lcores[idx].rx_ports.push(RxPortConf { port_id, queues });
			prev = idx;
		}

		let mut prev = Self::DEFAULT_LCORE;
		for (port_id, &socket) in cfg.port_sockets.iter().enumerate() {
			let port_id = port_id as u16;
			let idx = plan
				.next_lcore(prev, LcoreRole::DataTx, socket)
				.ok_or(LcoreError::NoneLeft(LcoreRole::DataTx, port_id))?;
			plan.lcores[idx].tx_ports.push(port_id);
			prev = idx;
		}

		for lp in plan.lcores.iter() {
			log::info!(
				"lcore {} socket {}: {} ports {:?}",
				lp.id,
				lp.socket,
				lp.role,
				lp.ports()
			);
		}
		Ok(plan)
	}

	/// Every lcore forwards, each port's single rx queue goes to one of them
	pub fn oq_hwq(cfg: &SwitchConfig) -> Result<Self, LcoreError> {
		let mut plan = Self {
			lcores: Self::eligible(cfg),
		};
		if plan.lcores.is_empty() {
			return Err(LcoreError::NotEnough(0, 1));
		}
		for lp in plan.lcores.iter_mut() {
			lp.role = LcoreRole::Forward;
		}
		// the search starts after `prev`, so the first port looks at index 0 first
		let mut prev = plan.lcores.len() - 1;
		for (port_id, &socket) in cfg.port_sockets.iter().enumerate() {
			let port_id = port_id as u16;
			let idx = plan
				.next_lcore(prev, LcoreRole::Forward, socket)
				.ok_or(LcoreError::NoneLeft(LcoreRole::Forward, port_id))?;
			plan.lcores[idx].rx_ports.push(RxPortConf {
				port_id,
				queues: vec![RxQueueConf {
					queue_id: 0,
					out_port: port_id,
				}],
			});
			log::info!("lcore {} polls port {}", plan.lcores[idx].id, port_id);
			prev = idx;
		}
		Ok(plan)
	}

	/// Every lcore owns the tx queue of some ports
	///
	/// Port `p` is fed by rx queue `p` of every port, so an lcore serving `p` polls that queue on
	/// all ports.
	pub fn voq_hwq(cfg: &SwitchConfig) -> Result<Self, LcoreError> {
		let nb_ports = cfg.nb_ports();
		if nb_ports as usize > MAX_QUEUES_PER_PORT {
			return Err(LcoreError::TooManyPorts(nb_ports, MAX_QUEUES_PER_PORT));
		}
		let mut plan = Self {
			lcores: Self::eligible(cfg),
		};
		if plan.lcores.is_empty() {
			return Err(LcoreError::NotEnough(0, 1));
		}
		for lp in plan.lcores.iter_mut() {
			lp.role = LcoreRole::TxQueue;
		}
		let mut prev = plan.lcores.len() - 1;
		for (port_id, &socket) in cfg.port_sockets.iter().enumerate() {
			let port_id = port_id as u16;
			let idx = plan
				.next_lcore(prev, LcoreRole::TxQueue, socket)
				.ok_or(LcoreError::NoneLeft(LcoreRole::TxQueue, port_id))?;
			plan.lcores[idx].tx_ports.push(port_id);
			log::info!("lcore {} transmits on port {}", plan.lcores[idx].id, port_id);
			prev = idx;
		}
		Ok(plan)
	}

	/// Next lcore of `role` after index `prev`, wrapping around and ending with `prev` itself
	///
	/// Lcores on `socket` win, any lcore of the role is taken if none is left there. Lcores
	/// already serving `PORTS_PER_LCORE_MAX` ports are skipped.
	pub fn next_lcore(&self, prev: usize, role: LcoreRole, socket: u32) -> Option<usize> {
		let n = self.lcores.len();
		for numa_ok in [true, false].iter() {
			for i in 0..n {
				let idx = (prev + i + 1) % n;
				let lp = &self.lcores[idx];
				if lp.role == role
					&& lp.nb_ports() < Self::PORTS_PER_LCORE_MAX
					&& (!numa_ok || lp.socket == socket)
				{
					return Some(idx);
				}
			}
			log::debug!("no {} lcore on socket {}, relaxing", role, socket);
		}
		None
	}

	pub fn lcores(&self) -> &[LcoreParams] {
		&self.lcores
	}

	pub fn len(&self) -> usize {
		self.lcores.len()
	}

	pub fn is_empty(&self) -> bool {
		self.lcores.is_empty()
	}

	pub fn with_role(&self, role: LcoreRole) -> impl Iterator<Item = &LcoreParams> {
		self.lcores.iter().filter(move |l| l.role == role)
	}

	/// Data tx lcore serving `port`
	pub fn tx_lcore_of(&self, port: u16) -> Option<&LcoreParams> {
		self.with_role(LcoreRole::DataTx)
			.find(|l| l.tx_ports.contains(&port))
	}
}

/// Pin the calling thread to `lcore`
#[cfg(target_os = "linux")]
pub fn pin_current_thread(lcore: u32) -> Result<(), LcoreError> {
	// Safety: cpu_set_t is plain data and the set outlives the call
	let ret = unsafe {
		let mut set: libc::cpu_set_t = std::mem::zeroed();
		libc::CPU_ZERO(&mut set);
		libc::CPU_SET(lcore as usize, &mut set);
		libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
	};
	if ret != 0 {
		let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
		return Err(LcoreError::Affinity(lcore, errno));
	}
	Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_lcore: u32) -> Result<(), LcoreError> {
	Ok(())
}
