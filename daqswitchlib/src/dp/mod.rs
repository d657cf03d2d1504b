//! Datapath variants
//!
//! A datapath decides how many queues every port gets, which lcore does what and runs the
//! per-lcore loops. `voq_swq` buffers detected data flows in software rings and drains them onto
//! dedicated tx queues, `oq_hwq` forwards straight from rx to tx queues and `voq_hwq` lets the
//! flow director sort packets into one rx queue per output port.

mod lcore;
pub mod oq_hwq;
pub mod voq_hwq;
pub mod voq_swq;

pub use lcore::*;

use std::{
	net::Ipv4Addr,
	sync::atomic::Ordering,
	thread::{self, JoinHandle},
};
use thiserror::Error;
use voq_ring::RingError;

use crate::{
	apis::{PortConf, PortError},
	lpm::LpmError,
	pipeline::{PipelineCtx, PipelineError},
};

#[derive(Error, Debug)]
pub enum DpError {
	#[error("lcore assignment: {}", _0)]
	Lcore(LcoreError),
	#[error("pipeline: {}", _0)]
	Pipeline(PipelineError),
	#[error("ring: {}", _0)]
	Ring(RingError),
	#[error("port: {}", _0)]
	Port(PortError),
	#[error("forwarding table: {}", _0)]
	Lpm(LpmError),
	#[error("datapath is not initialized")]
	NotInitialized,
	#[error("datapath is not configured")]
	NotConfigured,
	#[error("datapath is not running")]
	NotRunning,
	#[error("operation not supported by the {} datapath", _0)]
	Unsupported(&'static str),
	#[error("cannot spawn thread for lcore {}: {}", _0, _1)]
	Spawn(u32, String),
}

impl From<LcoreError> for DpError {
	fn from(err: LcoreError) -> Self {
		DpError::Lcore(err)
	}
}

impl From<PipelineError> for DpError {
	fn from(err: PipelineError) -> Self {
		DpError::Pipeline(err)
	}
}

impl From<RingError> for DpError {
	fn from(err: RingError) -> Self {
		DpError::Ring(err)
	}
}

impl From<PortError> for DpError {
	fn from(err: PortError) -> Self {
		DpError::Port(err)
	}
}

impl From<LpmError> for DpError {
	fn from(err: LpmError) -> Self {
		DpError::Lpm(err)
	}
}

/// Host routes installed once the datapath runs, as (address, output port)
pub const DEFAULT_IPV4_RULES: [([u8; 4], u16); 12] = [
	([20, 1, 1, 1], 9),
	([20, 1, 2, 1], 8),
	([20, 1, 3, 1], 6),
	([20, 1, 4, 1], 7),
	([20, 1, 5, 1], 2),
	([20, 1, 6, 1], 3),
	([20, 1, 7, 1], 0),
	([20, 1, 8, 1], 1),
	([20, 1, 9, 1], 4),
	([20, 1, 10, 1], 5),
	([20, 1, 11, 1], 10),
	([20, 1, 12, 1], 11),
];

/// Default rules whose port exists, as (address, depth, port)
pub fn default_ipv4_rules(nb_ports: u16) -> Vec<(u32, u8, u16)> {
	DEFAULT_IPV4_RULES
		.iter()
		.filter_map(|&(ip, port)| {
			let addr = Ipv4Addr::from(ip);
			if port < nb_ports {
				Some((u32::from(addr), 32, port))
			} else {
				log::warn!("skipping default route {} -> port {}: no such port", addr, port);
				None
			}
		})
		.collect()
}

/// What the lifecycle drives, in this order: init, configure, launch, install_default_tables
pub trait Dataplane: Send {
	fn name(&self) -> &'static str;

	/// Assign lcores, create rings and size the queues of every port
	fn init(&mut self, ports: &mut [PortConf]) -> Result<(), DpError>;

	/// Build the per-lcore loops
	fn configure(&mut self) -> Result<(), DpError>;

	/// Start one thread per lcore with work
	fn launch(&mut self) -> Result<Vec<LcoreThread>, DpError>;

	fn install_default_tables(&mut self) -> Result<(), DpError>;

	fn add_ipv4_rule(&mut self, addr: u32, depth: u8, port: u16) -> Result<(), DpError>;

	fn release_flow(&mut self, port: u16, slot: usize) -> Result<(), DpError>;

	fn plan(&self) -> Option<&LcorePlan>;

	/// Lcores and flows, for the shell
	fn dump(&self) -> String;
}

pub struct LcoreThread {
	pub lcore: u32,
	pub handle: JoinHandle<()>,
}

/// The loops stop once the run flag drops
#[inline]
pub(crate) fn keep_running(ctx: &PipelineCtx) -> bool {
	ctx.keep_running.load(Ordering::SeqCst)
}

/// Run `f` on a new thread named after `lcore`, pinned to it if asked
pub(crate) fn spawn_lcore<F>(lcore: u32, pin: bool, f: F) -> Result<LcoreThread, DpError>
where
	F: FnOnce() + Send + 'static,
{
	let handle = thread::Builder::new()
		.name(format!("lcore-{}", lcore))
		.spawn(move || {
			if pin {
				if let Err(e) = pin_current_thread(lcore) {
					log::warn!("{}, running unpinned", e);
				}
			}
			f()
		})
		.map_err(|e| DpError::Spawn(lcore, e.to_string()))?;
	Ok(LcoreThread { lcore, handle })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_rules_skip_missing_ports() {
		let rules = default_ipv4_rules(4);
		let ports: Vec<u16> = rules.iter().map(|r| r.2).collect();
		assert_eq!(ports, vec![2, 3, 0, 1]);
		assert_eq!(rules[2].0, u32::from(Ipv4Addr::new(20, 1, 7, 1)));
		assert!(rules.iter().all(|r| r.1 == 32));
		assert_eq!(default_ipv4_rules(12).len(), 12);
	}
}
