//! A pipeline is the packet processing stage run by one lcore
//!
//! Every pipeline reads bursts from its enabled input ports, classifies them and writes them to its
//! output ports. Ports are either hardware queues of the NIC or software rings. What is allowed
//! where depends on the kind of the pipeline:
//!
//! ```text
//! 	Default  hw inputs, LPM table on the destination address, hw outputs
//! 	RxData   hw inputs sharing one queue id, routed on the flow director id, ring outputs of one port
//! 	TxData   ring inputs of one port, input i goes to output i, hw outputs of the same port
//! ```
//!
//! A pipeline goes Created -> Checked. Ports and rules are attached while Created, `check`
//! validates the wiring and only a checked pipeline runs. Inputs start disabled and are enabled
//! one by one, either directly or through the control channel.

mod msg;

pub use msg::*;

use crossbeam::channel::{Receiver, Sender};
use std::{
	fmt,
	net::Ipv4Addr,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Instant,
};
use thiserror::Error;
use voq_ring::Ring;

use crate::{
	apis::{FdirFilter, Mbuf, Nic, PortError, RX_BURST_MAX, TX_BURST_MAX},
	config::Backpressure,
	flow::{FlowError, FlowKey},
	lpm::{Lpm, LpmError},
	stats::Stats,
};

#[derive(Error, Debug)]
pub enum PipelineError {
	#[error("pipeline of lcore {} is already initialized", _0)]
	AlreadyInUse(u32),
	#[error("invalid port binding: {}", _0)]
	InvalidPortBinding(&'static str),
	#[error("too many ports, at most {}", Pipeline::PORTS_MAX)]
	TooManyPorts,
	#[error("no input port {}:{}", _0, _1)]
	NoSuchInput(u16, u16),
	#[error("no output port {}:{}", _0, _1)]
	NoSuchOutput(u16, u16),
	#[error("operation not supported by a {} pipeline", _0)]
	WrongKind(PipelineKind),
	#[error("pipeline is not checked")]
	NotChecked,
	#[error("pipeline is already checked")]
	AlreadyChecked,
	#[error("inconsistent pipeline: {}", _0)]
	Inconsistent(&'static str),
	#[error("forwarding table: {}", _0)]
	Lpm(LpmError),
	#[error("port: {}", _0)]
	Port(PortError),
	#[error("flow: {}", _0)]
	Flow(FlowError),
	#[error("no response from pipeline")]
	Timeout,
	#[error("pipeline control channel is closed")]
	Disconnected,
}

impl From<LpmError> for PipelineError {
	fn from(err: LpmError) -> Self {
		PipelineError::Lpm(err)
	}
}

impl From<PortError> for PipelineError {
	fn from(err: PortError) -> Self {
		PipelineError::Port(err)
	}
}

impl From<FlowError> for PipelineError {
	fn from(err: FlowError) -> Self {
		PipelineError::Flow(err)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineKind {
	Default,
	RxData,
	TxData,
}

impl fmt::Display for PipelineKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PipelineKind::Default => write!(f, "default"),
			PipelineKind::RxData => write!(f, "data rx"),
			PipelineKind::TxData => write!(f, "data tx"),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
	Created,
	Checked,
}

/// A packet of the current burst that hit the forwarding table
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
	pub key: FlowKey,
	pub ingress: u16,
	pub egress: u16,
}

/// Action run by a default pipeline on the table hits of every burst
pub trait HitAction: Send {
	fn on_hit(&mut self, hits: &[Hit], now: Instant);

	/// Called by the owning lcore between runs
	fn housekeeping(&mut self, _now: Instant) {}

	fn release(&mut self, port: u16, slot: usize) -> Result<(), FlowError>;

	fn dump(&self) -> String {
		String::new()
	}
}

/// What every pipeline shares with the rest of the switch
#[derive(Clone)]
pub struct PipelineCtx {
	pub nic: Arc<dyn Nic>,
	pub stats: Arc<Stats>,
	pub policy: Backpressure,
	pub keep_running: Arc<AtomicBool>,
}

impl PipelineCtx {
	#[inline]
	fn running(&self) -> bool {
		self.keep_running.load(Ordering::Relaxed)
	}
}

#[derive(Clone, Debug)]
pub struct PortIn {
	pub port_id: u16,
	pub queue_id: u16,
	pub ring: Option<Arc<Ring<Mbuf>>>,
	pub enabled: bool,
}

#[derive(Clone, Debug)]
pub struct PortOut {
	pub port_id: u16,
	pub queue_id: u16,
	pub ring: Option<Arc<Ring<Mbuf>>>,
}

enum Stage {
	Default {
		/// destination address to output index
		table: Lpm<usize>,
		action: Option<Box<dyn HitAction>>,
	},
	RxData,
	TxData,
}

struct Control {
	req: Receiver<PipelineRequest>,
	resp: Sender<PipelineResponse>,
}

pub struct Pipeline {
	lcore_id: u32,
	state: PipelineState,
	stage: Stage,
	inputs: Vec<PortIn>,
	outputs: Vec<PortOut>,
	ctx: PipelineCtx,
	ctrl: Option<Control>,
	burst: Vec<Mbuf>,
	routes: Vec<usize>,
	hits: Vec<Hit>,
	out_bufs: Vec<Vec<Mbuf>>,
}

impl Pipeline {
	pub const PORTS_MAX: usize = 64;
	pub const FORWARDING_RULES_MAX: usize = 1024;
	/// Low bits of a flow director id naming the output of an rx data pipeline
	pub const FDIR_OUT_QUEUE_MASK: u32 = 0x3f;
	const DROP: usize = usize::MAX;

	pub fn new(lcore_id: u32, kind: PipelineKind, ctx: PipelineCtx) -> Self {
		let stage = match kind {
			PipelineKind::Default => Stage::Default {
				table: Lpm::new(Self::FORWARDING_RULES_MAX),
				action: None,
			},
			PipelineKind::RxData => Stage::RxData,
			PipelineKind::TxData => Stage::TxData,
		};
		Self {
			lcore_id,
			state: PipelineState::Created,
			stage,
			inputs: Vec::new(),
			outputs: Vec::new(),
			ctx,
			ctrl: None,
			burst: Vec::with_capacity(RX_BURST_MAX),
			routes: Vec::with_capacity(RX_BURST_MAX),
			hits: Vec::with_capacity(RX_BURST_MAX),
			out_bufs: Vec::new(),
		}
	}

	/// Open the control channel of the pipeline
	///
	/// The returned handle is the only way to reach the pipeline once its lcore runs it.
	pub fn init(&mut self) -> Result<PipelineHandle, PipelineError> {
		if self.ctrl.is_some() {
			return Err(PipelineError::AlreadyInUse(self.lcore_id));
		}
		let (handle, req, resp) = PipelineHandle::open(self.lcore_id, self.kind());
		self.ctrl = Some(Control { req, resp });
		Ok(handle)
	}

	pub fn kind(&self) -> PipelineKind {
		match self.stage {
			Stage::Default { .. } => PipelineKind::Default,
			Stage::RxData => PipelineKind::RxData,
			Stage::TxData => PipelineKind::TxData,
		}
	}

	pub fn lcore_id(&self) -> u32 {
		self.lcore_id
	}

	pub fn state(&self) -> PipelineState {
		self.state
	}

	pub fn inputs(&self) -> &[PortIn] {
		&self.inputs
	}

	pub fn outputs(&self) -> &[PortOut] {
		&self.outputs
	}

	fn check_created(&self) -> Result<(), PipelineError> {
		match self.state {
			PipelineState::Created => Ok(()),
			PipelineState::Checked => Err(PipelineError::AlreadyChecked),
		}
	}

	pub fn init_input_port(
		&mut self,
		port_id: u16,
		queue_id: u16,
		ring: Option<Arc<Ring<Mbuf>>>,
	) -> Result<usize, PipelineError> {
		self.check_created()?;
		if self.inputs.len() >= Self::PORTS_MAX {
			return Err(PipelineError::TooManyPorts);
		}
		match (self.kind(), &ring) {
			(PipelineKind::TxData, None) => {
				return Err(PipelineError::InvalidPortBinding("tx pipeline inputs need a ring"))
			}
			(PipelineKind::RxData, Some(_)) | (PipelineKind::Default, Some(_)) => {
				return Err(PipelineError::InvalidPortBinding("rx pipeline inputs are hardware queues"))
			}
			_ => {}
		}
		if let Some(last) = self.inputs.last() {
			match self.kind() {
				PipelineKind::RxData if last.queue_id != queue_id => {
					return Err(PipelineError::InvalidPortBinding(
						"rx queue id must be the same across all inputs of an rx data pipeline",
					))
				}
				PipelineKind::TxData if last.port_id != port_id => {
					return Err(PipelineError::InvalidPortBinding(
						"port id must be the same across all inputs of a tx data pipeline",
					))
				}
				_ => {}
			}
		}
		self.inputs.push(PortIn {
			port_id,
			queue_id,
			ring,
			enabled: false,
		});
		log::debug!("lcore {}: input {}:{}", self.lcore_id, port_id, queue_id);
		Ok(self.inputs.len() - 1)
	}

	pub fn init_output_port(
		&mut self,
		port_id: u16,
		queue_id: u16,
		ring: Option<Arc<Ring<Mbuf>>>,
	) -> Result<usize, PipelineError> {
		self.check_created()?;
		if self.outputs.len() >= Self::PORTS_MAX {
			return Err(PipelineError::TooManyPorts);
		}
		match (self.kind(), &ring) {
			(PipelineKind::RxData, None) => {
				return Err(PipelineError::InvalidPortBinding("rx pipeline outputs need a ring"))
			}
			(PipelineKind::TxData, Some(_)) | (PipelineKind::Default, Some(_)) => {
				return Err(PipelineError::InvalidPortBinding(
					"tx pipeline outputs are hardware queues",
				))
			}
			_ => {}
		}
		if let Some(last) = self.outputs.last() {
			if self.kind() != PipelineKind::Default && last.port_id != port_id {
				return Err(PipelineError::InvalidPortBinding(
					"port id must be the same across all outputs of a data pipeline",
				));
			}
		}
		self.outputs.push(PortOut {
			port_id,
			queue_id,
			ring,
		});
		self.out_bufs.push(Vec::with_capacity(TX_BURST_MAX));
		log::debug!("lcore {}: output {}:{}", self.lcore_id, port_id, queue_id);
		Ok(self.outputs.len() - 1)
	}

	pub fn set_hit_action(&mut self, hit: Box<dyn HitAction>) -> Result<(), PipelineError> {
		let kind = self.kind();
		match &mut self.stage {
			Stage::Default { action, .. } => {
				*action = Some(hit);
				Ok(())
			}
			_ => Err(PipelineError::WrongKind(kind)),
		}
	}

	fn output_of_port(&self, port_id: u16) -> Option<usize> {
		self.outputs.iter().position(|o| o.port_id == port_id)
	}

	/// Internal index of an output, for rx data pipelines this is the flow director id
	pub fn output_index(&self, port_id: u16, queue_id: u16) -> Result<usize, PipelineError> {
		self.outputs
			.iter()
			.position(|o| o.port_id == port_id && o.queue_id == queue_id)
			.ok_or(PipelineError::NoSuchOutput(port_id, queue_id))
	}

	/// Route `addr/depth` to the output on `port_id`
	pub fn add_forwarding_rule(
		&mut self,
		addr: u32,
		depth: u8,
		port_id: u16,
	) -> Result<(), PipelineError> {
		let out = self
			.output_of_port(port_id)
			.ok_or(PipelineError::NoSuchOutput(port_id, 0))?;
		let (kind, lcore_id) = (self.kind(), self.lcore_id);
		match &mut self.stage {
			Stage::Default { table, .. } => {
				table.insert(addr, depth, out)?;
				log::debug!(
					"lcore {}: rule {}/{} -> port {}",
					lcore_id,
					Ipv4Addr::from(addr),
					depth,
					port_id
				);
				Ok(())
			}
			_ => Err(PipelineError::WrongKind(kind)),
		}
	}

	/// Validate the wiring, afterwards the pipeline can run
	pub fn check(&mut self) -> Result<(), PipelineError> {
		self.check_created()?;
		if self.inputs.is_empty() {
			return Err(PipelineError::Inconsistent("no inputs"));
		}
		if self.outputs.is_empty() {
			return Err(PipelineError::Inconsistent("no outputs"));
		}
		match &self.stage {
			Stage::Default { table, .. } => {
				if table.rules().iter().any(|r| r.2 >= self.outputs.len()) {
					return Err(PipelineError::Inconsistent("rule without output"));
				}
			}
			Stage::RxData => {
				if self.outputs.len() > (Self::FDIR_OUT_QUEUE_MASK + 1) as usize {
					return Err(PipelineError::Inconsistent("outputs not addressable by fdir id"));
				}
			}
			Stage::TxData => {
				if self.outputs.len() != self.inputs.len() {
					return Err(PipelineError::Inconsistent(
						"tx pipeline needs one output per input",
					));
				}
				if self.outputs[0].port_id != self.inputs[0].port_id {
					return Err(PipelineError::Inconsistent(
						"tx pipeline inputs and outputs belong to different ports",
					));
				}
			}
		}
		self.state = PipelineState::Checked;
		Ok(())
	}

	/// Enable an input, enabling it twice is a no-op
	pub fn enable_input(&mut self, port_id: u16, queue_id: u16) -> Result<(), PipelineError> {
		let input = self
			.inputs
			.iter_mut()
			.find(|i| i.port_id == port_id && i.queue_id == queue_id)
			.ok_or(PipelineError::NoSuchInput(port_id, queue_id))?;
		if !input.enabled {
			input.enabled = true;
			log::info!("lcore {}: enabled input {}:{}", self.lcore_id, port_id, queue_id);
		}
		Ok(())
	}

	/// Queue id of the first disabled input of a port
	pub fn next_available_input(&self, port_id: u16) -> Option<u16> {
		self.inputs
			.iter()
			.find(|i| i.port_id == port_id && !i.enabled)
			.map(|i| i.queue_id)
	}

	/// Serve every pending control request
	pub fn handle_messages(&mut self) {
		let reqs: Vec<PipelineRequest> = match &self.ctrl {
			Some(ctrl) => ctrl.req.try_iter().collect(),
			None => return,
		};
		for req in reqs {
			let res = self.apply(req);
			if let Some(ctrl) = &self.ctrl {
				if ctrl.resp.try_send(res).is_err() {
					log::warn!("lcore {}: dropped a control response", self.lcore_id);
				}
			}
		}
	}

	/// Serve one control request in the calling thread
	pub fn apply(&mut self, req: PipelineRequest) -> PipelineResponse {
		let kind = self.kind();
		match req {
			PipelineRequest::EnablePortIn { port_id, queue_id } => {
				self.enable_input(port_id, queue_id)
			}
			PipelineRequest::AddIpv4Rule {
				addr,
				depth,
				port_id,
			} => self.add_forwarding_rule(addr, depth, port_id),
			PipelineRequest::ReleaseFlow { port_id, slot } => match &mut self.stage {
				Stage::Default {
					action: Some(action),
					..
				} => action.release(port_id, slot).map_err(PipelineError::from),
				_ => Err(PipelineError::WrongKind(kind)),
			},
		}
	}

	/// Periodic work of the hit action
	pub fn housekeeping(&mut self, now: Instant) {
		if let Stage::Default {
			action: Some(action),
			..
		} = &mut self.stage
		{
			action.housekeeping(now);
		}
	}

	/// One pass over the enabled inputs, at most one burst each
	///
	/// Returns the number of packets read. Does nothing before `check`.
	pub fn run_once(&mut self, now: Instant) -> usize {
		if self.state != PipelineState::Checked {
			return 0;
		}
		let mut total = 0;
		for i in 0..self.inputs.len() {
			if !self.inputs[i].enabled {
				continue;
			}
			let n = self.read_input(i);
			if n == 0 {
				continue;
			}
			total += n;
			match self.stage {
				Stage::Default { .. } => self.classify(i, now),
				Stage::RxData => self.route_by_fdir(),
				Stage::TxData => self.route_straight(i),
			}
			self.dispatch();
		}
		total
	}

	fn read_input(&mut self, i: usize) -> usize {
		let input = &self.inputs[i];
		self.burst.clear();
		match &input.ring {
			Some(ring) => ring.dequeue_burst(&mut self.burst, TX_BURST_MAX),
			None => {
				let n = self
					.ctx
					.nic
					.rx_burst(input.port_id, input.queue_id, &mut self.burst, RX_BURST_MAX);
				if n > 0 {
					self.ctx.stats.rx_burst(input.port_id, input.queue_id, n);
				}
				n
			}
		}
	}

	/// LPM on the destination address, misses go back out of the ingress port
	fn classify(&mut self, input: usize, now: Instant) {
		let Pipeline {
			inputs,
			outputs,
			stage,
			burst,
			routes,
			hits,
			..
		} = self;
		let (table, action) = match stage {
			Stage::Default { table, action } => (table, action),
			_ => return,
		};
		let ingress = inputs[input].port_id;
		let miss = outputs
			.iter()
			.position(|o| o.port_id == ingress)
			.unwrap_or(Self::DROP);

		for m in burst.iter_mut() {
			m.flow_key = FlowKey::parse(m.data());
		}

		routes.clear();
		hits.clear();
		for chunk in burst.chunks(4) {
			let mut ips = [0u32; 4];
			for (ip, m) in ips.iter_mut().zip(chunk.iter()) {
				*ip = m.flow_key.dip;
			}
			// a rule never yields DROP, so DROP marks the misses
			let res = table.lookup_x4(ips, [Self::DROP; 4]);
			for (m, &r) in chunk.iter().zip(res.iter()) {
				if r == Self::DROP {
					routes.push(miss);
				} else {
					routes.push(r);
					hits.push(Hit {
						key: m.flow_key,
						ingress: m.port,
						egress: outputs[r].port_id,
					});
				}
			}
		}
		if let Some(action) = action {
			if !hits.is_empty() {
				action.on_hit(hits, now);
			}
		}
	}

	fn route_by_fdir(&mut self) {
		let nb_out = self.outputs.len();
		self.routes.clear();
		for m in self.burst.iter() {
			let r = match m.fdir_id {
				Some(id) if ((id & Self::FDIR_OUT_QUEUE_MASK) as usize) < nb_out => {
					(id & Self::FDIR_OUT_QUEUE_MASK) as usize
				}
				_ => Self::DROP,
			};
			self.routes.push(r);
		}
	}

	fn route_straight(&mut self, input: usize) {
		self.routes.clear();
		self.routes.resize(self.burst.len(), input);
	}

	/// Move the burst to the output buffers picked by `routes` and flush them
	fn dispatch(&mut self) {
		let mut dropped = 0;
		for (m, &r) in self.burst.drain(..).zip(self.routes.iter()) {
			match self.out_bufs.get_mut(r) {
				Some(buf) => buf.push(m),
				None => dropped += 1,
			}
		}
		if dropped > 0 {
			self.ctx.stats.dropped(dropped);
		}
		for (out, buf) in self.outputs.iter().zip(self.out_bufs.iter_mut()) {
			if !buf.is_empty() {
				send(&self.ctx, out, buf);
			}
		}
	}

	/// Rendering of the pipeline configuration
	pub fn dump(&self) -> String {
		self.to_string()
	}
}

/// Send everything in `buf` to the output, following the backpressure policy
fn send(ctx: &PipelineCtx, out: &PortOut, buf: &mut Vec<Mbuf>) -> usize {
	let mut sent = 0;
	loop {
		let n = match &out.ring {
			Some(ring) => ring.enqueue_burst(buf),
			None => {
				let n = ctx.nic.tx_burst(out.port_id, out.queue_id, buf);
				ctx.stats.tx_burst(out.port_id, out.queue_id, n);
				n
			}
		};
		sent += n;
		if buf.is_empty() || ctx.policy == Backpressure::Lossy || !ctx.running() {
			break;
		}
		std::hint::spin_loop();
	}
	if !buf.is_empty() {
		ctx.stats.dropped(buf.len());
		buf.clear();
	}
	sent
}

/// Wire a data flow through an rx and a tx data pipeline
///
/// Enables both inputs and steers the flow into `in_queue` of `in_port`, tagged with the index
/// of the rx pipeline's output towards (`out_port`, `out_queue`). Returns that flow director id.
pub fn add_data_flow(
	rx: &mut Pipeline,
	in_port: u16,
	in_queue: u16,
	tx: &mut Pipeline,
	out_port: u16,
	out_queue: u16,
	filter: &FdirFilter,
) -> Result<u32, PipelineError> {
	if rx.kind() != PipelineKind::RxData {
		return Err(PipelineError::WrongKind(rx.kind()));
	}
	if tx.kind() != PipelineKind::TxData {
		return Err(PipelineError::WrongKind(tx.kind()));
	}
	let fdir_id = rx.output_index(out_port, out_queue)? as u32;
	rx.enable_input(in_port, in_queue)?;
	tx.enable_input(out_port, out_queue)?;
	rx.ctx
		.nic
		.add_fdir_filter(in_port, filter, fdir_id, in_queue)?;
	log::info!(
		"data flow {} on {}:{} -> {}:{} fdir id {}",
		filter,
		in_port,
		in_queue,
		out_port,
		out_queue,
		fdir_id
	);
	Ok(fdir_id)
}

fn ring_name(ring: &Option<Arc<Ring<Mbuf>>>) -> String {
	match ring {
		Some(r) => format!("ring {:p}", Arc::as_ptr(r)),
		None => "hw".to_owned(),
	}
}

impl fmt::Display for Pipeline {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "type: {}", self.kind())?;
		writeln!(f, "lcore id: {}", self.lcore_id)?;
		for (i, q) in self.inputs.iter().enumerate() {
			writeln!(
				f,
				"\tq_in {} pid {} qid {} {} enabled {}",
				i,
				q.port_id,
				q.queue_id,
				ring_name(&q.ring),
				q.enabled
			)?;
		}
		if let Stage::Default { table, action } = &self.stage {
			for (ip, depth, out) in table.rules() {
				writeln!(f, "\trule {}/{} -> q_out {}", Ipv4Addr::from(ip), depth, out)?;
			}
			if let Some(action) = action {
				write!(f, "{}", action.dump())?;
			}
		}
		for (i, q) in self.outputs.iter().enumerate() {
			writeln!(
				f,
				"\tq_out {} pid {} qid {} {}",
				i,
				q.port_id,
				q.queue_id,
				ring_name(&q.ring)
			)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::apis::{FdirMasks, Mempool, PortConf, SoftNic};
	use crate::testutil::tcp_frame;
	use voq_ring::RingType;

	fn setup(nb_ports: u16, nb_rxq: u16, nb_txq: u16) -> (Arc<SoftNic>, PipelineCtx) {
		let pool = Mempool::new("pipeline_test", 256, 2048).unwrap();
		let nic = Arc::new(SoftNic::new(&vec![0; nb_ports as usize], pool));
		for p in 0..nb_ports {
			let conf = PortConf {
				nb_rxq,
				nb_txq,
				nb_rxd: 64,
				nb_txd: 64,
				fdir_masks: None,
			};
			nic.configure(p, &conf).unwrap();
			nic.start(p).unwrap();
			nic.set_fdir_masks(p, &FdirMasks::EXACT).unwrap();
		}
		let ctx = PipelineCtx {
			nic: nic.clone(),
			stats: Arc::new(Stats::new(nb_ports)),
			policy: Backpressure::Retry,
			keep_running: Arc::new(AtomicBool::new(true)),
		};
		(nic, ctx)
	}

	fn default_pipeline(ctx: &PipelineCtx, nb_ports: u16) -> Pipeline {
		let mut pp = Pipeline::new(1, PipelineKind::Default, ctx.clone());
		for p in 0..nb_ports {
			pp.init_input_port(p, 0, None).unwrap();
			pp.init_output_port(p, 0, None).unwrap();
		}
		pp
	}

	fn ip(a: u8, b: u8, c: u8, d: u8) -> u32 {
		u32::from(Ipv4Addr::new(a, b, c, d))
	}

	#[test]
	fn port_binding_rules() {
		let (_nic, ctx) = setup(2, 2, 2);
		let ring = Arc::new(Ring::new(8, RingType::MpSc).unwrap());

		let mut rx = Pipeline::new(2, PipelineKind::RxData, ctx.clone());
		assert!(matches!(
			rx.init_input_port(0, 1, Some(ring.clone())),
			Err(PipelineError::InvalidPortBinding(_))
		));
		rx.init_input_port(0, 1, None).unwrap();
		assert!(matches!(
			rx.init_input_port(1, 2, None),
			Err(PipelineError::InvalidPortBinding(_))
		));
		assert!(matches!(
			rx.init_output_port(1, 2, None),
			Err(PipelineError::InvalidPortBinding(_))
		));
		rx.init_output_port(1, 2, Some(ring.clone())).unwrap();
		assert!(matches!(
			rx.init_output_port(0, 2, Some(ring.clone())),
			Err(PipelineError::InvalidPortBinding(_))
		));

		let mut tx = Pipeline::new(3, PipelineKind::TxData, ctx);
		assert!(matches!(
			tx.init_input_port(1, 2, None),
			Err(PipelineError::InvalidPortBinding(_))
		));
		tx.init_input_port(1, 2, Some(ring.clone())).unwrap();
		assert!(matches!(
			tx.init_input_port(0, 2, Some(ring.clone())),
			Err(PipelineError::InvalidPortBinding(_))
		));
		assert!(matches!(
			tx.init_output_port(1, 2, Some(ring)),
			Err(PipelineError::InvalidPortBinding(_))
		));
	}

	#[test]
	fn init_twice_is_rejected() {
		let (_nic, ctx) = setup(1, 1, 1);
		let mut pp = Pipeline::new(4, PipelineKind::Default, ctx);
		let _h = pp.init().unwrap();
		assert!(matches!(pp.init(), Err(PipelineError::AlreadyInUse(4))));
	}

	#[test]
	fn check_freezes_wiring() {
		let (_nic, ctx) = setup(2, 1, 1);
		let mut pp = Pipeline::new(1, PipelineKind::Default, ctx);
		assert!(matches!(pp.check(), Err(PipelineError::Inconsistent(_))));
		pp.init_input_port(0, 0, None).unwrap();
		pp.init_output_port(0, 0, None).unwrap();
		assert!(matches!(
			pp.add_forwarding_rule(ip(1, 1, 1, 1), 32, 1),
			Err(PipelineError::NoSuchOutput(1, 0))
		));
		pp.check().unwrap();
		assert!(matches!(
			pp.init_output_port(1, 0, None),
			Err(PipelineError::AlreadyChecked)
		));
		// rules can still be added to a running table
		pp.add_forwarding_rule(ip(1, 1, 1, 1), 32, 0).unwrap();
	}

	#[test]
	fn enable_input_is_idempotent() {
		let (_nic, ctx) = setup(2, 1, 1);
		let mut pp = default_pipeline(&ctx, 2);
		assert_eq!(pp.next_available_input(1), Some(0));
		pp.enable_input(1, 0).unwrap();
		pp.enable_input(1, 0).unwrap();
		assert_eq!(pp.next_available_input(1), None);
		assert_eq!(pp.inputs().iter().filter(|i| i.enabled).count(), 1);
		assert!(matches!(
			pp.enable_input(1, 5),
			Err(PipelineError::NoSuchInput(1, 5))
		));
	}

	#[test]
	fn default_pipeline_forwards_by_lpm_and_misses_to_ingress() {
		let (nic, ctx) = setup(3, 1, 1);
		let mut pp = default_pipeline(&ctx, 3);
		pp.add_forwarding_rule(ip(20, 1, 1, 1), 32, 2).unwrap();
		pp.add_forwarding_rule(ip(20, 1, 0, 0), 16, 1).unwrap();
		pp.check().unwrap();
		for p in 0..3 {
			pp.enable_input(p, 0).unwrap();
		}

		nic.inject(0, &tcp_frame([10, 0, 0, 1], 1, [20, 1, 1, 1], 2, None)).unwrap();
		nic.inject(0, &tcp_frame([10, 0, 0, 1], 1, [20, 1, 9, 9], 2, None)).unwrap();
		nic.inject(1, &tcp_frame([10, 0, 0, 1], 1, [30, 0, 0, 1], 2, None)).unwrap();
		assert_eq!(pp.run_once(Instant::now()), 3);

		assert_eq!(nic.drain_tx(2, 0).len(), 1);
		// the /16 hit and the miss from port 1 both leave through port 1
		assert_eq!(nic.drain_tx(1, 0).len(), 2);
		assert_eq!(nic.drain_tx(0, 0).len(), 0);
		assert_eq!(ctx.stats.rx(0, 0).total_packets, 2);
		assert_eq!(ctx.stats.tx(1, 0).total_packets, 2);
	}

	struct Recorder(Arc<crossbeam::queue::SegQueue<Hit>>);

	impl HitAction for Recorder {
		fn on_hit(&mut self, hits: &[Hit], _now: Instant) {
			for h in hits {
				self.0.push(*h);
			}
		}

		fn release(&mut self, port: u16, slot: usize) -> Result<(), FlowError> {
			Err(FlowError::NotInUse(port, slot))
		}
	}

	#[test]
	fn hit_action_sees_only_table_hits() {
		let (nic, ctx) = setup(2, 1, 1);
		let mut pp = default_pipeline(&ctx, 2);
		let seen = Arc::new(crossbeam::queue::SegQueue::new());
		pp.set_hit_action(Box::new(Recorder(seen.clone()))).unwrap();
		pp.add_forwarding_rule(ip(20, 1, 7, 1), 32, 1).unwrap();
		pp.check().unwrap();
		pp.enable_input(0, 0).unwrap();

		nic.inject(0, &tcp_frame([10, 0, 0, 1], 5, [20, 1, 7, 1], 6, None)).unwrap();
		nic.inject(0, &tcp_frame([10, 0, 0, 1], 5, [20, 1, 7, 2], 6, None)).unwrap();
		pp.run_once(Instant::now());

		assert_eq!(seen.len(), 1);
		let hit = seen.pop().unwrap();
		assert_eq!((hit.ingress, hit.egress), (0, 1));
		assert_eq!(hit.key.sport, 5);
	}

	#[test]
	fn data_flow_end_to_end() {
		let (nic, ctx) = setup(2, 3, 3);
		let rings: Vec<Arc<Ring<Mbuf>>> = (0..2)
			.map(|_| Arc::new(Ring::new(64, RingType::MpSc).unwrap()))
			.collect();

		// rx data on port 0 queue 1, output rings towards port 1 queues 1 and 2
		let mut rx = Pipeline::new(2, PipelineKind::RxData, ctx.clone());
		rx.init_input_port(0, 1, None).unwrap();
		rx.init_output_port(1, 1, Some(rings[0].clone())).unwrap();
		rx.init_output_port(1, 2, Some(rings[1].clone())).unwrap();
		rx.check().unwrap();

		let mut tx = Pipeline::new(3, PipelineKind::TxData, ctx.clone());
		tx.init_input_port(1, 1, Some(rings[0].clone())).unwrap();
		tx.init_input_port(1, 2, Some(rings[1].clone())).unwrap();
		tx.init_output_port(1, 1, None).unwrap();
		tx.init_output_port(1, 2, None).unwrap();
		tx.check().unwrap();

		assert_eq!(rx.next_available_input(0), Some(1));
		let filter = FdirFilter::tcp(ip(10, 0, 0, 1), 4000, ip(10, 0, 0, 2), 5000);
		let id = add_data_flow(&mut rx, 0, 1, &mut tx, 1, 2, &filter).unwrap();
		assert_eq!(id, 1);
		assert_eq!(tx.next_available_input(1), Some(1));

		let frame = tcp_frame([10, 0, 0, 1], 4000, [10, 0, 0, 2], 5000, None);
		assert_eq!(nic.inject(0, &frame), Ok(1));
		assert_eq!(rx.run_once(Instant::now()), 1);
		assert_eq!(rings[1].count(), 1);
		assert_eq!(tx.run_once(Instant::now()), 1);
		let out = nic.drain_tx(1, 2);
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].data(), &frame[..]);
	}

	#[test]
	fn untagged_packets_are_dropped_by_rx_data() {
		let (nic, ctx) = setup(1, 2, 1);
		let ring = Arc::new(Ring::new(8, RingType::SpSc).unwrap());
		let mut rx = Pipeline::new(2, PipelineKind::RxData, ctx.clone());
		rx.init_input_port(0, 0, None).unwrap();
		rx.init_output_port(0, 1, Some(ring.clone())).unwrap();
		rx.check().unwrap();
		rx.enable_input(0, 0).unwrap();
		nic.inject(0, &tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, None)).unwrap();
		rx.run_once(Instant::now());
		assert!(ring.is_empty());
		assert_eq!(ctx.stats.nb_dropped(), 1);
		assert_eq!(nic.pool().in_use(), 0);
	}

	#[test]
	fn control_channel_enables_inputs_and_rules() {
		let (nic, ctx) = setup(2, 1, 1);
		let mut pp = default_pipeline(&ctx, 2);
		let handle = pp.init().unwrap();
		pp.check().unwrap();

		let worker = std::thread::spawn(move || {
			let deadline = Instant::now() + std::time::Duration::from_secs(2);
			while Instant::now() < deadline {
				pp.handle_messages();
				pp.run_once(Instant::now());
			}
			pp
		});
		handle
			.request(PipelineRequest::EnablePortIn {
				port_id: 0,
				queue_id: 0,
			})
			.unwrap();
		handle
			.request(PipelineRequest::AddIpv4Rule {
				addr: ip(20, 1, 1, 1),
				depth: 32,
				port_id: 1,
			})
			.unwrap();
		assert!(matches!(
			handle.request(PipelineRequest::ReleaseFlow {
				port_id: 0,
				slot: 0
			}),
			Err(PipelineError::WrongKind(PipelineKind::Default))
		));
		nic.inject(0, &tcp_frame([10, 0, 0, 1], 1, [20, 1, 1, 1], 2, None)).unwrap();
		let pp = worker.join().unwrap();
		assert!(pp.inputs()[0].enabled);
		assert_eq!(nic.drain_tx(1, 0).len(), 1);
		assert!(pp.dump().contains("20.1.1.1/32"));
	}
}
