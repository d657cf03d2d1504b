//! The classification lcore
//!
//! Runs the default pipeline over queue 0 of every port. Its hit action watches the forwarded
//! packets for fragment requests and binds the data flows they announce.

use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use super::{
	dump_flows, keep_running, pause, VoqRings, RXQ_DATA_MIN, RXQ_DEFAULT, TXQ_DATA, TXQ_DEFAULT,
};
use crate::{
	apis::{FdirFilter, Nic},
	dp::LcoreParams,
	flow::{FlowError, FlowKey, FlowTable, SlotState, SteeringFilter, SINK_ID_REQUEST},
	pipeline::{
		Hit, HitAction, Pipeline, PipelineCtx, PipelineError, PipelineHandle, PipelineKind,
		PipelineRequest,
	},
	stats::Stats,
};

pub struct DefaultLcore {
	id: u32,
	pipeline: Pipeline,
	run_interval: Duration,
	ctx: PipelineCtx,
}

impl DefaultLcore {
	/// Wire queue 0 of every port in and out and attach the flow detector
	pub fn new(
		lp: &LcoreParams,
		nb_ports: u16,
		ctx: PipelineCtx,
		detector: FlowDetector,
		run_interval: Duration,
	) -> Result<(Self, PipelineHandle), PipelineError> {
		let mut pipeline = Pipeline::new(lp.id, PipelineKind::Default, ctx.clone());
		let handle = pipeline.init()?;
		for port in 0..nb_ports {
			pipeline.init_input_port(port, RXQ_DEFAULT, None)?;
		}
		for port in 0..nb_ports {
			pipeline.init_output_port(port, TXQ_DEFAULT, None)?;
		}
		pipeline.set_hit_action(Box::new(detector))?;
		pipeline.check()?;
		for port in 0..nb_ports {
			pipeline.enable_input(port, RXQ_DEFAULT)?;
		}
		log::debug!("{}", pipeline);

		let lcore = Self {
			id: lp.id,
			pipeline,
			run_interval,
			ctx,
		};
		Ok((lcore, handle))
	}

	#[inline]
	pub fn id(&self) -> u32 {
		self.id
	}

	/// Serve a control request without going through the channel, before the lcore runs
	pub fn serve(&mut self, req: PipelineRequest) -> Result<(), PipelineError> {
		self.pipeline.apply(req)
	}

	pub fn poll(&mut self, now: Instant) -> usize {
		self.pipeline.handle_messages();
		let n = self.pipeline.run_once(now);
		self.pipeline.housekeeping(now);
		n
	}

	pub fn run(mut self) {
		log::info!("lcore {}: default, entering main loop", self.id);
		while keep_running(&self.ctx) {
			self.poll(Instant::now());
			pause(self.run_interval);
		}
		log::info!("lcore {}: default, leaving main loop", self.id);
	}
}

/// One side of a detected data flow
struct Binding {
	/// port owning the slot, the flow leaves through it
	slot_port: u16,
	peer: u32,
	sink_id: u32,
	is_request: bool,
	/// port the flow enters through, where the steering filter goes
	filter_port: u16,
	filter: FdirFilter,
	rx_queue: u16,
}

impl Binding {
	/// Replies of the peer back to the requester
	fn downstream(hit: &Hit) -> Self {
		Self {
			slot_port: hit.ingress,
			peer: hit.key.sip,
			sink_id: hit.key.event_id,
			is_request: false,
			filter_port: hit.egress,
			filter: FdirFilter::from_key(&hit.key).mirror(),
			rx_queue: RXQ_DATA_MIN + hit.ingress,
		}
	}

	/// Further requests of the requester
	fn upstream(hit: &Hit) -> Self {
		Self {
			slot_port: hit.egress,
			peer: hit.key.dip,
			sink_id: SINK_ID_REQUEST,
			is_request: true,
			filter_port: hit.ingress,
			filter: FdirFilter::from_key(&hit.key),
			rx_queue: RXQ_DATA_MIN + hit.egress,
		}
	}
}

/// Binds data flows on fragment requests and ages them out
pub struct FlowDetector {
	table: Arc<FlowTable>,
	rings: Arc<VoqRings>,
	nic: Arc<dyn Nic>,
	stats: Arc<Stats>,
	/// per port sequence making flow director ids unique
	fdir_counter: Vec<u32>,
	idle_timeout: Duration,
	last_aging: Option<Instant>,
	seen_sports: Vec<u16>,
}

impl FlowDetector {
	pub const AGING_INTERVAL: Duration = Duration::from_secs(1);
	/// Rate limit of the data tx queue of a port receiving data flows
	pub const DATA_RATE_MBPS: u32 = 1000;

	/// An `idle_timeout` of zero disables aging
	pub fn new(
		table: Arc<FlowTable>,
		rings: Arc<VoqRings>,
		ctx: &PipelineCtx,
		idle_timeout: Duration,
	) -> Self {
		let nb_ports = table.nb_ports() as usize;
		Self {
			table,
			rings,
			nic: ctx.nic.clone(),
			stats: ctx.stats.clone(),
			fdir_counter: vec![0; nb_ports],
			idle_timeout,
			last_aging: None,
			seen_sports: Vec::new(),
		}
	}

	/// Slot of the binding, allocated and steered if needed
	fn ensure(&mut self, b: &Binding, now: Instant) -> Option<usize> {
		let (slot, fresh) = match self.table.find_slot(b.slot_port, b.peer, b.sink_id) {
			Ok(slot) => (slot, false),
			Err(_) => match self
				.table
				.allocate_slot(b.slot_port, b.peer, b.sink_id, b.is_request, now)
			{
				Ok(slot) => (slot, true),
				Err(FlowError::Exhausted(port)) => {
					self.stats.flow_exhausted();
					log::warn!("port {}: no data flow slot left, flow stays on the default path", port);
					return None;
				}
				Err(e) => {
					log::error!("cannot allocate data flow: {}", e);
					return None;
				}
			},
		};
		self.table.touch(b.slot_port, slot, now);

		let steering = SteeringFilter {
			port: b.filter_port,
			filter: b.filter,
		};
		if self.table.has_filter(b.slot_port, slot, &steering) {
			return Some(slot);
		}

		let counter = match self.fdir_counter.get_mut(b.filter_port as usize) {
			Some(c) => c,
			None => return None,
		};
		*counter = counter.wrapping_add(1);
		let fdir_id = slot as u32 | (*counter << 6);

		match self
			.nic
			.add_fdir_filter(b.filter_port, &b.filter, fdir_id, b.rx_queue)
		{
			Ok(()) => {
				if let Err(e) = self.table.add_filter(b.slot_port, slot, steering) {
					log::error!("port {} slot {}: {}", b.slot_port, slot, e);
				}
				log::info!(
					"port {} slot {}: {} -> rx queue {}:{} fdir id 0x{:x}{}",
					b.slot_port,
					slot,
					b.filter,
					b.filter_port,
					b.rx_queue,
					fdir_id,
					if b.is_request { " (request)" } else { "" }
				);
				Some(slot)
			}
			Err(e) => {
				self.stats.filter_failed();
				log::warn!("port {}: cannot add filter {}: {}", b.filter_port, b.filter, e);
				if fresh {
					let _ = self.table.release_slot(b.slot_port, slot);
				}
				None
			}
		}
	}

	fn bind(&mut self, hit: &Hit, now: Instant) {
		let down = Binding::downstream(hit);
		let fresh = self
			.table
			.find_slot(down.slot_port, down.peer, down.sink_id)
			.is_err();
		if self.ensure(&down, now).is_none() {
			return;
		}
		if fresh {
			if let Err(e) = self
				.nic
				.set_queue_rate_limit(down.slot_port, TXQ_DATA, Self::DATA_RATE_MBPS)
			{
				log::warn!("port {}: cannot limit data queue rate: {}", down.slot_port, e);
			}
		}
		self.ensure(&Binding::upstream(hit), now);
	}

	/// Stop steering into the slot, the ring keeps draining
	fn drain(&self, port: u16, slot: usize) -> Result<(), FlowError> {
		for f in self.table.begin_drain(port, slot)? {
			if let Err(e) = self.nic.remove_fdir_filter(f.port, &f.filter) {
				log::warn!("port {}: cannot remove filter {}: {}", f.port, f.filter, e);
			}
		}
		log::info!("port {} slot {}: draining", port, slot);
		Ok(())
	}

	/// Free a draining slot once its ring is empty
	fn try_release(&self, port: u16, slot: usize) -> bool {
		if self.rings.occupancy(port, slot) > 0 {
			return false;
		}
		match self.table.release_slot(port, slot) {
			Ok(flow) => {
				for f in flow.filters.iter() {
					let _ = self.nic.remove_fdir_filter(f.port, &f.filter);
				}
				log::info!("port {} slot {}: released", port, slot);
				true
			}
			Err(_) => false,
		}
	}

	fn age(&mut self, now: Instant) {
		if let Some(last) = self.last_aging {
			if now.saturating_duration_since(last) < Self::AGING_INTERVAL {
				return;
			}
		}
		self.last_aging = Some(now);

		let aging = self.idle_timeout > Duration::from_secs(0);
		for (port, slot, flow) in self.table.snapshot() {
			match flow.state {
				SlotState::Active if aging && self.table.idle_for(port, slot, now) > self.idle_timeout => {
					if self.drain(port, slot).is_ok() {
						self.try_release(port, slot);
					}
				}
				SlotState::Draining => {
					self.try_release(port, slot);
				}
				_ => {}
			}
		}
	}
}

impl HitAction for FlowDetector {
	fn on_hit(&mut self, hits: &[Hit], now: Instant) {
		self.seen_sports.clear();
		for hit in hits {
			if !hit.key.is_fragment_request() || hit.key.proto != FlowKey::IPPROTO_TCP {
				continue;
			}
			// one binding per requester connection and burst
			if self.seen_sports.contains(&hit.key.sport) {
				continue;
			}
			self.seen_sports.push(hit.key.sport);
			self.bind(hit, now);
		}
	}

	fn housekeeping(&mut self, now: Instant) {
		self.age(now);
	}

	fn release(&mut self, port: u16, slot: usize) -> Result<(), FlowError> {
		match self.table.state(port, slot) {
			SlotState::Free => return Err(FlowError::NotInUse(port, slot)),
			SlotState::Active => self.drain(port, slot)?,
			SlotState::Draining => {}
		}
		self.try_release(port, slot);
		Ok(())
	}

	fn dump(&self) -> String {
		dump_flows(&self.table, &self.rings)
	}
}
