//! Control messages to a running pipeline
//!
//! Every pipeline owns a request and a response channel. The control core sends a request, the
//! pipeline's lcore serves it between two runs and answers on the response channel.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

use super::{PipelineError, PipelineKind};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PipelineRequest {
	EnablePortIn { port_id: u16, queue_id: u16 },
	AddIpv4Rule { addr: u32, depth: u8, port_id: u16 },
	ReleaseFlow { port_id: u16, slot: usize },
}

pub type PipelineResponse = Result<(), PipelineError>;

/// Control side of a pipeline
pub struct PipelineHandle {
	lcore_id: u32,
	kind: PipelineKind,
	req: Sender<PipelineRequest>,
	resp: Receiver<PipelineResponse>,
}

impl PipelineHandle {
	pub const MSG_QUEUE_SIZE: usize = 256;
	pub const MSG_TIMEOUT: Duration = Duration::from_secs(1);

	pub(super) fn open(
		lcore_id: u32,
		kind: PipelineKind,
	) -> (Self, Receiver<PipelineRequest>, Sender<PipelineResponse>) {
		let (req_tx, req_rx) = bounded(Self::MSG_QUEUE_SIZE);
		let (resp_tx, resp_rx) = bounded(Self::MSG_QUEUE_SIZE);
		let handle = Self {
			lcore_id,
			kind,
			req: req_tx,
			resp: resp_rx,
		};
		(handle, req_rx, resp_tx)
	}

	pub fn lcore_id(&self) -> u32 {
		self.lcore_id
	}

	pub fn kind(&self) -> PipelineKind {
		self.kind
	}

	/// Send a request and wait for the pipeline to serve it
	pub fn request(&self, req: PipelineRequest) -> Result<(), PipelineError> {
		// answers to requests that timed out earlier
		while self.resp.try_recv().is_ok() {}

		match self.req.try_send(req) {
			Ok(()) => {}
			Err(TrySendError::Full(_)) => return Err(PipelineError::Timeout),
			Err(TrySendError::Disconnected(_)) => return Err(PipelineError::Disconnected),
		}
		match self.resp.recv_timeout(Self::MSG_TIMEOUT) {
			Ok(res) => res,
			Err(RecvTimeoutError::Timeout) => {
				log::warn!("lcore {}: request {:?} timed out", self.lcore_id, req);
				Err(PipelineError::Timeout)
			}
			Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Disconnected),
		}
	}
}
