//! Poll gates for the busy loops
//!
//! A gate remembers when its queue was last serviced and tells the loop when the queue becomes
//! eligible again. The loops never sleep on a gate, they skip the queue and move on.

use std::{
	thread,
	time::{Duration, Instant},
};

/// Wait for `d` without giving up the core for longer than a yield
pub fn delay(d: Duration) {
	let end = Instant::now() + d;
	while Instant::now() < end {
		thread::yield_now();
	}
}

#[derive(Clone, Copy, Debug)]
pub struct PollGate {
	interval: Duration,
	last: Option<Instant>,
}

impl PollGate {
	pub fn new(interval: Duration) -> Self {
		Self {
			interval,
			last: None,
		}
	}

	/// A gate that has never been marked is due
	#[inline]
	pub fn is_due(&self, now: Instant) -> bool {
		match self.last {
			Some(last) => now.saturating_duration_since(last) >= self.interval,
			None => true,
		}
	}

	#[inline]
	pub fn mark(&mut self, now: Instant) {
		self.last = Some(now);
	}

	/// Earliest time the queue may be polled again
	pub fn next_eligible(&self) -> Option<Instant> {
		self.last.map(|l| l + self.interval)
	}

	pub fn interval(&self) -> Duration {
		self.interval
	}
}

/// One gate per queue of a set of ports, indexed `[port_idx][queue_idx]`
#[derive(Clone, Debug)]
pub struct PollSchedule {
	gates: Vec<Vec<PollGate>>,
}

impl PollSchedule {
	pub fn new(interval: Duration, queues_per_port: &[usize]) -> Self {
		Self {
			gates: queues_per_port
				.iter()
				.map(|&n| vec![PollGate::new(interval); n])
				.collect(),
		}
	}

	#[inline]
	pub fn is_due(&self, port_idx: usize, queue_idx: usize, now: Instant) -> bool {
		self.gates[port_idx][queue_idx].is_due(now)
	}

	#[inline]
	pub fn mark(&mut self, port_idx: usize, queue_idx: usize, now: Instant) {
		self.gates[port_idx][queue_idx].mark(now);
	}

	pub fn next_eligible(&self, port_idx: usize, queue_idx: usize) -> Option<Instant> {
		self.gates[port_idx][queue_idx].next_eligible()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn gate_opens_after_interval() {
		let t0 = Instant::now();
		let mut g = PollGate::new(Duration::from_micros(100));
		assert!(g.is_due(t0));
		g.mark(t0);
		assert!(!g.is_due(t0 + Duration::from_micros(50)));
		assert!(g.is_due(t0 + Duration::from_micros(100)));
		assert_eq!(g.next_eligible(), Some(t0 + Duration::from_micros(100)));
	}

	#[test]
	fn zero_interval_is_always_due() {
		let t0 = Instant::now();
		let mut g = PollGate::new(Duration::from_micros(0));
		g.mark(t0);
		assert!(g.is_due(t0));
	}

	#[test]
	fn schedule_keeps_queues_apart() {
		let t0 = Instant::now();
		let mut s = PollSchedule::new(Duration::from_millis(1), &[2, 1]);
		s.mark(0, 1, t0);
		assert!(s.is_due(0, 0, t0));
		assert!(!s.is_due(0, 1, t0));
		assert!(s.is_due(1, 0, t0));
		assert_eq!(s.next_eligible(1, 0), None);
	}
}
