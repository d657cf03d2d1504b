//! IPv4 longest prefix match table
//!
//! Rules are kept in one hash map per prefix length. A bitmask of the lengths in use lets a lookup
//! probe only the populated depths, longest first.

use std::{collections::HashMap, net::Ipv4Addr};
use thiserror::Error;

pub const V4_MAX_DEPTH: u8 = 32;

#[derive(Error, Debug, PartialEq)]
pub enum LpmError {
	#[error("prefix length {} is out of range", _0)]
	InvalidDepth(u8),
	#[error("table is full ({} rules)", _0)]
	CapacityExceeded(usize),
	#[error("no rule for {}/{}", Ipv4Addr::from(*_0), _1)]
	NoRule(u32, u8),
}

#[inline]
fn mask(depth: u8) -> u32 {
	if depth == 0 {
		0
	} else {
		u32::MAX << (32 - depth as u32)
	}
}

#[derive(Debug, Clone)]
pub struct Lpm<T: Copy> {
	max_rules: usize,
	nb_rules: usize,
	depths: u64,
	tables: Vec<HashMap<u32, T>>,
}

impl<T: Copy> Lpm<T> {
	pub fn new(max_rules: usize) -> Self {
		Self {
			max_rules,
			nb_rules: 0,
			depths: 0,
			tables: (0..=V4_MAX_DEPTH).map(|_| HashMap::new()).collect(),
		}
	}

	/// Add a rule, an existing rule for the same prefix gets the new result
	pub fn insert(&mut self, ip: u32, depth: u8, res: T) -> Result<(), LpmError> {
		if depth > V4_MAX_DEPTH {
			return Err(LpmError::InvalidDepth(depth));
		}
		let key = ip & mask(depth);
		let table = &mut self.tables[depth as usize];
		if let Some(old) = table.get_mut(&key) {
			*old = res;
			return Ok(());
		}
		if self.nb_rules >= self.max_rules {
			return Err(LpmError::CapacityExceeded(self.max_rules));
		}
		table.insert(key, res);
		self.nb_rules += 1;
		self.depths |= 1u64 << depth;
		Ok(())
	}

	pub fn delete(&mut self, ip: u32, depth: u8) -> Result<T, LpmError> {
		if depth > V4_MAX_DEPTH {
			return Err(LpmError::InvalidDepth(depth));
		}
		let table = &mut self.tables[depth as usize];
		let res = table
			.remove(&(ip & mask(depth)))
			.ok_or(LpmError::NoRule(ip, depth))?;
		if table.is_empty() {
			self.depths &= !(1u64 << depth);
		}
		self.nb_rules -= 1;
		Ok(res)
	}

	#[inline]
	pub fn lookup(&self, ip: u32) -> Option<T> {
		let mut depths = self.depths;
		while depths != 0 {
			let depth = 63 - depths.leading_zeros() as u8;
			if let Some(res) = self.tables[depth as usize].get(&(ip & mask(depth))) {
				return Some(*res);
			}
			depths &= !(1u64 << depth);
		}
		None
	}

	/// Four lookups at once, misses are replaced by `default`
	#[inline]
	pub fn lookup_x4(&self, ips: [u32; 4], default: [T; 4]) -> [T; 4] {
		let mut res = default;
		for (r, ip) in res.iter_mut().zip(ips.iter()) {
			if let Some(hit) = self.lookup(*ip) {
				*r = hit;
			}
		}
		res
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.nb_rules
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.nb_rules == 0
	}

	pub fn max_rules(&self) -> usize {
		self.max_rules
	}

	/// Every rule as (prefix, depth, result), longest prefixes first
	pub fn rules(&self) -> Vec<(u32, u8, T)> {
		let mut rules = Vec::with_capacity(self.nb_rules);
		for depth in (0..=V4_MAX_DEPTH).rev() {
			let mut tbl: Vec<_> = self.tables[depth as usize]
				.iter()
				.map(|(ip, res)| (*ip, depth, *res))
				.collect();
			tbl.sort_by_key(|r| r.0);
			rules.extend(tbl);
		}
		rules
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn ip(a: u8, b: u8, c: u8, d: u8) -> u32 {
		u32::from(Ipv4Addr::new(a, b, c, d))
	}

	#[test]
	fn longest_prefix_wins() {
		let mut lpm = Lpm::new(16);
		lpm.insert(ip(10, 0, 0, 0), 8, 1u16).unwrap();
		lpm.insert(ip(10, 1, 0, 0), 16, 2).unwrap();
		lpm.insert(ip(10, 1, 2, 3), 32, 3).unwrap();
		assert_eq!(lpm.lookup(ip(10, 9, 9, 9)), Some(1));
		assert_eq!(lpm.lookup(ip(10, 1, 9, 9)), Some(2));
		assert_eq!(lpm.lookup(ip(10, 1, 2, 3)), Some(3));
		assert_eq!(lpm.lookup(ip(11, 1, 2, 3)), None);
	}

	#[test]
	fn duplicate_prefix_replaces_result() {
		let mut lpm = Lpm::new(1);
		lpm.insert(ip(20, 1, 1, 1), 32, 9u16).unwrap();
		lpm.insert(ip(20, 1, 1, 1), 32, 4).unwrap();
		assert_eq!(lpm.len(), 1);
		assert_eq!(lpm.lookup(ip(20, 1, 1, 1)), Some(4));
	}

	#[test]
	fn full_table_rejects_new_prefix() {
		let mut lpm = Lpm::new(1);
		lpm.insert(ip(20, 1, 1, 1), 32, 0u16).unwrap();
		assert_eq!(
			lpm.insert(ip(20, 1, 2, 1), 32, 1),
			Err(LpmError::CapacityExceeded(1))
		);
		assert_eq!(lpm.insert(ip(1, 1, 1, 1), 33, 1), Err(LpmError::InvalidDepth(33)));
	}

	#[test]
	fn delete_clears_depth() {
		let mut lpm = Lpm::new(4);
		lpm.insert(0, 0, 7u16).unwrap();
		lpm.insert(ip(10, 0, 0, 0), 8, 1).unwrap();
		assert_eq!(lpm.delete(ip(10, 2, 3, 4), 8), Ok(1));
		assert_eq!(lpm.lookup(ip(10, 2, 3, 4)), Some(7));
		assert_eq!(lpm.delete(ip(10, 0, 0, 0), 8), Err(LpmError::NoRule(ip(10, 0, 0, 0), 8)));
		assert_eq!(lpm.len(), 1);
	}

	fn brute_force(rules: &[(u32, u8, u16)], addr: u32) -> Option<u16> {
		let mut best: Option<(u8, u16)> = None;
		for &(p, d, r) in rules {
			if addr & mask(d) == p & mask(d) {
				match best {
					Some((bd, _)) if bd > d => {}
					_ => best = Some((d, r)),
				}
			}
		}
		best.map(|b| b.1)
	}

	proptest! {
		#[test]
		fn matches_linear_scan(
			rules in proptest::collection::vec((any::<u32>(), 0u8..=32, any::<u16>()), 0..32),
			addrs in proptest::collection::vec(any::<u32>(), 1..32),
		) {
			let mut lpm = Lpm::new(64);
			// model keeps the last result per prefix, like the table
			let mut model: Vec<(u32, u8, u16)> = Vec::new();
			for &(p, d, r) in &rules {
				lpm.insert(p, d, r).unwrap();
				model.retain(|&(mp, md, _)| !(md == d && mp & mask(d) == p & mask(d)));
				model.push((p, d, r));
			}
			for &a in &addrs {
				prop_assert_eq!(lpm.lookup(a), brute_force(&model, a));
				// steer some addresses onto the inserted prefixes
				if let Some(&(p, _, _)) = model.first() {
					prop_assert_eq!(lpm.lookup(p), brute_force(&model, p));
				}
			}
		}

		#[test]
		fn batched_lookup_equals_single_lookups(
			rules in proptest::collection::vec((any::<u32>(), 8u8..=32, any::<u16>()), 1..16),
			pick in proptest::collection::vec(any::<bool>(), 4),
			noise in proptest::collection::vec(any::<u32>(), 4),
		) {
			let mut lpm = Lpm::new(64);
			for &(p, d, r) in &rules {
				lpm.insert(p, d, r).unwrap();
			}
			let mut ips = [0u32; 4];
			for i in 0..4 {
				ips[i] = if pick[i] { rules[i % rules.len()].0 } else { noise[i] };
			}
			let default = [100, 101, 102, 103];
			let batched = lpm.lookup_x4(ips, default);
			for i in 0..4 {
				prop_assert_eq!(batched[i], lpm.lookup(ips[i]).unwrap_or(default[i]));
			}
		}
	}
}
