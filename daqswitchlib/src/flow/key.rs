//! The flow key is parsed once per frame at ingress and stored in the `Mbuf`
//!
//! Layout of the frames it understands:
//! 	Ethernet II | IPv4 | TCP | application header (16 bytes, optional)
//!
//! IPv4 and TCP fields are big-endian on the wire and stored here as host values.
//! The application header words are written by the DAQ applications in little-endian
//! order, so they are decoded as such. A fragment request carries the wire bytes
//! `20 df dc 00` in its type id, `0x00dc_df20` once decoded.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use std::{fmt, net::Ipv4Addr};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowKey {
	pub ttl: u8,
	pub proto: u8,
	pub header_checksum: u16,
	pub sip: u32,
	pub dip: u32,
	pub sport: u16,
	pub dport: u16,
	pub type_id: u32,
	pub transaction_id: u32,
	pub size: u32,
	pub event_id: u32,
}

impl FlowKey {
	pub const ETHERTYPE_IPV4: u16 = 0x0800;
	pub const IPPROTO_TCP: u8 = 6;
	pub const APP_HDR_LEN: usize = 16;
	pub const TYPE_ID_FRAGMENT_REQUEST: u32 = 0x00dc_df20;

	/// Decode the key of an Ethernet frame
	///
	/// Anything that is not IPv4 yields the default key, whose destination address is 0.
	pub fn parse(frame: &[u8]) -> Self {
		let mut key = FlowKey::default();
		let sliced = match SlicedPacket::from_ethernet(frame) {
			Ok(s) => s,
			Err(_) => return key,
		};
		let ip = match sliced.ip {
			Some(InternetSlice::Ipv4(ip)) => ip.slice(),
			_ => return key,
		};

		let total_len = BigEndian::read_u16(&ip[2..4]) as usize;
		key.ttl = ip[8];
		key.proto = ip[9];
		key.header_checksum = BigEndian::read_u16(&ip[10..12]);
		key.sip = BigEndian::read_u32(&ip[12..16]);
		key.dip = BigEndian::read_u32(&ip[16..20]);

		let tcp = match sliced.transport {
			Some(TransportSlice::Tcp(tcp)) => tcp.slice(),
			_ => return key,
		};
		key.sport = BigEndian::read_u16(&tcp[0..2]);
		key.dport = BigEndian::read_u16(&tcp[2..4]);

		let tcp_hdr_len = ((tcp[12] >> 4) as usize) * 4;
		let payload_len = total_len.saturating_sub(ip.len() + tcp_hdr_len);
		if payload_len >= Self::APP_HDR_LEN && sliced.payload.len() >= Self::APP_HDR_LEN {
			let app = &sliced.payload[..Self::APP_HDR_LEN];
			key.type_id = LittleEndian::read_u32(&app[0..4]);
			key.transaction_id = LittleEndian::read_u32(&app[4..8]);
			key.size = LittleEndian::read_u32(&app[8..12]);
			key.event_id = LittleEndian::read_u32(&app[12..16]);
		}
		key
	}

	#[inline]
	pub fn is_fragment_request(&self) -> bool {
		self.type_id == Self::TYPE_ID_FRAGMENT_REQUEST
	}
}

impl fmt::Display for FlowKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}:{} -> {}:{} proto {} ttl {}",
			Ipv4Addr::from(self.sip),
			self.sport,
			Ipv4Addr::from(self.dip),
			self.dport,
			self.proto,
			self.ttl
		)?;
		if self.is_fragment_request() {
			write!(f, " fragment request event 0x{:08x}", self.event_id)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testutil::{tcp_frame, udp_frame, AppHdr};

	#[test]
	fn parses_fragment_request() {
		let app = AppHdr {
			type_id: FlowKey::TYPE_ID_FRAGMENT_REQUEST,
			transaction_id: 7,
			size: 16,
			event_id: 0xdead_beef,
		};
		let frame = tcp_frame([10, 0, 0, 1], 40000, [20, 1, 7, 1], 9000, Some(app));
		let key = FlowKey::parse(&frame);
		assert_eq!(key.sip, u32::from(Ipv4Addr::new(10, 0, 0, 1)));
		assert_eq!(key.dip, u32::from(Ipv4Addr::new(20, 1, 7, 1)));
		assert_eq!(key.sport, 40000);
		assert_eq!(key.dport, 9000);
		assert_eq!(key.proto, FlowKey::IPPROTO_TCP);
		assert_eq!(key.ttl, 64);
		assert_eq!(key.transaction_id, 7);
		assert_eq!(key.size, 16);
		assert_eq!(key.event_id, 0xdead_beef);
		assert!(key.is_fragment_request());
	}

	#[test]
	fn fragment_request_tag_wire_bytes() {
		let app = AppHdr {
			type_id: FlowKey::TYPE_ID_FRAGMENT_REQUEST,
			transaction_id: 0,
			size: 0,
			event_id: 0,
		};
		let frame = tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, Some(app));
		// ethernet 14 + ipv4 20 + tcp 20
		assert_eq!(&frame[54..58], &[0x20, 0xdf, 0xdc, 0x00]);
	}

	#[test]
	fn other_payloads_are_not_requests() {
		let app = AppHdr {
			type_id: 0x00dc_df21,
			transaction_id: 1,
			size: 2,
			event_id: 3,
		};
		let key = FlowKey::parse(&tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, Some(app)));
		assert_eq!(key.type_id, 0x00dc_df21);
		assert_eq!(key.event_id, 3);
		assert!(!key.is_fragment_request());
	}

	#[test]
	fn short_payload_leaves_app_fields_empty() {
		let key = FlowKey::parse(&tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, None));
		assert_eq!(key.dport, 2);
		assert_eq!(key.type_id, 0);
		assert_eq!(key.event_id, 0);
	}

	#[test]
	fn udp_has_addresses_only() {
		let key = FlowKey::parse(&udp_frame([10, 0, 0, 1], [10, 0, 0, 9]));
		assert_eq!(key.dip, u32::from(Ipv4Addr::new(10, 0, 0, 9)));
		assert_eq!(key.sport, 0);
		assert!(!key.is_fragment_request());
	}

	#[test]
	fn non_ip_frame_has_no_destination() {
		let mut frame = vec![0u8; 60];
		frame[12] = 0x08;
		frame[13] = 0x06; // arp
		assert_eq!(FlowKey::parse(&frame), FlowKey::default());
		assert_eq!(FlowKey::parse(&[0u8; 4]).dip, 0);
	}
}
