//! Frame builders shared by the unit tests

use byteorder::{ByteOrder, LittleEndian};
use pnet::{
	datalink::MacAddr,
	packet::{
		ethernet::{EtherTypes, MutableEthernetPacket},
		ip::IpNextHeaderProtocols,
		ipv4::{self, MutableIpv4Packet},
		tcp::MutableTcpPacket,
		udp::MutableUdpPacket,
	},
};
use std::net::Ipv4Addr;

use crate::flow::FlowKey;

const ETH_LEN: usize = 14;
const IPV4_LEN: usize = 20;
const TCP_LEN: usize = 20;
const UDP_LEN: usize = 8;

#[derive(Clone, Copy, Debug)]
pub(crate) struct AppHdr {
	pub type_id: u32,
	pub transaction_id: u32,
	pub size: u32,
	pub event_id: u32,
}

impl AppHdr {
	pub(crate) fn fragment_request(event_id: u32) -> Self {
		Self {
			type_id: FlowKey::TYPE_ID_FRAGMENT_REQUEST,
			transaction_id: 1,
			size: FlowKey::APP_HDR_LEN as u32,
			event_id,
		}
	}
}

fn ip_frame(src: [u8; 4], dst: [u8; 4], l4_len: usize, tcp: bool) -> Vec<u8> {
	let mut buf = vec![0u8; ETH_LEN + IPV4_LEN + l4_len];
	{
		let mut eth = MutableEthernetPacket::new(&mut buf[..]).unwrap();
		eth.set_destination(MacAddr::new(0x90, 0xe2, 0xba, 0xb2, 0x98, 0x48));
		eth.set_source(MacAddr::new(0x90, 0xe2, 0xba, 0xb2, 0x98, 0x49));
		eth.set_ethertype(EtherTypes::Ipv4);
	}
	{
		let mut ip = MutableIpv4Packet::new(&mut buf[ETH_LEN..]).unwrap();
		ip.set_version(4);
		ip.set_header_length(5);
		ip.set_total_length((IPV4_LEN + l4_len) as u16);
		ip.set_ttl(64);
		ip.set_next_level_protocol(if tcp {
			IpNextHeaderProtocols::Tcp
		} else {
			IpNextHeaderProtocols::Udp
		});
		ip.set_source(Ipv4Addr::from(src));
		ip.set_destination(Ipv4Addr::from(dst));
		let csum = ipv4::checksum(&ip.to_immutable());
		ip.set_checksum(csum);
	}
	buf
}

/// Ethernet + IPv4 + TCP frame, optionally followed by an application header
pub(crate) fn tcp_frame(
	src: [u8; 4],
	sport: u16,
	dst: [u8; 4],
	dport: u16,
	app: Option<AppHdr>,
) -> Vec<u8> {
	let payload_len = app.map(|_| FlowKey::APP_HDR_LEN).unwrap_or(0);
	let mut buf = ip_frame(src, dst, TCP_LEN + payload_len, true);
	{
		let mut tcp = MutableTcpPacket::new(&mut buf[ETH_LEN + IPV4_LEN..]).unwrap();
		tcp.set_source(sport);
		tcp.set_destination(dport);
		tcp.set_data_offset(5);
		tcp.set_window(0xffff);
	}
	if let Some(app) = app {
		let off = ETH_LEN + IPV4_LEN + TCP_LEN;
		LittleEndian::write_u32(&mut buf[off..off + 4], app.type_id);
		LittleEndian::write_u32(&mut buf[off + 4..off + 8], app.transaction_id);
		LittleEndian::write_u32(&mut buf[off + 8..off + 12], app.size);
		LittleEndian::write_u32(&mut buf[off + 12..off + 16], app.event_id);
	}
	buf
}

pub(crate) fn udp_frame(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
	let mut buf = ip_frame(src, dst, UDP_LEN + 4, false);
	{
		let mut udp = MutableUdpPacket::new(&mut buf[ETH_LEN + IPV4_LEN..]).unwrap();
		udp.set_source(5000);
		udp.set_destination(5001);
		udp.set_length((UDP_LEN + 4) as u16);
	}
	buf
}
