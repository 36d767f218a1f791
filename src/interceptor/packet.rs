//! IP/transport header parsing for queued packets.

use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use std::net::IpAddr;

use crate::connection::{ConnectionDescriptor, Direction, Protocol};

/// A queued packet's tuple, and the bytes after its transport header.
#[derive(Debug)]
pub struct ParsedPacket<'a> {
    pub descriptor: ConnectionDescriptor,
    pub transport_payload: &'a [u8],
}

/// Parse a raw IP packet as delivered by the queue (no link-layer header).
/// `None` for anything that is not TCP or UDP over IPv4/IPv6.
pub fn parse(payload: &[u8], direction: Direction) -> Option<ParsedPacket<'_>> {
    let version = payload.first()? >> 4;
    let (src_ip, dst_ip, proto, ip_len): (IpAddr, IpAddr, u8, usize) = match version {
        4 => {
            let ip = Ipv4HeaderSlice::from_slice(payload).ok()?;
            (
                ip.source_addr().into(),
                ip.destination_addr().into(),
                ip.protocol(),
                ip.slice().len(),
            )
        }
        // Extension headers are not followed; such packets are not
        // connection starts we care about.
        6 => {
            let ip = Ipv6HeaderSlice::from_slice(payload).ok()?;
            (
                ip.source_addr().into(),
                ip.destination_addr().into(),
                ip.next_header(),
                ip.slice().len(),
            )
        }
        _ => return None,
    };

    let protocol = Protocol::from_ip_number(proto)?;
    let transport = payload.get(ip_len..)?;

    let (src_port, dst_port, header_len) = match protocol {
        Protocol::Tcp => {
            let tcp = TcpHeaderSlice::from_slice(transport).ok()?;
            (tcp.source_port(), tcp.destination_port(), tcp.slice().len())
        }
        Protocol::Udp => {
            let udp = UdpHeaderSlice::from_slice(transport).ok()?;
            (udp.source_port(), udp.destination_port(), udp.slice().len())
        }
    };

    Some(ParsedPacket {
        descriptor: ConnectionDescriptor::new(protocol, src_ip, src_port, dst_ip, dst_port, direction),
        transport_payload: transport.get(header_len..).unwrap_or(&[]),
    })
}
