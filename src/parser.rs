/*
FaF Scope is a live packet capture and network probe toolkit
Copyright (C) 2022  James Bates

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use crate::packet::Transport;
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use std::net::IpAddr;

/// Framing of the bytes a capture source delivers, from the libpcap datalink type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkType {
   Ethernet,
   /// BSD null or loopback, a 4 byte address family header before the IP packet
   Null,
   /// Linux cooked capture, the 16 byte SLL header used by the `any` device
   LinuxSll,
   /// Bare IPv4 or IPv6 packets
   RawIp,
}

const SLL_HEADER_LEN: usize = 16;
const NULL_HEADER_LEN: usize = 4;

impl LinkType {
   /// Maps a `DLT_*` value. None for a link this crate cannot decode.
   pub fn from_dlt(dlt: i32) -> Option<Self> {
      match dlt {
         1 => Some(LinkType::Ethernet),
         0 | 108 => Some(LinkType::Null),
         113 => Some(LinkType::LinuxSll),
         // DLT_RAW is 12 on most platforms and 14 on OpenBSD
         12 | 14 | 101 | 228 | 229 => Some(LinkType::RawIp),
         _ => None,
      }
   }
}

/// Header fields of one captured frame
#[derive(Debug)]
pub struct ParsedFrame<'a> {
   pub transport: Transport,
   pub source_ip: Option<IpAddr>,
   pub dest_ip: Option<IpAddr>,
   /// Bytes after the last decoded header
   pub payload: &'a [u8],
}

/// Decodes Ethernet II, IPv4/IPv6 and TCP/UDP/ICMP headers. Non IP frames classify as `Other`.
pub fn parse_frame(raw: &[u8]) -> crate::Result<ParsedFrame<'_>> {
   parse_link_frame(LinkType::Ethernet, raw)
}

/// Like [`parse_frame`] for a frame framed as `link`
pub fn parse_link_frame(link: LinkType, raw: &[u8]) -> crate::Result<ParsedFrame<'_>> {
   let parse_err = |err: etherparse::ReadError| crate::Error::TransientParse(format!("{err:?}"));

   let sliced = match link {
      LinkType::Ethernet => SlicedPacket::from_ethernet(raw).map_err(parse_err)?,
      LinkType::RawIp => SlicedPacket::from_ip(raw).map_err(parse_err)?,
      LinkType::Null => SlicedPacket::from_ip(strip_link_header(raw, NULL_HEADER_LEN)?).map_err(parse_err)?,
      LinkType::LinuxSll => {
         let packet = strip_link_header(raw, SLL_HEADER_LEN)?;
         let protocol = u16::from_be_bytes([raw[14], raw[15]]);
         if protocol != ether_type::IPV4 && protocol != ether_type::IPV6 {
            return Ok(ParsedFrame { transport: Transport::Other, source_ip: None, dest_ip: None, payload: packet });
         }
         SlicedPacket::from_ip(packet).map_err(parse_err)?
      }
   };

   let (source_ip, dest_ip) = match &sliced.ip {
      Some(InternetSlice::Ipv4(header, _)) => (Some(IpAddr::V4(header.source_addr())), Some(IpAddr::V4(header.destination_addr()))),
      Some(InternetSlice::Ipv6(header, _)) => (Some(IpAddr::V6(header.source_addr())), Some(IpAddr::V6(header.destination_addr()))),
      None => (None, None),
   };

   let transport = match &sliced.transport {
      Some(TransportSlice::Tcp(header)) => Transport::Tcp { source_port: header.source_port(), dest_port: header.destination_port() },
      Some(TransportSlice::Udp(header)) => Transport::Udp { source_port: header.source_port(), dest_port: header.destination_port() },
      Some(TransportSlice::Icmpv4(_)) | Some(TransportSlice::Icmpv6(_)) => Transport::Icmp,
      Some(TransportSlice::Unknown(_)) | None => Transport::Other,
   };

   Ok(ParsedFrame { transport, source_ip, dest_ip, payload: sliced.payload })
}

fn strip_link_header(raw: &[u8], len: usize) -> crate::Result<&[u8]> {
   raw.get(len..).filter(|packet| !packet.is_empty()).ok_or_else(|| crate::Error::TransientParse(format!("frame shorter than its {len} byte link header")))
}

mod ether_type {
   pub const IPV4: u16 = 0x0800;
   pub const IPV6: u16 = 0x86dd;
}
