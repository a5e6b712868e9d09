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

//! Classified, enriched representation of one captured frame

use crate::geo::Geolocation;
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
   Tcp,
   Udp,
   Icmp,
   Other,
}

impl Protocol {
   pub const ALL: [Protocol; 4] = [Protocol::Tcp, Protocol::Udp, Protocol::Icmp, Protocol::Other];
}

impl std::fmt::Display for Protocol {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let name = match self {
         Protocol::Tcp => "TCP",
         Protocol::Udp => "UDP",
         Protocol::Icmp => "ICMP",
         Protocol::Other => "OTHER",
      };
      f.write_str(name)
   }
}

impl std::str::FromStr for Protocol {
   type Err = String;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      match s.trim().to_ascii_lowercase().as_str() {
         "tcp" => Ok(Protocol::Tcp),
         "udp" => Ok(Protocol::Udp),
         "icmp" => Ok(Protocol::Icmp),
         "other" => Ok(Protocol::Other),
         unknown => Err(format!("unknown protocol '{unknown}', expected tcp, udp, icmp or other")),
      }
   }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
   Tcp { source_port: u16, dest_port: u16 },
   Udp { source_port: u16, dest_port: u16 },
   Icmp,
   Other,
}

impl Transport {
   pub fn protocol(&self) -> Protocol {
      match self {
         Transport::Tcp { .. } => Protocol::Tcp,
         Transport::Udp { .. } => Protocol::Udp,
         Transport::Icmp => Protocol::Icmp,
         Transport::Other => Protocol::Other,
      }
   }

   pub fn source_port(&self) -> Option<u16> {
      match self {
         Transport::Tcp { source_port, .. } | Transport::Udp { source_port, .. } => Some(*source_port),
         Transport::Icmp | Transport::Other => None,
      }
   }

   pub fn dest_port(&self) -> Option<u16> {
      match self {
         Transport::Tcp { dest_port, .. } | Transport::Udp { dest_port, .. } => Some(*dest_port),
         Transport::Icmp | Transport::Other => None,
      }
   }
}

/// How the raw payload bytes are encoded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadEncoding {
   Identity,
   Gzip,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const HTTP_HEADER_END: &[u8] = b"\r\n\r\n";

impl PayloadEncoding {
   /// A bare gzip stream, or an HTTP message whose headers declare a gzip body
   pub fn detect(payload: &[u8]) -> Self {
      if payload.starts_with(&GZIP_MAGIC) {
         return PayloadEncoding::Gzip;
      }

      if let Some(header_end) = find_subslice(payload, HTTP_HEADER_END) {
         let head = String::from_utf8_lossy(&payload[..header_end]).to_ascii_lowercase();
         let is_http = head.starts_with("http/") || head.lines().next().map(|line| line.contains(" http/")).unwrap_or(false);
         if is_http && head.lines().any(|line| line.starts_with("content-encoding:") && line.contains("gzip")) {
            return PayloadEncoding::Gzip;
         }
      }

      PayloadEncoding::Identity
   }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
   haystack.windows(needle.len()).position(|window| window == needle)
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Stamp {
   millis: i64,
   date: String,
}

impl Stamp {
   fn new(millis: i64) -> Self {
      Self { millis, date: crate::util::format_epoch_millis(millis) }
   }
}

#[derive(Debug)]
pub struct PacketRecord {
   transport: Transport,
   source_ip: Option<IpAddr>,
   dest_ip: Option<IpAddr>,
   data_length: usize,
   stamp: Stamp,
   geolocation: Option<Geolocation>,
   raw_payload: Vec<u8>,
   encoding: PayloadEncoding,
   payload: once_cell::sync::OnceCell<String>,
}

impl PacketRecord {
   /// `data_length` is taken from the payload. The encoding is detected from the payload bytes.
   pub fn new(transport: Transport, source_ip: Option<IpAddr>, dest_ip: Option<IpAddr>, timestamp_ms: i64, raw_payload: Vec<u8>) -> Self {
      let encoding = PayloadEncoding::detect(&raw_payload);
      Self {
         transport,
         source_ip,
         dest_ip,
         data_length: raw_payload.len(),
         stamp: Stamp::new(timestamp_ms),
         geolocation: None,
         raw_payload,
         encoding,
         payload: once_cell::sync::OnceCell::new(),
      }
   }

   pub fn with_geolocation(mut self, geolocation: Geolocation) -> Self {
      self.geolocation = Some(geolocation);
      self
   }

   /// Overrides the detected payload encoding
   pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
      self.encoding = encoding;
      self
   }

   /// Replaces the timestamp, recomputing the derived date
   pub fn set_timestamp(&mut self, timestamp_ms: i64) {
      if self.stamp.millis != timestamp_ms {
         self.stamp = Stamp::new(timestamp_ms);
      }
   }

   pub fn transport(&self) -> Transport {
      self.transport
   }

   pub fn protocol(&self) -> Protocol {
      self.transport.protocol()
   }

   pub fn source_port(&self) -> Option<u16> {
      self.transport.source_port()
   }

   pub fn dest_port(&self) -> Option<u16> {
      self.transport.dest_port()
   }

   pub fn source_ip(&self) -> Option<IpAddr> {
      self.source_ip
   }

   pub fn dest_ip(&self) -> Option<IpAddr> {
      self.dest_ip
   }

   pub fn data_length(&self) -> usize {
      self.data_length
   }

   pub fn timestamp(&self) -> i64 {
      self.stamp.millis
   }

   pub fn date(&self) -> &str {
      &self.stamp.date
   }

   pub fn geolocation(&self) -> Option<&Geolocation> {
      self.geolocation.as_ref()
   }

   pub fn encoding(&self) -> PayloadEncoding {
      self.encoding
   }

   pub fn raw_payload(&self) -> &[u8] {
      &self.raw_payload
   }

   /// Payload as text, decompressed when tagged as gzip. Decoded on first call only.
   pub fn payload(&self) -> &str {
      self.payload.get_or_init(|| decode_payload(&self.raw_payload, self.encoding))
   }

   pub fn is_payload_decoded(&self) -> bool {
      self.payload.get().is_some()
   }
}

fn decode_payload(raw: &[u8], encoding: PayloadEncoding) -> String {
   match encoding {
      PayloadEncoding::Identity => String::from_utf8_lossy(raw).into_owned(),
      PayloadEncoding::Gzip => {
         if raw.starts_with(&GZIP_MAGIC) {
            return gunzip_lossy(raw).unwrap_or_else(|| String::from_utf8_lossy(raw).into_owned());
         }

         // HTTP message, keep the headers readable and inflate the body
         match find_subslice(raw, HTTP_HEADER_END) {
            Some(header_end) => {
               let body_start = header_end + HTTP_HEADER_END.len();
               let head = String::from_utf8_lossy(&raw[..body_start]);
               match gunzip_lossy(&raw[body_start..]) {
                  Some(body) => format!("{head}{body}"),
                  None => String::from_utf8_lossy(raw).into_owned(),
               }
            }
            None => String::from_utf8_lossy(raw).into_owned(),
         }
      }
   }
}

/// Inflates as much of the stream as is present, a capture often holds a truncated stream. Output
/// beyond `MAX_DECODED_PAYLOAD` bytes is cut and marked with `DECODED_PAYLOAD_TRUNCATED`.
fn gunzip_lossy(bytes: &[u8]) -> Option<String> {
   use std::io::Read;

   let limit = crate::statics::MAX_DECODED_PAYLOAD;
   let mut decoder = flate2::read::GzDecoder::new(bytes).take(limit as u64 + 1);
   let mut inflated = Vec::with_capacity((bytes.len() * 2).min(limit + 1));
   let mut chunk = [0u8; 4096];
   loop {
      match decoder.read(&mut chunk) {
         Ok(0) => break,
         Ok(n) => inflated.extend_from_slice(&chunk[..n]),
         Err(_) if !inflated.is_empty() => break,
         Err(_) => return None,
      }
   }

   if inflated.len() > limit {
      inflated.truncate(limit);
      let mut text = String::from_utf8_lossy(&inflated).into_owned();
      text.push_str(crate::statics::DECODED_PAYLOAD_TRUNCATED);
      return Some(text);
   }

   Some(String::from_utf8_lossy(&inflated).into_owned())
}
