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

//! Capture filtering
//!
//! A frame is accepted only if it passes every configured criterion. Rejected frames are dropped
//! silently.

use crate::packet::Protocol;
use crate::parser::ParsedFrame;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// A single port or an inclusive range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortSpec {
   Single(u16),
   Range(u16, u16),
}

impl PortSpec {
   pub fn matches(&self, port: u16) -> bool {
      match *self {
         PortSpec::Single(expected) => port == expected,
         PortSpec::Range(low, high) => low <= port && port <= high,
      }
   }
}

impl std::fmt::Display for PortSpec {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      match self {
         PortSpec::Single(port) => write!(f, "{port}"),
         PortSpec::Range(low, high) => write!(f, "{low}-{high}"),
      }
   }
}

impl std::str::FromStr for PortSpec {
   type Err = String;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let parse_port = |value: &str| value.trim().parse::<u16>().map_err(|_| format!("invalid port '{}'", value.trim()));

      match s.split_once('-') {
         Some((low, high)) => {
            let (low, high) = (parse_port(low)?, parse_port(high)?);
            if low > high {
               return Err(format!("invalid port range {low}-{high}"));
            }
            Ok(PortSpec::Range(low, high))
         }
         None => Ok(PortSpec::Single(parse_port(s)?)),
      }
   }
}

/// Criteria of one capture session
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureFilter {
   pub protocols: BTreeSet<Protocol>,
   pub port: Option<PortSpec>,
   pub length_cap: Option<usize>,
   pub host: Option<String>,
   /// Zero captures until `end_capture`
   pub duration: std::time::Duration,
}

impl Default for CaptureFilter {
   fn default() -> Self {
      Self { protocols: Protocol::ALL.into_iter().collect(), port: None, length_cap: None, host: None, duration: std::time::Duration::ZERO }
   }
}

impl CaptureFilter {
   pub fn new<I: IntoIterator<Item = Protocol>>(protocols: I) -> Self {
      Self { protocols: protocols.into_iter().collect(), ..Self::default() }
   }

   pub fn with_port(mut self, port: PortSpec) -> Self {
      self.port = Some(port);
      self
   }

   pub fn with_length_cap(mut self, length_cap: usize) -> Self {
      self.length_cap = Some(length_cap);
      self
   }

   pub fn with_host(mut self, host: &str) -> Self {
      self.host = Some(host.to_string());
      self
   }

   pub fn with_duration_secs(mut self, seconds: u64) -> Self {
      self.duration = std::time::Duration::from_secs(seconds);
      self
   }

   /// Binds the host criterion to addresses. Called once per session.
   pub fn compile(&self, resolver: &dyn crate::dns::Resolver) -> CompiledFilter {
      let host_ips = self.host.as_deref().map(|host| {
         let ips: BTreeSet<IpAddr> = resolver.resolve(host).into_iter().collect();
         if ips.is_empty() {
            tracing::warn!("host filter {host} did not resolve, no frame will match");
         }
         ips
      });

      CompiledFilter { protocols: self.protocols.clone(), port: self.port, length_cap: self.length_cap, host_ips }
   }
}

impl std::fmt::Display for CaptureFilter {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let protocols: Vec<String> = self.protocols.iter().map(|protocol| protocol.to_string()).collect();
      write!(f, "protocols={}", protocols.join(","))?;
      if let Some(port) = &self.port {
         write!(f, " port={port}")?;
      }
      if let Some(length_cap) = self.length_cap {
         write!(f, " length<={length_cap}")?;
      }
      if let Some(host) = &self.host {
         write!(f, " host={host}")?;
      }
      if !self.duration.is_zero() {
         write!(f, " duration={}s", self.duration.as_secs())?;
      }
      Ok(())
   }
}

/// Session filter with the host already resolved
#[derive(Clone, Debug)]
pub struct CompiledFilter {
   protocols: BTreeSet<Protocol>,
   port: Option<PortSpec>,
   length_cap: Option<usize>,
   host_ips: Option<BTreeSet<IpAddr>>,
}

impl CompiledFilter {
   pub fn accepts(&self, frame: &ParsedFrame<'_>) -> bool {
      if !self.protocols.contains(&frame.transport.protocol()) {
         return false;
      }

      if let Some(port) = &self.port {
         let source_matches = frame.transport.source_port().map(|p| port.matches(p)).unwrap_or(false);
         let dest_matches = frame.transport.dest_port().map(|p| port.matches(p)).unwrap_or(false);
         if !source_matches && !dest_matches {
            return false;
         }
      }

      if let Some(length_cap) = self.length_cap {
         if frame.payload.len() > length_cap {
            return false;
         }
      }

      if let Some(host_ips) = &self.host_ips {
         let endpoint_matches = |ip: Option<IpAddr>| ip.map(|ip| host_ips.contains(&ip)).unwrap_or(false);
         if !endpoint_matches(frame.source_ip) && !endpoint_matches(frame.dest_ip) {
            return false;
         }
      }

      true
   }
}
