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

use std::net::IpAddr;

/// Host name to address lookup. Implementations may block.
pub trait Resolver: Send + Sync {
   /// All addresses for `host`, empty when it does not resolve
   fn resolve(&self, host: &str) -> Vec<IpAddr>;

   fn resolve_first(&self, host: &str) -> Option<IpAddr> {
      self.resolve(host).into_iter().next()
   }
}

/// Uses the operating system resolver. Literal addresses are returned without a lookup.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
   fn resolve(&self, host: &str) -> Vec<IpAddr> {
      use std::net::ToSocketAddrs;

      let host = host.trim();
      if let Ok(ip) = host.parse::<IpAddr>() {
         return vec![ip];
      }

      match (host, 0).to_socket_addrs() {
         Ok(addrs) => {
            let mut ips: Vec<IpAddr> = Vec::new();
            for addr in addrs {
               if !ips.contains(&addr.ip()) {
                  ips.push(addr.ip());
               }
            }
            ips
         }
         Err(err) => {
            tracing::debug!("failed to resolve {host}: {err}");
            Vec::new()
         }
      }
   }
}

/// Fixed table, for offline use and tests
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
   entries: std::collections::HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with(mut self, host: &str, ip: IpAddr) -> Self {
      self.entries.entry(host.to_ascii_lowercase()).or_default().push(ip);
      self
   }
}

impl Resolver for StaticResolver {
   fn resolve(&self, host: &str) -> Vec<IpAddr> {
      if let Ok(ip) = host.trim().parse::<IpAddr>() {
         return vec![ip];
      }
      self.entries.get(&host.trim().to_ascii_lowercase()).cloned().unwrap_or_default()
   }
}

#[test]
fn system_resolver_literal_test() {
   let ips = SystemResolver.resolve(" 127.0.0.1 ");
   assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
}

#[test]
fn static_resolver_test() {
   let resolver = StaticResolver::new().with("Example.org", "93.184.216.34".parse().unwrap());
   assert_eq!(resolver.resolve_first("example.org"), Some("93.184.216.34".parse().unwrap()));
   assert!(resolver.resolve("missing.test").is_empty());
}
