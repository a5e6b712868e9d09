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

//! Geolocation of addresses seen in captures and probes

use std::net::IpAddr;

#[derive(Clone, Debug, PartialEq)]
pub struct Geolocation {
   pub ip: IpAddr,
   pub hostname: Option<String>,
   pub country_iso: Option<String>,
   pub lat: f64,
   pub lon: f64,
}

impl Geolocation {
   /// A point with no location data, used when the lookup has nothing for `ip`
   pub fn unknown(ip: IpAddr) -> Self {
      Self { ip, hostname: None, country_iso: None, lat: 0.0, lon: 0.0 }
   }

   pub fn is_known(&self) -> bool {
      self.country_iso.is_some()
   }
}

/// Address to location lookup provided by the embedding application
pub trait GeoLocator: Send + Sync {
   fn locate(&self, ip: IpAddr) -> Option<Geolocation>;

   /// Like `locate`, falling back to an unknown point
   fn locate_or_unknown(&self, ip: IpAddr) -> Geolocation {
      self.locate(ip).unwrap_or_else(|| Geolocation::unknown(ip))
   }
}

/// Knows nothing about any address
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopGeoLocator;

impl GeoLocator for NoopGeoLocator {
   fn locate(&self, _ip: IpAddr) -> Option<Geolocation> {
      None
   }
}

struct GeoRange {
   first: u128,
   last: u128,
   country_iso: String,
   hostname: Option<String>,
   lat: f64,
   lon: f64,
}

/// Offline lookup over inclusive address ranges. The first matching range wins.
#[derive(Default)]
pub struct RangeGeoLocator {
   ranges: Vec<GeoRange>,
}

impl RangeGeoLocator {
   pub fn new() -> Self {
      Self::default()
   }

   /// Adds `first..=last`. Both ends must be the same address family, otherwise the range is ignored.
   pub fn with_range(mut self, first: IpAddr, last: IpAddr, country_iso: &str, lat: f64, lon: f64) -> Self {
      if first.is_ipv4() != last.is_ipv4() {
         tracing::warn!("ignoring geo range {first}..={last}, mixed address families");
         return self;
      }

      self.ranges.push(GeoRange {
         first: ip_to_u128(&first),
         last: ip_to_u128(&last),
         country_iso: country_iso.to_string(),
         hostname: None,
         lat,
         lon,
      });
      self
   }

   /// Attaches a hostname to the most recently added range
   pub fn with_hostname(mut self, hostname: &str) -> Self {
      if let Some(range) = self.ranges.last_mut() {
         range.hostname = Some(hostname.to_string());
      }
      self
   }
}

impl GeoLocator for RangeGeoLocator {
   fn locate(&self, ip: IpAddr) -> Option<Geolocation> {
      let needle = ip_to_u128(&ip);
      self.ranges.iter().find(|range| range.first <= needle && needle <= range.last).map(|range| Geolocation {
         ip,
         hostname: range.hostname.clone(),
         country_iso: Some(range.country_iso.clone()),
         lat: range.lat,
         lon: range.lon,
      })
   }
}

/// IPv4 addresses are mapped into ::ffff:0:0/96 so both families share one ordering
fn ip_to_u128(ip: &IpAddr) -> u128 {
   match ip {
      IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
      IpAddr::V6(v6) => u128::from(*v6),
   }
}

/// Memoizes another locator per address. Misses are cached too.
pub struct CachedGeoLocator<L> {
   inner: L,
   cache: dashmap::DashMap<IpAddr, Option<Geolocation>>,
}

impl<L: GeoLocator> CachedGeoLocator<L> {
   pub fn new(inner: L) -> Self {
      Self { inner, cache: dashmap::DashMap::with_capacity(1024) }
   }

   pub fn len(&self) -> usize {
      self.cache.len()
   }

   pub fn is_empty(&self) -> bool {
      self.cache.is_empty()
   }
}

impl<L: GeoLocator> GeoLocator for CachedGeoLocator<L> {
   fn locate(&self, ip: IpAddr) -> Option<Geolocation> {
      if let Some(cached) = self.cache.get(&ip) {
         return cached.clone();
      }

      let located = self.inner.locate(ip);
      self.cache.insert(ip, located.clone());
      located
   }
}
