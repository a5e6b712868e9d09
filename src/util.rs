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

/// Gets duration since UNIX_EPOCH in milliseconds, 0 if the clock is set before the epoch
#[inline]
pub fn get_unix_ts_millis() -> i64 {
   std::time::SystemTime::now().duration_since(std::time::SystemTime::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Formats epoch milliseconds as local time, e.g. `2024-03-01 14:02:11.405`
pub fn format_epoch_millis(millis: i64) -> String {
   use chrono::TimeZone;

   match chrono::Local.timestamp_millis_opt(millis) {
      chrono::LocalResult::Single(date) | chrono::LocalResult::Ambiguous(date, _) => date.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
      chrono::LocalResult::None => String::from("-"),
   }
}

/// Returns true for addresses which never carry geolocation data (private, loopback, link local)
pub fn is_local_address(ip: &std::net::IpAddr) -> bool {
   match ip {
      std::net::IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_broadcast() || v4.is_unspecified(),
      std::net::IpAddr::V6(v6) => {
         let first_segment = v6.segments()[0];
         v6.is_loopback()
            || v6.is_unspecified()
            // fc00::/7 unique local, fe80::/10 link local
            || (first_segment & 0xfe00) == 0xfc00
            || (first_segment & 0xffc0) == 0xfe80
      }
   }
}

#[test]
fn format_epoch_millis_test() {
   let formatted = format_epoch_millis(0);
   assert_eq!(formatted.len(), "1970-01-01 00:00:00.000".len());
   assert!(formatted.ends_with(".000"));
   assert_ne!(format_epoch_millis(1_000), format_epoch_millis(2_000));
}

#[test]
fn is_local_address_test() {
   assert!(is_local_address(&"192.168.1.20".parse().unwrap()));
   assert!(is_local_address(&"10.0.0.1".parse().unwrap()));
   assert!(is_local_address(&"::1".parse().unwrap()));
   assert!(is_local_address(&"fe80::1".parse().unwrap()));
   assert!(!is_local_address(&"8.8.8.8".parse().unwrap()));
   assert!(!is_local_address(&"2001:4860:4860::8888".parse().unwrap()));
}
