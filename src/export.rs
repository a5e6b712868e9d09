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

//! CSV and plain text dumps of a capture buffer, one row or block per record in buffer order

use crate::packet::PacketRecord;
use std::sync::Arc;

pub const CSV_HEADER: [&str; 12] =
   ["date", "timestamp", "protocol", "source_ip", "source_port", "dest_ip", "dest_port", "length", "country", "hostname", "ip", "payload"];

fn optional<T: ToString>(value: Option<T>) -> String {
   value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn to_csv(records: &[Arc<PacketRecord>]) -> crate::Result<String> {
   let mut writer = csv::WriterBuilder::new().from_writer(Vec::with_capacity(records.len() * 128));
   writer.write_record(CSV_HEADER)?;

   for record in records {
      let location = record.geolocation();
      writer.write_record([
         record.date().to_string(),
         record.timestamp().to_string(),
         record.protocol().to_string(),
         optional(record.source_ip()),
         optional(record.source_port()),
         optional(record.dest_ip()),
         optional(record.dest_port()),
         record.data_length().to_string(),
         optional(location.and_then(|l| l.country_iso.as_deref())),
         optional(location.and_then(|l| l.hostname.as_deref())),
         optional(location.map(|l| l.ip)),
         record.payload().to_string(),
      ])?;
   }

   let bytes = writer.into_inner().map_err(|err| crate::Error::Io(err.into_error()))?;
   Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn to_text(records: &[Arc<PacketRecord>]) -> String {
   use std::fmt::Write;

   let mut out = String::with_capacity(records.len() * 256);
   for record in records {
      let endpoint = |ip: Option<std::net::IpAddr>, port: Option<u16>| match (ip, port) {
         (Some(ip), Some(port)) => format!("{ip}:{port}"),
         (Some(ip), None) => ip.to_string(),
         (None, Some(port)) => format!("*:{port}"),
         (None, None) => String::from("*"),
      };

      // writing to a String cannot fail
      let _ = writeln!(
         out,
         "[{}] {} {} -> {} length={}",
         record.date(),
         record.protocol(),
         endpoint(record.source_ip(), record.source_port()),
         endpoint(record.dest_ip(), record.dest_port()),
         record.data_length()
      );
      if let Some(country) = record.geolocation().and_then(|location| location.country_iso.as_deref()) {
         let _ = writeln!(out, "location: {country}");
      }
      if !record.payload().is_empty() {
         let _ = writeln!(out, "{}", record.payload());
      }
      out.push('\n');
   }

   out
}
