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

use clap::Parser;
use faf_scope::{PortSpec, Protocol};

pub static ARGS: once_cell::sync::Lazy<Args> = once_cell::sync::Lazy::new(Args::parse);

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
   Csv,
   Text,
}

/// FaF Scope - Live Packet Capture and Network Probes
#[derive(Parser, Debug, Default)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
   /// daemon mode, no banner and no live packet table.
   #[clap(short, long)]
   pub daemon: bool,

   /// capture live from this interface. Requires the `live-capture` feature.
   #[clap(short, long)]
   pub interface: Option<String>,

   /// replay frames from a pcap file instead of a live interface. Requires the `live-capture` feature.
   #[clap(short, long)]
   pub read: Option<std::path::PathBuf>,

   /// list capture interfaces and exit.
   #[clap(long)]
   pub list_interfaces: bool,

   /// protocols to keep, comma separated (tcp,udp,icmp,other). Defaults to all of them.
   #[clap(long, value_delimiter = ',')]
   pub protocols: Vec<Protocol>,

   /// keep only traffic from or to this port, or port range A-B.
   #[clap(short, long)]
   pub port: Option<PortSpec>,

   /// drop packets whose payload is longer than this many bytes.
   #[clap(long)]
   pub length_cap: Option<usize>,

   /// keep only traffic from or to this host (name or address).
   #[clap(long)]
   pub host: Option<String>,

   /// stop capturing after this many seconds. 0 captures until the source runs dry.
   #[clap(long, default_value_t = 0)]
   pub duration: u64,

   /// dump the capture buffer once the capture stops.
   #[clap(long, value_enum)]
   pub export: Option<ExportFormat>,

   /// file to write the export to. Defaults to stdout.
   #[clap(short, long)]
   pub output: Option<std::path::PathBuf>,

   /// look up the owner of this host or address with whois.
   #[clap(long)]
   pub probe: Option<String>,

   /// seconds a probe command may run before it is killed. 0 disables the limit.
   #[clap(long, default_value_t = faf_scope::statics::PROBE_TIMEOUT_SECS)]
   pub probe_timeout: u64,

   /// list previously used targets and hosts starting with this prefix.
   #[clap(long)]
   pub history: Option<String>,

   /// data directory to store the lookup history. Defaults to the temp directory.
   #[clap(long)]
   pub data_directory: Option<std::path::PathBuf>,
}
