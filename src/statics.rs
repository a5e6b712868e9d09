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

pub const PROJECT_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of probes allowed to run an external command at the same time. Further calls queue.
pub const PROBE_WORKERS: usize = 3;

/// Default upper bound on a single external probe command, in seconds.
pub const PROBE_TIMEOUT_SECS: u64 = 120;

/// Maximum number of suggestions returned by a history lookup.
pub const HISTORY_QUERY_LIMIT: usize = 20;

/// Read timeout on the capture device. Bounds how long `end_capture` waits for the worker.
pub const CAPTURE_READ_TIMEOUT_MS: i32 = 200;

pub const CAPTURE_SNAPLEN: i32 = 65535;

/// Upper bound on an inflated gzip payload kept by a packet record.
pub const MAX_DECODED_PAYLOAD: usize = 1024 * 1024;

/// Appended to a payload cut at `MAX_DECODED_PAYLOAD`.
pub const DECODED_PAYLOAD_TRUNCATED: &str = "\n[payload truncated]";

/// Sub directory of the data directory holding the persisted state.
pub const DATA_SUBDIRECTORY: &str = "faf-scope";
pub const HISTORY_FILE_NAME: &str = "history.bin";

/// Output lines starting with any of these are notices, not results, and are dropped.
pub const PROBE_BANNER_PREFIXES: [&str; 5] = ["#", "%", ">>>", "NOTICE:", "TERMS OF USE:"];

/// Candidate probe commands, in the order they are tried. The target is appended to the arguments.
/// A later candidate is only used when the former is missing on the host. Each candidate writes its
/// whole answer to stdout, since any stderr output fails a probe.
#[cfg(unix)]
pub const PROBE_COMMANDS: [(&str, &[&str]); 2] = [("whois", &[]), ("jwhois", &[])];

#[cfg(not(unix))]
pub const PROBE_COMMANDS: [(&str, &[&str]); 1] = [("whois", &["-nobanner"])];

/// Resolves the history file under `data_directory`, falling back to the temp dir.
pub fn history_path(data_directory: Option<&std::path::Path>) -> std::path::PathBuf {
   let mut path = data_directory.map(std::path::Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
   path.push(DATA_SUBDIRECTORY);
   path.push(HISTORY_FILE_NAME);
   path
}
