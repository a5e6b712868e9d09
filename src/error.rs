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

//! Error types shared by the capture, probe and history services

use thiserror::Error;

/// Library result type
pub type Result<T> = std::result::Result<T, Error>;

/// Component an error was raised by, delivered alongside every error on the error channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
   Capture,
   Probe,
   History,
}

impl std::fmt::Display for Origin {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      match self {
         Origin::Capture => write!(f, "capture"),
         Origin::Probe => write!(f, "probe"),
         Origin::History => write!(f, "history"),
      }
   }
}

#[derive(Debug, Error)]
pub enum Error {
   /// Operation not allowed in the current lifecycle state
   #[error("invalid state: {0}")]
   InvalidState(&'static str),

   /// A frame could not be decoded. Absorbed by the capture worker, never notified.
   #[error("malformed frame: {0}")]
   TransientParse(String),

   /// The capture source could not be opened or stopped delivering (permissions, interface down)
   #[error("capture device unavailable: {0}")]
   Device(String),

   #[error("probe failed: {0}")]
   ProbeExecution(#[from] ProbeError),

   /// The persisted history could not be read back
   #[error("history file unusable: {0}")]
   Persistence(String),

   #[error("export failed: {0}")]
   Export(#[from] csv::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),
}

/// Failure of one probe attempt, wrapped in [`Error::ProbeExecution`]
#[derive(Debug, Error)]
pub enum ProbeError {
   #[error("could not resolve {0}")]
   Unresolved(String),

   /// Every candidate command was missing on this host
   #[error("probe command not found: {0}")]
   CommandMissing(String),

   #[error("{program} exited with {code:?}: {stderr}")]
   Failed { program: String, code: Option<i32>, stderr: String },

   #[error("{program} did not finish within {secs}s")]
   TimedOut { program: String, secs: u64 },

   #[error("failed to run {program}: {source}")]
   Spawn { program: String, source: std::io::Error },
}

impl Error {
   /// Errors which end a session or a probe attempt, and therefore reach listeners
   pub fn is_fatal(&self) -> bool {
      !matches!(self, Error::TransientParse(_) | Error::Persistence(_))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_probe_error_wraps() {
      let err: Error = ProbeError::CommandMissing("whois".to_string()).into();
      assert!(matches!(err, Error::ProbeExecution(ProbeError::CommandMissing(_))));
      assert_eq!(err.to_string(), "probe failed: probe command not found: whois");
   }

   #[test]
   fn test_absorbed_kinds_are_not_fatal() {
      assert!(!Error::TransientParse("short".into()).is_fatal());
      assert!(!Error::Persistence("bad".into()).is_fatal());
      assert!(Error::Device("eth0 down".into()).is_fatal());
   }
}
