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

//! Live packet capture, external network probes and a searchable lookup history.
//!
//! The three services share one shape: a background worker produces events, enriches them with
//! external lookups (DNS, geolocation, an external command) and fans them out to listeners
//! registered on a [`listener::ListenerBus`]. Each service can replay its current state to newly
//! attached listeners.

pub mod capture;
pub mod command;
pub mod dns;
pub mod error;
pub mod export;
pub mod filter;
pub mod geo;
pub mod history;
pub mod listener;
pub mod packet;
pub mod parser;
pub mod persist;
pub mod probe;
pub mod source;
pub mod statics;
pub mod util;

pub use capture::{CaptureEngine, CaptureState};
pub use error::{Error, Origin, ProbeError, Result};
pub use filter::{CaptureFilter, PortSpec};
pub use geo::Geolocation;
pub use history::HistoryIndex;
pub use listener::{CaptureListener, ErrorListener, HistoryListener, ListenerBus, ListenerId, ProbeListener};
pub use packet::{PacketRecord, Protocol, Transport};
pub use probe::{ProbeConfig, ProbeResult, ProbeService};
