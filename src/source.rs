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

//! Where raw frames come from

use crate::parser::LinkType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
   pub data: Vec<u8>,
   pub timestamp_ms: i64,
}

impl RawFrame {
   /// Stamped with the current time
   pub fn now(data: Vec<u8>) -> Self {
      Self { data, timestamp_ms: crate::util::get_unix_ts_millis() }
   }
}

#[derive(Debug)]
pub enum NextFrame {
   Frame(RawFrame),
   /// Read timed out without a frame, the caller should check for a stop request and read again
   Idle,
   /// The source has no more frames (end of a capture file)
   Exhausted,
}

/// A device or file delivering frames. Owned by exactly one capture worker.
pub trait FrameSource: Send {
   /// `Err` means the source cannot deliver any more frames and ends the session
   fn next_frame(&mut self) -> crate::Result<NextFrame>;

   /// Framing of every frame this source delivers
   fn link_type(&self) -> LinkType {
      LinkType::Ethernet
   }
}

/// Opens a fresh source for every capture session
pub trait SourceOpener: Send + Sync {
   fn open(&self) -> crate::Result<Box<dyn FrameSource>>;
}

impl<F> SourceOpener for F
where
   F: Fn() -> crate::Result<Box<dyn FrameSource>> + Send + Sync,
{
   fn open(&self) -> crate::Result<Box<dyn FrameSource>> {
      self()
   }
}

/// What a [`ScriptedSource`] does once its frames are used up
#[derive(Clone, Debug)]
pub enum AfterScript {
   Exhaust,
   /// Keep returning `Idle`, like a quiet interface
   Idle,
   /// Fail like an interface going down
   Fail(String),
}

/// Replays a fixed list of frames, used for replays and tests
pub struct ScriptedSource {
   frames: std::collections::VecDeque<RawFrame>,
   after: AfterScript,
   idle_wait: std::time::Duration,
   link_type: LinkType,
}

impl ScriptedSource {
   pub fn new(frames: Vec<RawFrame>, after: AfterScript) -> Self {
      Self { frames: frames.into(), after, idle_wait: std::time::Duration::from_millis(5), link_type: LinkType::Ethernet }
   }

   pub fn with_link_type(mut self, link_type: LinkType) -> Self {
      self.link_type = link_type;
      self
   }

   pub fn boxed(self) -> Box<dyn FrameSource> {
      Box::new(self)
   }
}

impl FrameSource for ScriptedSource {
   fn next_frame(&mut self) -> crate::Result<NextFrame> {
      if let Some(frame) = self.frames.pop_front() {
         return Ok(NextFrame::Frame(frame));
      }

      match &self.after {
         AfterScript::Exhaust => Ok(NextFrame::Exhausted),
         AfterScript::Idle => {
            std::thread::sleep(self.idle_wait);
            Ok(NextFrame::Idle)
         }
         AfterScript::Fail(reason) => Err(crate::Error::Device(reason.clone())),
      }
   }

   fn link_type(&self) -> LinkType {
      self.link_type
   }
}

#[cfg(feature = "live-capture")]
pub use self::pcap_source::{list_devices, PcapOpener, PcapSource};

#[cfg(feature = "live-capture")]
mod pcap_source {
   use super::{FrameSource, NextFrame, RawFrame, SourceOpener};
   use crate::parser::LinkType;

   pub fn list_devices() -> crate::Result<Vec<String>> {
      let devices = pcap::Device::list().map_err(|err| crate::Error::Device(err.to_string()))?;
      Ok(devices.into_iter().map(|device| device.name).collect())
   }

   pub struct PcapSource {
      capture: pcap::Capture<dyn pcap::Activated>,
      name: String,
      link_type: LinkType,
   }

   impl PcapSource {
      pub fn open_device(device_name: &str) -> crate::Result<Self> {
         let capture = pcap::Capture::from_device(device_name)
            .and_then(|device| {
               device
                  .promisc(true)
                  .snaplen(crate::statics::CAPTURE_SNAPLEN)
                  .timeout(crate::statics::CAPTURE_READ_TIMEOUT_MS)
                  .open()
            })
            .map_err(|err| crate::Error::Device(format!("{device_name}: {err}")))?;

         Self::with_capture(capture.into(), device_name.to_string())
      }

      pub fn open_file(path: &std::path::Path) -> crate::Result<Self> {
         let capture = pcap::Capture::from_file(path).map_err(|err| crate::Error::Device(format!("{}: {err}", path.display())))?;
         Self::with_capture(capture.into(), path.display().to_string())
      }

      fn with_capture(capture: pcap::Capture<dyn pcap::Activated>, name: String) -> crate::Result<Self> {
         let datalink = capture.get_datalink();
         let link_type = LinkType::from_dlt(datalink.0).ok_or_else(|| {
            let link_name = datalink.get_name().unwrap_or_else(|_| datalink.0.to_string());
            crate::Error::Device(format!("{name}: unsupported link type {link_name}"))
         })?;
         tracing::debug!("{name} delivers {link_type:?} frames");
         Ok(Self { capture, name, link_type })
      }
   }

   impl FrameSource for PcapSource {
      fn next_frame(&mut self) -> crate::Result<NextFrame> {
         match self.capture.next_packet() {
            Ok(packet) => {
               let ts = packet.header.ts;
               let timestamp_ms = ts.tv_sec as i64 * 1_000 + ts.tv_usec as i64 / 1_000;
               Ok(NextFrame::Frame(RawFrame { data: packet.data.to_vec(), timestamp_ms }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(NextFrame::Idle),
            Err(pcap::Error::NoMorePackets) => Ok(NextFrame::Exhausted),
            Err(err) => Err(crate::Error::Device(format!("{}: {err}", self.name))),
         }
      }

      fn link_type(&self) -> LinkType {
         self.link_type
      }
   }

   #[derive(Clone, Debug)]
   pub enum PcapOpener {
      Device(String),
      File(std::path::PathBuf),
   }

   impl SourceOpener for PcapOpener {
      fn open(&self) -> crate::Result<Box<dyn FrameSource>> {
         let source = match self {
            PcapOpener::Device(name) => PcapSource::open_device(name)?,
            PcapOpener::File(path) => PcapSource::open_file(path)?,
         };
         Ok(Box::new(source))
      }
   }
}
