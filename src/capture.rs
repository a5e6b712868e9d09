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

//! Capture session lifecycle
//!
//! One engine runs at most one session at a time. A session owns a dedicated worker thread which
//! reads frames, filters and enriches them, appends accepted records to the session buffer and
//! notifies listeners, all on the worker thread and in arrival order.
//!
//! Every `start_capture` and `clear` begins a new session generation. A worker only ends the
//! session it was started for, so a worker outliving a `clear` neither changes the state nor
//! notifies `capture_stopped`.

use crate::dns::Resolver;
use crate::error::{Error, Origin};
use crate::filter::{CaptureFilter, CompiledFilter};
use crate::geo::GeoLocator;
use crate::listener::{CaptureListener, ListenerBus, ListenerId};
use crate::packet::PacketRecord;
use crate::parser::LinkType;
use crate::source::{FrameSource, NextFrame, RawFrame, SourceOpener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
   Idle,
   Capturing,
   Stopped,
}

struct Session {
   state: CaptureState,
   /// Set once a session was started, reset by `clear`
   started: bool,
   filter: Option<CaptureFilter>,
   stop: Arc<AtomicBool>,
   generation: u64,
}

/// Worker thread and the generation it runs
type WorkerSlot = Option<(u64, std::thread::JoinHandle<()>)>;

struct EngineShared {
   session: Mutex<Session>,
   buffer: RwLock<Vec<Arc<PacketRecord>>>,
   listeners: ListenerBus<dyn CaptureListener>,
   dropped_frames: AtomicU64,
   opener: Arc<dyn SourceOpener>,
   geo: Arc<dyn GeoLocator>,
   resolver: Arc<dyn Resolver>,
}

pub struct CaptureEngine {
   shared: Arc<EngineShared>,
   /// Taken before the session lock, never held while joining
   worker: Mutex<WorkerSlot>,
}

impl CaptureEngine {
   pub fn new(opener: Arc<dyn SourceOpener>, geo: Arc<dyn GeoLocator>, resolver: Arc<dyn Resolver>) -> Self {
      Self {
         shared: Arc::new(EngineShared {
            session: Mutex::new(Session {
               state: CaptureState::Idle,
               started: false,
               filter: None,
               stop: Arc::new(AtomicBool::new(false)),
               generation: 0,
            }),
            buffer: RwLock::new(Vec::new()),
            listeners: ListenerBus::new(),
            dropped_frames: AtomicU64::new(0),
            opener,
            geo,
            resolver,
         }),
         worker: Mutex::new(None),
      }
   }

   pub fn subscribe(&self, listener: Arc<dyn CaptureListener>) -> ListenerId {
      self.shared.listeners.subscribe(listener)
   }

   pub fn unsubscribe(&self, id: ListenerId) -> bool {
      self.shared.listeners.unsubscribe(id)
   }

   pub fn state(&self) -> CaptureState {
      self.shared.lock_session().state
   }

   pub fn is_capturing(&self) -> bool {
      self.state() == CaptureState::Capturing
   }

   /// Filter of the current or last session
   pub fn filter(&self) -> Option<CaptureFilter> {
      self.shared.lock_session().filter.clone()
   }

   /// Frames read but not delivered, either unparseable or rejected by the filter, since the last `clear`
   pub fn dropped_frames(&self) -> u64 {
      self.shared.dropped_frames.load(Ordering::Relaxed)
   }

   /// Starts a session on a new worker thread, which notifies `start_capture` before reading.
   /// Records of a previous session are kept, call `clear` first for an empty buffer.
   pub fn start_capture(&self, filter: CaptureFilter) -> crate::Result<()> {
      loop {
         let previous = {
            let mut worker = self.lock_worker();
            if self.shared.lock_session().state == CaptureState::Capturing {
               return Err(Error::InvalidState("a capture is already running"));
            }
            match worker.take() {
               None => return self.spawn_session(&mut worker, filter),
               // restarted from a listener of the previous worker, which is about to return
               Some((_, handle)) if handle.thread().id() == std::thread::current().id() => {
                  drop(handle);
                  return self.spawn_session(&mut worker, filter);
               }
               Some(previous) => previous,
            }
         };

         // the previous worker already left its loop, it only has to be reaped
         self.reap(previous);
      }
   }

   /// Stops the running session and waits for the worker to deliver its last accepted frame and
   /// `capture_stopped`. Does nothing when no session is running.
   ///
   /// When called from a listener, on the worker thread itself, the stop is only requested.
   pub fn end_capture(&self) {
      let handle = {
         let mut worker = self.lock_worker();
         self.shared.lock_session().stop.store(true, Ordering::Release);
         match worker.as_ref() {
            Some((_, handle)) if handle.thread().id() == std::thread::current().id() => None,
            _ => worker.take(),
         }
      };

      if let Some(handle) = handle {
         self.reap(handle);
      }
   }

   /// Broadcasts `focus_packet` for `record`
   pub fn focus(&self, record: &Arc<PacketRecord>, animation: bool) {
      let is_capturing = self.is_capturing();
      self.shared.listeners.notify(|listener| listener.focus_packet(record, is_capturing, animation));
   }

   /// Empties the buffer and returns to `Idle`. A running session is ended first.
   pub fn clear(&self) {
      self.end_capture();

      let _worker = self.lock_worker();
      let mut session = self.shared.lock_session();
      // a session started since `end_capture` returned is stopped too, silently
      session.stop.store(true, Ordering::Release);
      session.generation += 1;
      self.shared.buffer.write().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
      self.shared.dropped_frames.store(0, Ordering::Relaxed);
      session.state = CaptureState::Idle;
      session.started = false;
      session.filter = None;
   }

   /// Snapshot of the buffer in arrival order
   pub fn get_capture(&self) -> Vec<Arc<PacketRecord>> {
      self.shared.read_buffer().clone()
   }

   pub fn len(&self) -> usize {
      self.shared.read_buffer().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Replays the session to every listener: `start_capture` if a session was started, each
   /// buffered record in order, then `capture_stopped` unless a session is still running.
   pub fn renotify_packets(&self) {
      let (started, state) = {
         let session = self.shared.lock_session();
         (session.started, session.state)
      };
      if !started {
         return;
      }

      let records = self.get_capture();
      self.shared.listeners.notify(|listener| listener.start_capture());
      for record in records.iter() {
         self.shared.listeners.notify(|listener| listener.packet_added(record));
      }
      if state != CaptureState::Capturing {
         self.shared.listeners.notify(|listener| listener.capture_stopped());
      }
   }

   pub fn to_csv(&self) -> crate::Result<String> {
      crate::export::to_csv(&self.get_capture())
   }

   pub fn to_text(&self) -> String {
      crate::export::to_text(&self.get_capture())
   }

   /// Runs under the worker lock, so the handle is stored before anyone can try to join it
   fn spawn_session(&self, worker: &mut WorkerSlot, filter: CaptureFilter) -> crate::Result<()> {
      let (stop, generation) = {
         let mut session = self.shared.lock_session();
         session.state = CaptureState::Capturing;
         session.started = true;
         session.filter = Some(filter.clone());
         session.stop = Arc::new(AtomicBool::new(false));
         session.generation += 1;
         (session.stop.clone(), session.generation)
      };

      tracing::info!("starting capture: {filter}");
      let shared = self.shared.clone();
      let spawned = std::thread::Builder::new().name("faf-capture".to_string()).spawn(move || shared.run_session(generation, filter, stop));

      match spawned {
         Ok(handle) => {
            *worker = Some((generation, handle));
            Ok(())
         }
         Err(err) => {
            tracing::error!("failed to spawn capture worker: {err}");
            self.shared.lock_session().state = CaptureState::Stopped;
            Err(Error::Device(format!("failed to spawn capture worker: {err}")))
         }
      }
   }

   fn reap(&self, (generation, handle): (u64, std::thread::JoinHandle<()>)) {
      if handle.join().is_err() {
         tracing::error!("capture worker panicked");
         self.shared.fail_session(generation, &Error::Device("capture worker panicked".to_string()));
      }
   }

   fn lock_worker(&self) -> std::sync::MutexGuard<'_, WorkerSlot> {
      self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
   }
}

impl Drop for CaptureEngine {
   fn drop(&mut self) {
      self.end_capture();
   }
}

impl EngineShared {
   fn lock_session(&self) -> std::sync::MutexGuard<'_, Session> {
      self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
   }

   fn read_buffer(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<PacketRecord>>> {
      self.buffer.read().unwrap_or_else(|poisoned| poisoned.into_inner())
   }

   fn run_session(&self, generation: u64, filter: CaptureFilter, stop: Arc<AtomicBool>) {
      let started_at = std::time::Instant::now();
      self.listeners.notify(|listener| listener.start_capture());

      let mut source = match self.opener.open() {
         Ok(source) => source,
         Err(err) => {
            tracing::error!("failed to open capture source: {err}");
            self.fail_session(generation, &err);
            return;
         }
      };

      let compiled = filter.compile(self.resolver.as_ref());
      let deadline = if filter.duration.is_zero() { None } else { Some(started_at + filter.duration) };

      let mut accepted: u64 = 0;
      let mut dropped: u64 = 0;
      let outcome = self.read_frames(source.as_mut(), &compiled, deadline, &stop, &mut accepted, &mut dropped);

      tracing::info!("capture ended: {accepted} frames delivered, {dropped} dropped");
      match outcome {
         Ok(()) => self.finish_session(generation),
         Err(err) => {
            tracing::error!("capture source failed: {err}");
            self.fail_session(generation, &err);
         }
      }
   }

   fn read_frames(
      &self,
      source: &mut dyn FrameSource,
      filter: &CompiledFilter,
      deadline: Option<std::time::Instant>,
      stop: &AtomicBool,
      accepted: &mut u64,
      dropped: &mut u64,
   ) -> crate::Result<()> {
      let link_type = source.link_type();
      loop {
         if stop.load(Ordering::Acquire) {
            return Ok(());
         }
         if let Some(deadline) = deadline {
            if std::time::Instant::now() >= deadline {
               tracing::debug!("capture duration elapsed");
               return Ok(());
            }
         }

         match source.next_frame()? {
            NextFrame::Frame(raw) => match self.classify(raw, link_type, filter) {
               Some(record) => {
                  *accepted += 1;
                  self.deliver(record);
               }
               None => {
                  *dropped += 1;
                  self.dropped_frames.fetch_add(1, Ordering::Relaxed);
               }
            },
            NextFrame::Idle => continue,
            NextFrame::Exhausted => return Ok(()),
         }
      }
   }

   fn classify(&self, raw: RawFrame, link_type: LinkType, filter: &CompiledFilter) -> Option<Arc<PacketRecord>> {
      let frame = match crate::parser::parse_link_frame(link_type, &raw.data) {
         Ok(frame) => frame,
         Err(err) => {
            tracing::trace!("dropping frame: {err}");
            return None;
         }
      };

      if !filter.accepts(&frame) {
         return None;
      }

      let mut record = PacketRecord::new(frame.transport, frame.source_ip, frame.dest_ip, raw.timestamp_ms, frame.payload.to_vec());
      if let Some(ip) = remote_endpoint(frame.source_ip, frame.dest_ip) {
         record = record.with_geolocation(self.geo.locate_or_unknown(ip));
      }

      Some(Arc::new(record))
   }

   fn deliver(&self, record: Arc<PacketRecord>) {
      self.buffer.write().unwrap_or_else(|poisoned| poisoned.into_inner()).push(record.clone());
      self.listeners.notify(|listener| listener.packet_added(&record));
   }

   /// Moves session `generation` to `Stopped`. False when a `clear` or a newer session replaced it.
   fn stop_generation(&self, generation: u64) -> bool {
      let mut session = self.lock_session();
      if session.generation != generation {
         tracing::debug!("capture session {generation} was replaced, not reporting its end");
         return false;
      }
      session.state = CaptureState::Stopped;
      true
   }

   fn finish_session(&self, generation: u64) {
      if self.stop_generation(generation) {
         self.listeners.notify(|listener| listener.capture_stopped());
      }
   }

   /// Reports `err` once and stops the session
   fn fail_session(&self, generation: u64, err: &Error) {
      if self.stop_generation(generation) {
         self.listeners.notify(|listener| listener.error(err, Origin::Capture));
         self.listeners.notify(|listener| listener.capture_stopped());
      }
   }
}

/// The endpoint worth locating, the first public one, else the source
fn remote_endpoint(source: Option<std::net::IpAddr>, dest: Option<std::net::IpAddr>) -> Option<std::net::IpAddr> {
   [dest, source].into_iter().flatten().find(|ip| !crate::util::is_local_address(ip)).or(source)
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::dns::StaticResolver;
   use crate::filter::tests::CountingResolver;
   use crate::geo::{NoopGeoLocator, RangeGeoLocator};
   use crate::listener::ErrorListener;
   use crate::packet::Protocol;
   use crate::parser::tests::{icmp_frame, raw_ip_tcp_packet, tcp_frame, udp_frame};
   use crate::source::{AfterScript, ScriptedSource};
   use std::time::Duration;

   #[derive(Clone, Debug, PartialEq)]
   enum Event {
      Started,
      Added(i64),
      Stopped,
      Focus(i64, bool, bool),
      Failed(String),
   }

   struct Recorder {
      events: Mutex<Vec<Event>>,
      stopped_tx: kanal::Sender<()>,
   }

   impl Recorder {
      fn new() -> (Arc<Self>, kanal::Receiver<()>) {
         let (tx, rx) = kanal::unbounded();
         (Arc::new(Self { events: Mutex::new(Vec::new()), stopped_tx: tx }), rx)
      }

      fn events(&self) -> Vec<Event> {
         self.events.lock().unwrap().clone()
      }

      fn added(&self) -> Vec<i64> {
         self.events().into_iter().filter_map(|event| if let Event::Added(ts) = event { Some(ts) } else { None }).collect()
      }
   }

   impl ErrorListener for Recorder {
      fn error(&self, error: &Error, origin: Origin) {
         assert_eq!(origin, Origin::Capture);
         self.events.lock().unwrap().push(Event::Failed(error.to_string()));
      }
   }

   impl CaptureListener for Recorder {
      fn start_capture(&self) {
         self.events.lock().unwrap().push(Event::Started);
      }
      fn packet_added(&self, record: &Arc<PacketRecord>) {
         self.events.lock().unwrap().push(Event::Added(record.timestamp()));
      }
      fn capture_stopped(&self) {
         self.events.lock().unwrap().push(Event::Stopped);
         let _ = self.stopped_tx.send(());
      }
      fn focus_packet(&self, record: &Arc<PacketRecord>, is_capturing: bool, animation: bool) {
         self.events.lock().unwrap().push(Event::Focus(record.timestamp(), is_capturing, animation));
      }
   }

   fn frame(data: Vec<u8>, timestamp_ms: i64) -> RawFrame {
      RawFrame { data, timestamp_ms }
   }

   fn mixed_frames() -> Vec<RawFrame> {
      vec![
         frame(tcp_frame([10, 0, 0, 1], [93, 184, 216, 34], 50000, 443, b"hello"), 1),
         frame(udp_frame([10, 0, 0, 1], [8, 8, 8, 8], 50001, 53, b"query"), 2),
         frame(vec![0u8; 9], 3),
         frame(tcp_frame([93, 184, 216, 34], [10, 0, 0, 1], 443, 50000, &[7u8; 600]), 4),
         frame(icmp_frame([10, 0, 0, 1], [1, 1, 1, 1], b"ping"), 5),
         frame(tcp_frame([10, 0, 0, 1], [93, 184, 216, 34], 50000, 443, b"bye"), 6),
      ]
   }

   fn engine_with(frames: Vec<RawFrame>, after: AfterScript) -> CaptureEngine {
      let frames = Mutex::new(Some(frames));
      let opener = move || -> crate::Result<Box<dyn FrameSource>> {
         let frames = frames.lock().unwrap().take().unwrap_or_default();
         Ok(ScriptedSource::new(frames, after.clone()).boxed())
      };
      CaptureEngine::new(Arc::new(opener), Arc::new(NoopGeoLocator), Arc::new(StaticResolver::new()))
   }

   fn wait_stopped(rx: &kanal::Receiver<()>) {
      let deadline = std::time::Instant::now() + Duration::from_secs(5);
      while std::time::Instant::now() < deadline {
         if let Ok(Some(())) = rx.try_recv() {
            return;
         }
         std::thread::sleep(Duration::from_millis(5));
      }
      panic!("capture did not stop");
   }

   #[test]
   fn test_buffer_matches_delivery_order() {
      let engine = engine_with(mixed_frames(), AfterScript::Exhaust);
      let (recorder, stopped) = Recorder::new();
      engine.subscribe(recorder.clone());

      engine.start_capture(CaptureFilter::default()).unwrap();
      wait_stopped(&stopped);
      engine.end_capture();

      let buffered: Vec<i64> = engine.get_capture().iter().map(|record| record.timestamp()).collect();
      assert_eq!(buffered, vec![1, 2, 4, 5, 6]);
      assert_eq!(recorder.added(), buffered);
      assert_eq!(engine.state(), CaptureState::Stopped);
      assert_eq!(engine.dropped_frames(), 1);
      assert_eq!(recorder.events().first(), Some(&Event::Started));
      assert_eq!(recorder.events().last(), Some(&Event::Stopped));
   }

   #[test]
   fn test_protocol_and_length_soundness() {
      let engine = engine_with(mixed_frames(), AfterScript::Exhaust);
      let (recorder, stopped) = Recorder::new();
      engine.subscribe(recorder.clone());

      engine.start_capture(CaptureFilter::new([Protocol::Tcp]).with_length_cap(100)).unwrap();
      wait_stopped(&stopped);

      let records = engine.get_capture();
      assert_eq!(records.len(), 2);
      assert!(records.iter().all(|record| record.protocol() == Protocol::Tcp));
      assert!(records.iter().all(|record| record.data_length() <= 100));
   }

   #[test]
   fn test_second_start_is_invalid_state() {
      let engine = engine_with(Vec::new(), AfterScript::Idle);
      engine.start_capture(CaptureFilter::default()).unwrap();

      let err = engine.start_capture(CaptureFilter::default()).unwrap_err();
      assert!(matches!(err, Error::InvalidState(_)));

      engine.end_capture();
      assert_eq!(engine.state(), CaptureState::Stopped);
   }

   #[test]
   fn test_end_capture_delivers_stopped_once() {
      let engine = engine_with(mixed_frames(), AfterScript::Idle);
      let (recorder, _stopped) = Recorder::new();
      engine.subscribe(recorder.clone());

      engine.start_capture(CaptureFilter::default()).unwrap();
      let deadline = std::time::Instant::now() + Duration::from_secs(5);
      while recorder.added().len() < 5 && std::time::Instant::now() < deadline {
         std::thread::sleep(Duration::from_millis(2));
      }
      engine.end_capture();
      engine.end_capture();

      let stopped_count = recorder.events().iter().filter(|event| **event == Event::Stopped).count();
      assert_eq!(stopped_count, 1);
      assert_eq!(recorder.added(), vec![1, 2, 4, 5, 6]);
   }

   #[test]
   fn test_duration_auto_stop() {
      let engine = engine_with(Vec::new(), AfterScript::Idle);
      let (recorder, stopped) = Recorder::new();
      engine.subscribe(recorder.clone());

      let started_at = std::time::Instant::now();
      engine.start_capture(CaptureFilter::default().with_duration_secs(1)).unwrap();
      wait_stopped(&stopped);

      assert!(started_at.elapsed() >= Duration::from_secs(1));
      assert_eq!(engine.state(), CaptureState::Stopped);
   }

   #[test]
   fn test_device_failure_reported_once() {
      let engine = engine_with(mixed_frames(), AfterScript::Fail("interface down".into()));
      let (recorder, stopped) = Recorder::new();
      engine.subscribe(recorder.clone());

      engine.start_capture(CaptureFilter::default()).unwrap();
      wait_stopped(&stopped);

      let failures: Vec<Event> = recorder.events().into_iter().filter(|event| matches!(event, Event::Failed(_))).collect();
      assert_eq!(failures, vec![Event::Failed("capture device unavailable: interface down".to_string())]);
      assert_eq!(engine.state(), CaptureState::Stopped);
      // frames accepted before the failure are kept
      assert_eq!(engine.len(), 5);
   }

   #[test]
   fn test_open_failure_reported() {
      let opener = || -> crate::Result<Box<dyn FrameSource>> { Err(Error::Device("permission denied".into())) };
      let engine = CaptureEngine::new(Arc::new(opener), Arc::new(NoopGeoLocator), Arc::new(StaticResolver::new()));
      let (recorder, stopped) = Recorder::new();
      engine.subscribe(recorder.clone());

      engine.start_capture(CaptureFilter::default()).unwrap();
      wait_stopped(&stopped);

      assert_eq!(
         recorder.events(),
         vec![Event::Started, Event::Failed("capture device unavailable: permission denied".to_string()), Event::Stopped]
      );
   }

   #[test]
   fn test_clear_empties_buffer() {
      let engine = engine_with(mixed_frames(), AfterScript::Idle);
      engine.start_capture(CaptureFilter::default()).unwrap();
      std::thread::sleep(Duration::from_millis(50));

      engine.clear();
      assert!(engine.get_capture().is_empty());
      assert_eq!(engine.state(), CaptureState::Idle);
      assert_eq!(engine.dropped_frames(), 0);

      engine.clear();
      assert!(engine.get_capture().is_empty());
   }

   #[test]
   fn test_renotify_replays_session() {
      let engine = engine_with(mixed_frames(), AfterScript::Exhaust);
      let (original, stopped) = Recorder::new();
      let original_id = engine.subscribe(original.clone());

      engine.start_capture(CaptureFilter::default()).unwrap();
      wait_stopped(&stopped);
      engine.end_capture();

      engine.unsubscribe(original_id);
      let (fresh, _) = Recorder::new();
      engine.subscribe(fresh.clone());
      engine.renotify_packets();

      assert_eq!(fresh.events(), original.events());
      assert_eq!(engine.len(), 5);
   }

   #[test]
   fn test_renotify_while_capturing_omits_stopped() {
      let engine = engine_with(mixed_frames(), AfterScript::Idle);
      engine.start_capture(CaptureFilter::default()).unwrap();
      let deadline = std::time::Instant::now() + Duration::from_secs(5);
      while engine.len() < 5 && std::time::Instant::now() < deadline {
         std::thread::sleep(Duration::from_millis(2));
      }

      let (fresh, _) = Recorder::new();
      engine.subscribe(fresh.clone());
      engine.renotify_packets();

      let events = fresh.events();
      assert_eq!(events.first(), Some(&Event::Started));
      assert!(!events.contains(&Event::Stopped));
      engine.end_capture();
   }

   #[test]
   fn test_renotify_before_any_session_is_silent() {
      let engine = engine_with(Vec::new(), AfterScript::Exhaust);
      let (fresh, _) = Recorder::new();
      engine.subscribe(fresh.clone());
      engine.renotify_packets();
      assert!(fresh.events().is_empty());
   }

   #[test]
   fn test_focus_reports_state_without_mutation() {
      let engine = engine_with(mixed_frames(), AfterScript::Exhaust);
      let (recorder, stopped) = Recorder::new();
      engine.subscribe(recorder.clone());
      engine.start_capture(CaptureFilter::default()).unwrap();
      wait_stopped(&stopped);

      let record = engine.get_capture()[0].clone();
      engine.focus(&record, true);

      assert_eq!(recorder.events().last(), Some(&Event::Focus(1, false, true)));
      assert_eq!(engine.len(), 5);
   }

   #[test]
   fn test_records_are_located() {
      let geo = RangeGeoLocator::new().with_range("93.184.216.0".parse().unwrap(), "93.184.216.255".parse().unwrap(), "US", 42.15, -70.82);
      let frames = Mutex::new(Some(mixed_frames()));
      let opener = move || -> crate::Result<Box<dyn FrameSource>> {
         Ok(ScriptedSource::new(frames.lock().unwrap().take().unwrap_or_default(), AfterScript::Exhaust).boxed())
      };
      let engine = CaptureEngine::new(Arc::new(opener), Arc::new(geo), Arc::new(StaticResolver::new()));
      let (recorder, stopped) = Recorder::new();
      engine.subscribe(recorder.clone());
      engine.start_capture(CaptureFilter::new([Protocol::Tcp])).unwrap();
      wait_stopped(&stopped);

      for record in engine.get_capture() {
         let location = record.geolocation().unwrap();
         assert_eq!(location.ip, "93.184.216.34".parse::<std::net::IpAddr>().unwrap());
         assert_eq!(location.country_iso.as_deref(), Some("US"));
      }
   }

   #[test]
   fn test_remote_endpoint_prefers_public() {
      let local: std::net::IpAddr = "192.168.0.2".parse().unwrap();
      let public: std::net::IpAddr = "1.1.1.1".parse().unwrap();
      assert_eq!(remote_endpoint(Some(local), Some(public)), Some(public));
      assert_eq!(remote_endpoint(Some(public), Some(local)), Some(public));
      assert_eq!(remote_endpoint(Some(local), Some(local)), Some(local));
      assert_eq!(remote_endpoint(None, None), None);
   }

   /// Clears the engine from inside `packet_added`, on the worker thread
   struct ClearOnPacket {
      engine: once_cell::sync::OnceCell<std::sync::Weak<CaptureEngine>>,
      cleared_tx: kanal::Sender<()>,
   }

   impl ErrorListener for ClearOnPacket {}

   impl CaptureListener for ClearOnPacket {
      fn packet_added(&self, _record: &Arc<PacketRecord>) {
         if let Some(engine) = self.engine.get().and_then(std::sync::Weak::upgrade) {
            engine.clear();
            let _ = self.cleared_tx.send(());
         }
      }
   }

   #[test]
   fn test_clear_from_listener_stays_idle() {
      let engine = Arc::new(engine_with(mixed_frames(), AfterScript::Idle));
      let (recorder, stopped) = Recorder::new();
      engine.subscribe(recorder.clone());
      let (cleared_tx, cleared_rx) = kanal::unbounded();
      let clearer = Arc::new(ClearOnPacket { engine: once_cell::sync::OnceCell::new(), cleared_tx });
      let _ = clearer.engine.set(Arc::downgrade(&engine));
      engine.subscribe(clearer);

      engine.start_capture(CaptureFilter::default()).unwrap();
      cleared_rx.recv().unwrap();
      // reaps the worker, which must have returned without ending the cleared session
      engine.end_capture();

      assert_eq!(engine.state(), CaptureState::Idle);
      assert!(engine.is_empty());
      assert_eq!(recorder.events(), vec![Event::Started, Event::Added(1)]);
      assert!(matches!(stopped.try_recv(), Ok(None)));

      // the next session starts from a clean slate
      engine.start_capture(CaptureFilter::default().with_duration_secs(1)).unwrap();
      wait_stopped(&stopped);
      assert_eq!(engine.state(), CaptureState::Stopped);
   }

   #[test]
   fn test_end_capture_right_after_start_waits_for_worker() {
      for _ in 0..50 {
         let engine = engine_with(mixed_frames(), AfterScript::Idle);
         let (recorder, _stopped) = Recorder::new();
         engine.subscribe(recorder.clone());

         engine.start_capture(CaptureFilter::default()).unwrap();
         engine.end_capture();

         let events = recorder.events();
         assert_eq!(events.first(), Some(&Event::Started));
         assert_eq!(events.last(), Some(&Event::Stopped));
         assert_eq!(events.iter().filter(|event| **event == Event::Stopped).count(), 1);
         assert_eq!(engine.state(), CaptureState::Stopped);
      }
   }

   #[test]
   fn test_duration_includes_source_open() {
      let opener = || -> crate::Result<Box<dyn FrameSource>> {
         std::thread::sleep(Duration::from_millis(600));
         Ok(ScriptedSource::new(Vec::new(), AfterScript::Idle).boxed())
      };
      let engine = CaptureEngine::new(Arc::new(opener), Arc::new(NoopGeoLocator), Arc::new(StaticResolver::new()));
      let (recorder, stopped) = Recorder::new();
      engine.subscribe(recorder.clone());

      let started_at = std::time::Instant::now();
      engine.start_capture(CaptureFilter::default().with_duration_secs(1)).unwrap();
      wait_stopped(&stopped);

      let elapsed = started_at.elapsed();
      assert!(elapsed >= Duration::from_secs(1));
      assert!(elapsed < Duration::from_millis(1500), "session ran for {elapsed:?}");
   }

   #[test]
   fn test_host_resolved_once_per_session() {
      let resolver = Arc::new(CountingResolver::new(StaticResolver::new().with("example.org", "93.184.216.34".parse().unwrap())));
      let frames = Mutex::new(Some(mixed_frames()));
      let opener = move || -> crate::Result<Box<dyn FrameSource>> {
         Ok(ScriptedSource::new(frames.lock().unwrap().take().unwrap_or_default(), AfterScript::Exhaust).boxed())
      };
      let engine = CaptureEngine::new(Arc::new(opener), Arc::new(NoopGeoLocator), resolver.clone());
      let (recorder, stopped) = Recorder::new();
      engine.subscribe(recorder.clone());

      engine.start_capture(CaptureFilter::default().with_host("example.org")).unwrap();
      wait_stopped(&stopped);
      assert_eq!(recorder.added(), vec![1, 4, 6]);
      assert_eq!(resolver.calls(), 1);

      engine.start_capture(CaptureFilter::default().with_host("example.org")).unwrap();
      wait_stopped(&stopped);
      assert_eq!(resolver.calls(), 2);
   }

   #[test]
   fn test_raw_ip_source() {
      let frames = Mutex::new(Some(vec![
         frame(raw_ip_tcp_packet([10, 0, 0, 1], [93, 184, 216, 34], 50000, 443, b"hello"), 1),
         frame(tcp_frame([10, 0, 0, 1], [93, 184, 216, 34], 50000, 443, b"ethernet"), 2),
      ]));
      let opener = move || -> crate::Result<Box<dyn FrameSource>> {
         let frames = frames.lock().unwrap().take().unwrap_or_default();
         Ok(ScriptedSource::new(frames, AfterScript::Exhaust).with_link_type(LinkType::RawIp).boxed())
      };
      let engine = CaptureEngine::new(Arc::new(opener), Arc::new(NoopGeoLocator), Arc::new(StaticResolver::new()));
      let (recorder, stopped) = Recorder::new();
      engine.subscribe(recorder.clone());

      engine.start_capture(CaptureFilter::new([Protocol::Tcp])).unwrap();
      wait_stopped(&stopped);

      let records = engine.get_capture();
      assert_eq!(records.len(), 1);
      assert_eq!(records[0].dest_port(), Some(443));
      assert_eq!(records[0].payload(), "hello");
      assert_eq!(engine.dropped_frames(), 1);
   }
}
