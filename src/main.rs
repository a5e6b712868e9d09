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

mod args;

use anyhow::Context;
use args::{ExportFormat, ARGS};
use faf_scope::geo::{CachedGeoLocator, GeoLocator, NoopGeoLocator};
use faf_scope::source::SourceOpener;
use faf_scope::{statics, CaptureEngine, CaptureFilter, CaptureListener, Error, ErrorListener, Geolocation, HistoryIndex, Origin, PacketRecord};
use faf_scope::{ProbeConfig, ProbeListener, ProbeService};
use std::sync::Arc;

enum Event {
   Packet(Arc<PacketRecord>),
   Stopped,
   Interrupted,
   ProbeStarted(Geolocation),
   ProbeResult(String),
   Failed(String, Origin),
}

/// Forwards listener callbacks to the main thread, which owns the terminal
struct Forwarder {
   tx: kanal::Sender<Event>,
}

impl Forwarder {
   fn send(&self, event: Event) {
      // the receiver only goes away when main is returning
      let _ = self.tx.send(event);
   }
}

impl ErrorListener for Forwarder {
   fn error(&self, error: &Error, origin: Origin) {
      self.send(Event::Failed(error.to_string(), origin));
   }
}

impl CaptureListener for Forwarder {
   fn packet_added(&self, record: &Arc<PacketRecord>) {
      self.send(Event::Packet(record.clone()));
   }

   fn capture_stopped(&self) {
      self.send(Event::Stopped);
   }
}

impl ProbeListener for Forwarder {
   fn focus_result(&self, point: &Geolocation) {
      self.send(Event::ProbeStarted(point.clone()));
   }

   fn result(&self, text: &str) {
      self.send(Event::ProbeResult(text.to_string()));
   }
}

pub fn main() -> anyhow::Result<()> {
   init_tracing();

   if !ARGS.daemon {
      print_banner();
      print_version();
   }

   if ARGS.list_interfaces {
      return list_interfaces();
   }

   let history = HistoryIndex::load(&statics::history_path(ARGS.data_directory.as_deref()));
   let geo: Arc<dyn GeoLocator> = Arc::new(CachedGeoLocator::new(NoopGeoLocator));
   let resolver = Arc::new(faf_scope::dns::SystemResolver);

   let mut did_something = false;

   if let Some(prefix) = &ARGS.history {
      did_something = true;
      print_history(&history, prefix);
   }

   if let Some(target) = &ARGS.probe {
      did_something = true;
      history.insert(target.trim());
      run_probe(target, geo.clone(), resolver.clone())?;
   }

   if let Some(opener) = capture_opener()? {
      did_something = true;
      if let Some(host) = &ARGS.host {
         history.insert(host.trim());
      }
      run_capture(opener, geo, resolver)?;
   }

   if !did_something {
      tracing::warn!("nothing to do, pass --interface, --read, --probe or --history (see --help)");
   }

   history.flush().context("failed to save the lookup history")?;
   Ok(())
}

fn init_tracing() {
   let default_level = if ARGS.daemon { "warn" } else { "info" };
   let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
   tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn capture_filter() -> CaptureFilter {
   let mut filter = if ARGS.protocols.is_empty() { CaptureFilter::default() } else { CaptureFilter::new(ARGS.protocols.iter().copied()) };
   if let Some(port) = ARGS.port {
      filter = filter.with_port(port);
   }
   if let Some(length_cap) = ARGS.length_cap {
      filter = filter.with_length_cap(length_cap);
   }
   if let Some(host) = &ARGS.host {
      filter = filter.with_host(host.trim());
   }
   filter.with_duration_secs(ARGS.duration)
}

fn run_capture(opener: Arc<dyn SourceOpener>, geo: Arc<dyn GeoLocator>, resolver: Arc<faf_scope::dns::SystemResolver>) -> anyhow::Result<()> {
   let engine = CaptureEngine::new(opener, geo, resolver);
   let (tx, rx) = kanal::unbounded();
   forward_ctrl_c(tx.clone())?;
   engine.subscribe(Arc::new(Forwarder { tx }));

   engine.start_capture(capture_filter())?;

   if !ARGS.daemon {
      println!("{:<23} {:<5} {:>39} {:>39} {:>6} {:>3}", "date", "proto", "source", "destination", "length", "geo");
   }
   while let Ok(event) = rx.recv() {
      match event {
         Event::Packet(record) => {
            if !ARGS.daemon {
               print_record(&record);
            }
         }
         Event::Failed(message, origin) => tracing::error!("{origin}: {message}"),
         Event::Stopped => break,
         Event::Interrupted => {
            tracing::info!("interrupted, stopping the capture");
            break;
         }
         _ => {}
      }
   }
   engine.end_capture();

   tracing::info!("capture stopped with {} packets, {} frames dropped", engine.len(), engine.dropped_frames());

   if let Some(format) = ARGS.export {
      let dump = match format {
         ExportFormat::Csv => engine.to_csv()?,
         ExportFormat::Text => engine.to_text(),
      };
      match &ARGS.output {
         Some(path) => std::fs::write(path, dump).with_context(|| format!("failed to write {}", path.display()))?,
         None => print!("{dump}"),
      }
   }

   Ok(())
}

/// Turns the first Ctrl-C into `Event::Interrupted`, so a capture still ends with its export and
/// the history flush
fn forward_ctrl_c(tx: kanal::Sender<Event>) -> anyhow::Result<()> {
   let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
   let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());
   // the first poll installs the handler, before this returns
   let early = runtime.block_on(async {
      tokio::select! {
         biased;
         result = &mut ctrl_c => Some(result),
         _ = std::future::ready(()) => None,
      }
   });

   std::thread::Builder::new().name("faf-signal".to_string()).spawn(move || {
      let result = match early {
         Some(result) => result,
         None => runtime.block_on(ctrl_c),
      };
      match result {
         Ok(()) => {
            let _ = tx.send(Event::Interrupted);
         }
         Err(err) => tracing::warn!("failed to listen for ctrl-c: {err}"),
      }
   })?;
   Ok(())
}

fn print_record(record: &PacketRecord) {
   let endpoint = |ip: Option<std::net::IpAddr>, port: Option<u16>| match (ip, port) {
      (Some(ip), Some(port)) => format!("{ip}:{port}"),
      (Some(ip), None) => ip.to_string(),
      _ => String::from("*"),
   };

   println!(
      "{:<23} {:<5} {:>39} {:>39} {:>6} {:>3}",
      record.date(),
      record.protocol(),
      endpoint(record.source_ip(), record.source_port()),
      endpoint(record.dest_ip(), record.dest_port()),
      record.data_length(),
      record.geolocation().and_then(|location| location.country_iso.as_deref()).unwrap_or("-"),
   );
}

fn run_probe(target: &str, geo: Arc<dyn GeoLocator>, resolver: Arc<faf_scope::dns::SystemResolver>) -> anyhow::Result<()> {
   let timeout = match ARGS.probe_timeout {
      0 => None,
      secs => Some(std::time::Duration::from_secs(secs)),
   };
   let config = ProbeConfig { timeout, ..ProbeConfig::default() };
   let service = ProbeService::new(config, resolver, geo, Arc::new(faf_scope::command::SystemCommandRunner))?;

   let (tx, rx) = kanal::unbounded();
   service.subscribe(Arc::new(Forwarder { tx }));
   service.probe(target);

   while let Ok(event) = rx.recv() {
      match event {
         Event::ProbeStarted(point) => tracing::info!("probing {target} ({})", point.ip),
         Event::ProbeResult(text) => {
            println!("{text}");
            break;
         }
         Event::Failed(message, origin) => anyhow::bail!("{origin}: {message}"),
         _ => {}
      }
   }

   Ok(())
}

fn print_history(history: &HistoryIndex, prefix: &str) {
   let found = history.query(prefix);
   if found.is_empty() {
      println!("no history entries start with '{prefix}'");
      return;
   }
   for (value, count) in found {
      println!("{:>6}  {}", count, value);
   }
}

#[cfg(feature = "live-capture")]
fn capture_opener() -> anyhow::Result<Option<Arc<dyn SourceOpener>>> {
   use faf_scope::source::PcapOpener;

   if let Some(path) = &ARGS.read {
      return Ok(Some(Arc::new(PcapOpener::File(path.clone()))));
   }
   Ok(ARGS.interface.as_ref().map(|name| Arc::new(PcapOpener::Device(name.clone())) as Arc<dyn SourceOpener>))
}

#[cfg(not(feature = "live-capture"))]
fn capture_opener() -> anyhow::Result<Option<Arc<dyn SourceOpener>>> {
   if ARGS.read.is_some() || ARGS.interface.is_some() {
      anyhow::bail!("{} was built without the live-capture feature", statics::PROJECT_NAME);
   }
   Ok(None)
}

#[cfg(feature = "live-capture")]
fn list_interfaces() -> anyhow::Result<()> {
   for name in faf_scope::source::list_devices()? {
      println!("{name}");
   }
   Ok(())
}

#[cfg(not(feature = "live-capture"))]
fn list_interfaces() -> anyhow::Result<()> {
   anyhow::bail!("{} was built without the live-capture feature", statics::PROJECT_NAME)
}

fn print_banner() {
   println!();
   println!(
      r"
    ███████╗ █████╗ ███████╗    ███████╗ ██████╗ ██████╗ ██████╗ ███████╗
    ██╔════╝██╔══██╗██╔════╝    ██╔════╝██╔════╝██╔═══██╗██╔══██╗██╔════╝
    █████╗  ███████║█████╗      ███████╗██║     ██║   ██║██████╔╝█████╗
    ██╔══╝  ██╔══██║██╔══╝      ╚════██║██║     ██║   ██║██╔═══╝ ██╔══╝
    ██║     ██║  ██║██║         ███████║╚██████╗╚██████╔╝██║     ███████╗
    ╚═╝     ╚═╝  ╚═╝╚═╝         ╚══════╝ ╚═════╝ ╚═════╝ ╚═╝     ╚══════╝
    "
   );
   println!("\n");
}

fn print_version() {
   println!("{} v{}\n", statics::PROJECT_NAME, statics::VERSION);
}
