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

//! External lookups of a target (whois style)
//!
//! Every call resolves the target, locates it, notifies `start_probe` and `focus_result` right
//! away, then runs the external command and notifies `result`. Calls run on a fixed pool, so a
//! burst of calls queues instead of spawning unbounded processes.
//!
//! Cancellation is cooperative: it only suppresses the final `result` notification. The command
//! itself is left to finish.

use crate::command::{clean_output, CommandRunner, CommandSpec};
use crate::dns::Resolver;
use crate::error::{Error, Origin, ProbeError};
use crate::geo::{GeoLocator, Geolocation};
use crate::listener::{ListenerBus, ListenerId, ProbeListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Clone, Debug)]
pub struct ProbeConfig {
   /// Probes running at the same time
   pub workers: usize,
   /// Candidates in order. The next one is only tried when the previous is missing on this host.
   pub commands: Vec<CommandSpec>,
   /// None lets a command run for as long as it wants
   pub timeout: Option<std::time::Duration>,
   pub banner_prefixes: Vec<String>,
}

impl Default for ProbeConfig {
   fn default() -> Self {
      Self {
         workers: crate::statics::PROBE_WORKERS,
         commands: CommandSpec::platform_defaults(),
         timeout: Some(std::time::Duration::from_secs(crate::statics::PROBE_TIMEOUT_SECS)),
         banner_prefixes: crate::statics::PROBE_BANNER_PREFIXES.iter().map(|prefix| prefix.to_string()).collect(),
      }
   }
}

/// Outcome of the last successful probe
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeResult {
   pub target: String,
   pub point: Geolocation,
   pub text: String,
}

struct ProbeShared {
   config: ProbeConfig,
   resolver: Arc<dyn Resolver>,
   geo: Arc<dyn GeoLocator>,
   runner: Arc<dyn CommandRunner>,
   permits: Arc<tokio::sync::Semaphore>,
   /// Flag of the most recent call
   cancel: Mutex<Arc<AtomicBool>>,
   cached: RwLock<Option<ProbeResult>>,
   listeners: ListenerBus<dyn ProbeListener>,
   pending: AtomicUsize,
}

pub struct ProbeService {
   shared: Arc<ProbeShared>,
   handle: tokio::runtime::Handle,
   runtime: Option<tokio::runtime::Runtime>,
}

impl ProbeService {
   /// Starts the worker pool
   pub fn new(
      config: ProbeConfig,
      resolver: Arc<dyn Resolver>,
      geo: Arc<dyn GeoLocator>,
      runner: Arc<dyn CommandRunner>,
   ) -> crate::Result<Self> {
      let workers = config.workers.max(1);
      let runtime = tokio::runtime::Builder::new_multi_thread().worker_threads(workers).thread_name("faf-probe").enable_all().build()?;

      Ok(Self {
         shared: Arc::new(ProbeShared {
            config,
            resolver,
            geo,
            runner,
            permits: Arc::new(tokio::sync::Semaphore::new(workers)),
            cancel: Mutex::new(Arc::new(AtomicBool::new(false))),
            cached: RwLock::new(None),
            listeners: ListenerBus::new(),
            pending: AtomicUsize::new(0),
         }),
         handle: runtime.handle().clone(),
         runtime: Some(runtime),
      })
   }

   pub fn subscribe(&self, listener: Arc<dyn ProbeListener>) -> ListenerId {
      self.shared.listeners.subscribe(listener)
   }

   pub fn unsubscribe(&self, id: ListenerId) -> bool {
      self.shared.listeners.unsubscribe(id)
   }

   /// Queues a probe of `target`. The result of any earlier call still in flight will not be delivered.
   pub fn probe(&self, target: &str) {
      let cancelled = Arc::new(AtomicBool::new(false));
      {
         let mut current = self.shared.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
         current.store(true, Ordering::Release);
         *current = cancelled.clone();
      }

      self.shared.pending.fetch_add(1, Ordering::AcqRel);
      let shared = self.shared.clone();
      let target = target.trim().to_string();
      self.handle.spawn(async move {
         shared.clone().run(target, cancelled).await;
         shared.pending.fetch_sub(1, Ordering::AcqRel);
      });
   }

   /// Suppresses delivery of the most recent call's result
   pub fn cancel(&self) {
      self.shared.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).store(true, Ordering::Release);
   }

   /// Replays the cached result, if any, to every listener
   pub fn renotify(&self) {
      let cached = self.last_result();
      if let Some(result) = cached {
         self.shared.listeners.notify(|listener| {
            listener.start_probe(&result.target);
            listener.focus_result(&result.point);
            listener.result(&result.text);
         });
      }
   }

   pub fn last_result(&self) -> Option<ProbeResult> {
      self.shared.cached.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
   }

   pub fn clear_result(&self) {
      self.shared.set_cached(None);
   }

   /// Calls queued or running
   pub fn pending(&self) -> usize {
      self.shared.pending.load(Ordering::Acquire)
   }
}

impl Drop for ProbeService {
   fn drop(&mut self) {
      // commands still running are abandoned, not awaited
      if let Some(runtime) = self.runtime.take() {
         runtime.shutdown_background();
      }
   }
}

impl ProbeShared {
   fn set_cached(&self, result: Option<ProbeResult>) {
      *self.cached.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = result;
   }

   async fn run(self: Arc<Self>, target: String, cancelled: Arc<AtomicBool>) {
      let _permit = match self.permits.clone().acquire_owned().await {
         Ok(permit) => permit,
         Err(_) => return,
      };

      let resolver = self.resolver.clone();
      let lookup = target.clone();
      let resolved = tokio::task::spawn_blocking(move || resolver.resolve_first(&lookup)).await.ok().flatten();
      let ip = match resolved {
         Some(ip) => ip,
         None => {
            tracing::warn!("probe of {target} failed, target did not resolve");
            self.fail(ProbeError::Unresolved(target));
            return;
         }
      };

      let point = self.geo.locate_or_unknown(ip);
      self.listeners.notify(|listener| listener.start_probe(&target));
      self.listeners.notify(|listener| listener.focus_result(&point));

      match self.run_commands(&target).await {
         Ok(text) => {
            let result = ProbeResult { target, point, text };
            self.set_cached(Some(result.clone()));
            if cancelled.load(Ordering::Acquire) {
               tracing::debug!("probe of {} finished after cancellation, not delivered", result.target);
               return;
            }
            self.listeners.notify(|listener| listener.result(&result.text));
         }
         Err(err) => {
            tracing::warn!("probe of {target} failed: {err}");
            self.fail(err);
         }
      }
   }

   fn fail(&self, err: ProbeError) {
      self.set_cached(None);
      let err = Error::ProbeExecution(err);
      self.listeners.notify(|listener| listener.error(&err, Origin::Probe));
   }

   async fn run_commands(&self, target: &str) -> Result<String, ProbeError> {
      let candidates = &self.config.commands;
      let mut last_missing = String::from("no probe command configured");

      for (index, spec) in candidates.iter().enumerate() {
         let outcome = self.runner.run(&spec.program, &spec.args_for(target), self.config.timeout).await;

         let missing = match &outcome {
            Err(err) => err.kind() == std::io::ErrorKind::NotFound,
            Ok(output) => output.reports_missing(),
         };
         if missing {
            last_missing = spec.program.clone();
            if let Some(next) = candidates.get(index + 1) {
               tracing::warn!("{} not found, retrying with {}", spec.program, next.program);
            }
            continue;
         }

         return match outcome {
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Err(ProbeError::TimedOut {
               program: spec.program.clone(),
               secs: self.config.timeout.map(|limit| limit.as_secs()).unwrap_or(0),
            }),
            Err(err) => Err(ProbeError::Spawn { program: spec.program.clone(), source: err }),
            Ok(output) if !output.success() => {
               Err(ProbeError::Failed { program: spec.program.clone(), code: output.code, stderr: output.stderr.trim().to_string() })
            }
            Ok(output) => Ok(clean_output(&output.stdout, &self.config.banner_prefixes)),
         };
      }

      Err(ProbeError::CommandMissing(last_missing))
   }
}
