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

//! Listener contracts and the ordered registry used to dispatch them
//!
//! Dispatch is synchronous on the thread raising the event. Listeners which need to hand work to
//! another thread (a UI, a printer) must do so themselves.

use crate::error::{Error, Origin};
use crate::geo::Geolocation;
use crate::packet::PacketRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Error channel common to every listener family
pub trait ErrorListener: Send + Sync {
   fn error(&self, _error: &Error, _origin: Origin) {}
}

pub trait CaptureListener: ErrorListener {
   fn start_capture(&self) {}
   fn packet_added(&self, _record: &Arc<PacketRecord>) {}
   fn capture_stopped(&self) {}
   fn focus_packet(&self, _record: &Arc<PacketRecord>, _is_capturing: bool, _animation: bool) {}
}

pub trait ProbeListener: ErrorListener {
   fn start_probe(&self, _target: &str) {}
   fn focus_result(&self, _point: &Geolocation) {}
   fn result(&self, _text: &str) {}
}

pub trait HistoryListener: ErrorListener {
   fn entry_recorded(&self, _value: &str, _count: u64) {}
   fn cleared(&self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered subscriber registry. Listeners are notified in subscription order.
pub struct ListenerBus<L: ?Sized> {
   next_id: AtomicU64,
   entries: RwLock<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> Default for ListenerBus<L> {
   fn default() -> Self {
      Self { next_id: AtomicU64::new(0), entries: RwLock::new(Vec::new()) }
   }
}

impl<L: ?Sized> ListenerBus<L> {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn subscribe(&self, listener: Arc<L>) -> ListenerId {
      let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
      self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner()).push((id, listener));
      id
   }

   /// Returns false if `id` was not registered
   pub fn unsubscribe(&self, id: ListenerId) -> bool {
      let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
      let len_before = entries.len();
      entries.retain(|(entry_id, _)| *entry_id != id);
      entries.len() != len_before
   }

   pub fn len(&self) -> usize {
      self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Calls `f` for every listener registered at the time of the call.
   ///
   /// The registry is snapshotted first, so listeners may subscribe or unsubscribe from inside `f`
   /// without deadlocking. Changes take effect from the next notification.
   pub fn notify<F>(&self, mut f: F)
   where
      F: FnMut(&L),
   {
      let snapshot: Vec<Arc<L>> =
         self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner()).iter().map(|(_, listener)| listener.clone()).collect();

      for listener in snapshot.iter() {
         f(listener.as_ref());
      }
   }
}
