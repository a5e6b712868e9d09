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

//! Frequency ranked prefix index over previously entered values (targets, host filters)
//!
//! Only the `value -> count` mapping is persisted. The prefix tree is rebuilt from it on load.

use crate::listener::{HistoryListener, ListenerBus, ListenerId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Default, Debug)]
struct Node {
   children: BTreeMap<char, Node>,
   /// Some when a key ends here
   count: Option<u64>,
}

#[derive(Default, Debug)]
struct PrefixTree {
   root: Node,
}

impl PrefixTree {
   fn set(&mut self, key: &str, count: u64) {
      let mut node = &mut self.root;
      for c in key.chars() {
         node = node.children.entry(c).or_default();
      }
      node.count = Some(count);
   }

   fn find(&self, prefix: &str) -> Option<&Node> {
      let mut node = &self.root;
      for c in prefix.chars() {
         node = node.children.get(&c)?;
      }
      Some(node)
   }

   /// Every key under `prefix` with its count, in lexical order
   fn collect(&self, prefix: &str) -> Vec<(String, u64)> {
      let mut found = Vec::new();
      let start = match self.find(prefix) {
         Some(node) => node,
         None => return found,
      };

      let mut stack: Vec<(String, &Node)> = vec![(prefix.to_string(), start)];
      while let Some((key, node)) = stack.pop() {
         if let Some(count) = node.count {
            found.push((key.clone(), count));
         }
         for (c, child) in node.children.iter().rev() {
            let mut child_key = key.clone();
            child_key.push(*c);
            stack.push((child_key, child));
         }
      }

      found
   }
}

pub struct HistoryIndex {
   counts: dashmap::DashMap<String, u64>,
   /// Also serializes writers, so `counts` and the tree never disagree
   tree: RwLock<PrefixTree>,
   path: Option<std::path::PathBuf>,
   dirty: AtomicBool,
   listeners: ListenerBus<dyn HistoryListener>,
}

impl HistoryIndex {
   /// In memory only, never flushed
   pub fn new() -> Self {
      Self::with_path(None)
   }

   fn with_path(path: Option<std::path::PathBuf>) -> Self {
      Self {
         counts: dashmap::DashMap::new(),
         tree: RwLock::new(PrefixTree::default()),
         path,
         dirty: AtomicBool::new(false),
         listeners: ListenerBus::new(),
      }
   }

   /// Loads the index persisted at `path`. A missing file gives an empty index, an unreadable one is
   /// deleted and also gives an empty index.
   pub fn load(path: &std::path::Path) -> Self {
      let index = Self::with_path(Some(path.to_path_buf()));

      match crate::persist::read_from_file_bincode::<Vec<(String, u64)>>(path) {
         Ok(Some(entries)) => {
            index.extend(entries);
            tracing::debug!("loaded {} history entries from {}", index.len(), path.display());
         }
         Ok(None) => tracing::debug!("no history at {}, starting empty", path.display()),
         Err(err) => {
            tracing::warn!("discarding history at {}: {err}", path.display());
            if let Err(err) = std::fs::remove_file(path) {
               tracing::warn!("failed to remove {}: {err}", path.display());
            }
         }
      }

      index
   }

   /// In memory index seeded with `entries`
   pub fn with_entries<I: IntoIterator<Item = (String, u64)>>(entries: I) -> Self {
      let index = Self::new();
      index.extend(entries);
      index
   }

   fn extend<I: IntoIterator<Item = (String, u64)>>(&self, entries: I) {
      let mut tree = self.tree.write().unwrap_or_else(|poisoned| poisoned.into_inner());
      for (key, count) in entries {
         if key.is_empty() {
            continue;
         }
         tree.set(&key, count);
         self.counts.insert(key, count);
      }
   }

   pub fn subscribe(&self, listener: Arc<dyn HistoryListener>) -> ListenerId {
      self.listeners.subscribe(listener)
   }

   pub fn unsubscribe(&self, id: ListenerId) -> bool {
      self.listeners.unsubscribe(id)
   }

   /// Records one occurrence of `value` and returns its new count. Empty values are not recorded.
   pub fn insert(&self, value: &str) -> u64 {
      if value.is_empty() {
         return 0;
      }

      let count = {
         let mut tree = self.tree.write().unwrap_or_else(|poisoned| poisoned.into_inner());
         let count = {
            let mut entry = self.counts.entry(value.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
         };
         tree.set(value, count);
         count
      };

      self.dirty.store(true, Ordering::Release);
      self.listeners.notify(|listener| listener.entry_recorded(value, count));
      count
   }

   /// Keys starting with `prefix`, most frequent first, at most `HISTORY_QUERY_LIMIT` of them.
   /// Equal counts are ordered lexically.
   pub fn query(&self, prefix: &str) -> Vec<(String, u64)> {
      let mut found = self.tree.read().unwrap_or_else(|poisoned| poisoned.into_inner()).collect(prefix);
      found.sort_by(|(a_key, a_count), (b_key, b_count)| b_count.cmp(a_count).then_with(|| a_key.cmp(b_key)));
      found.truncate(crate::statics::HISTORY_QUERY_LIMIT);
      found
   }

   pub fn count(&self, value: &str) -> u64 {
      self.counts.get(value).map(|count| *count).unwrap_or(0)
   }

   pub fn clear(&self) {
      {
         let mut tree = self.tree.write().unwrap_or_else(|poisoned| poisoned.into_inner());
         *tree = PrefixTree::default();
         self.counts.clear();
      }
      self.dirty.store(true, Ordering::Release);
      self.listeners.notify(|listener| listener.cleared());
   }

   pub fn len(&self) -> usize {
      self.counts.len()
   }

   pub fn is_empty(&self) -> bool {
      self.counts.is_empty()
   }

   pub fn path(&self) -> Option<&std::path::Path> {
      self.path.as_deref()
   }

   /// Persists the mapping if anything changed since the last flush
   pub fn flush(&self) -> crate::Result<()> {
      let path = match &self.path {
         Some(path) => path,
         None => return Ok(()),
      };
      if !self.dirty.swap(false, Ordering::AcqRel) {
         return Ok(());
      }

      let mut entries: Vec<(String, u64)> = {
         let _tree = self.tree.read().unwrap_or_else(|poisoned| poisoned.into_inner());
         self.counts.iter().map(|entry| (entry.key().clone(), *entry.value())).collect()
      };
      entries.sort_unstable();

      if let Err(err) = crate::persist::write_to_file_bincode(&entries, path) {
         self.dirty.store(true, Ordering::Release);
         let origin = crate::error::Origin::History;
         self.listeners.notify(|listener| listener.error(&err, origin));
         return Err(err);
      }

      tracing::debug!("flushed {} history entries to {}", entries.len(), path.display());
      Ok(())
   }
}

impl Default for HistoryIndex {
   fn default() -> Self {
      Self::new()
   }
}

impl Drop for HistoryIndex {
   fn drop(&mut self) {
      if let Err(err) = self.flush() {
         tracing::warn!("failed to flush history: {err}");
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::listener::ErrorListener;
   use std::sync::Mutex;

   #[test]
   fn test_insert_and_query() {
      let index = HistoryIndex::new();
      assert_eq!(index.insert("paris"), 1);
      assert_eq!(index.insert("paris"), 2);
      index.insert("parma");
      index.insert("berlin");

      let found = index.query("par");
      assert_eq!(found, vec![("paris".to_string(), 2), ("parma".to_string(), 1)]);
      assert!(index.query("x").is_empty());
      assert_eq!(index.count("paris"), 2);
      assert_eq!(index.count("rome"), 0);
   }

   #[test]
   fn test_query_limit_and_order() {
      let index = HistoryIndex::with_entries((0..1000u64).map(|i| (format!("host-{i:04}"), i % 37)));

      let found = index.query("host-");
      assert_eq!(found.len(), crate::statics::HISTORY_QUERY_LIMIT);
      for pair in found.windows(2) {
         let (a_key, a_count) = &pair[0];
         let (b_key, b_count) = &pair[1];
         assert!(a_count > b_count || (a_count == b_count && a_key < b_key));
      }
      assert_eq!(found[0], ("host-0036".to_string(), 36));
   }

   #[test]
   fn test_key_which_is_prefix_of_another() {
      let index = HistoryIndex::new();
      index.insert("a");
      index.insert("ab");
      index.insert("ab");

      assert_eq!(index.query("a"), vec![("ab".to_string(), 2), ("a".to_string(), 1)]);
      assert_eq!(index.query(""), index.query("a"));
      assert_eq!(index.insert(""), 0);
      assert_eq!(index.len(), 2);
   }

   #[test]
   fn test_clear() {
      let index = HistoryIndex::new();
      index.insert("paris");
      index.clear();

      assert!(index.is_empty());
      assert!(index.query("p").is_empty());
      assert_eq!(index.insert("paris"), 1);
   }

   #[test]
   fn test_flush_and_load() {
      let dir = tempfile::tempdir().unwrap();
      let path = crate::statics::history_path(Some(dir.path()));
      {
         let index = HistoryIndex::load(&path);
         assert!(index.is_empty());
         index.insert("example.org");
         index.insert("example.org");
         index.insert("10.0.0.1");
      }

      let index = HistoryIndex::load(&path);
      assert_eq!(index.count("example.org"), 2);
      assert_eq!(index.query("ex"), vec![("example.org".to_string(), 2)]);
      assert_eq!(index.len(), 2);
   }

   #[test]
   fn test_corrupt_file_is_discarded() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("history.bin");
      std::fs::write(&path, b"garbage").unwrap();

      let index = HistoryIndex::load(&path);
      assert!(index.is_empty());
      assert!(!path.exists());
   }

   #[test]
   fn test_query_while_inserting() {
      let index = Arc::new(HistoryIndex::new());
      let writer = {
         let index = index.clone();
         std::thread::spawn(move || {
            for i in 0..2000 {
               index.insert(&format!("key-{}", i % 50));
            }
         })
      };

      for _ in 0..200 {
         let found = index.query("key-");
         assert!(found.len() <= crate::statics::HISTORY_QUERY_LIMIT);
         assert!(found.windows(2).all(|pair| pair[0].1 >= pair[1].1));
      }
      writer.join().unwrap();

      assert_eq!(index.count("key-7"), 40);
   }

   #[derive(Default)]
   struct Recorder {
      recorded: Mutex<Vec<(String, u64)>>,
      cleared: Mutex<usize>,
   }

   impl ErrorListener for Recorder {}

   impl HistoryListener for Recorder {
      fn entry_recorded(&self, value: &str, count: u64) {
         self.recorded.lock().unwrap().push((value.to_string(), count));
      }
      fn cleared(&self) {
         *self.cleared.lock().unwrap() += 1;
      }
   }

   #[test]
   fn test_listeners() {
      let index = HistoryIndex::new();
      let recorder = Arc::new(Recorder::default());
      index.subscribe(recorder.clone());

      index.insert("paris");
      index.insert("paris");
      index.clear();

      assert_eq!(*recorder.recorded.lock().unwrap(), vec![("paris".to_string(), 1), ("paris".to_string(), 2)]);
      assert_eq!(*recorder.cleared.lock().unwrap(), 1);
   }
}
