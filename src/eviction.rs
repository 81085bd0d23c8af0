//! LFU eviction engine: frequency-indexed reverse map

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::events::{EventBus, StoreChange, StoreEvent};
use crate::store::Store;

/// Reverse index of usage counts.
///
/// Buckets keep insertion order so eviction tie-breaks are stable. Usage
/// bumps only ever move a key one bucket up, so `min_frequency` is advanced
/// only when the bucket it points to drains.
pub struct FrequencyIndex {
  buckets: BTreeMap<u64, Vec<String>>,
  counts: HashMap<String, u64>,
  min_frequency: u64,
}

impl Default for FrequencyIndex {
  fn default() -> Self {
    Self::new()
  }
}

impl FrequencyIndex {
  pub fn new() -> Self {
    Self {
      buckets: BTreeMap::new(),
      counts: HashMap::new(),
      min_frequency: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.counts.len()
  }

  pub fn is_empty(&self) -> bool {
    self.counts.is_empty()
  }

  pub fn min_frequency(&self) -> u64 {
    self.min_frequency
  }

  pub fn count_of(&self, key: &str) -> Option<u64> {
    self.counts.get(key).copied()
  }

  fn advance_min_from(&mut self, from: u64) {
    self.min_frequency = self
      .buckets
      .range(from..)
      .next()
      .map(|(freq, _)| *freq)
      .unwrap_or(0);
  }

  fn unlink(&mut self, key: &str, freq: u64) {
    if let Some(keys) = self.buckets.get_mut(&freq) {
      keys.retain(|k| k != key);
      if keys.is_empty() {
        self.buckets.remove(&freq);
        if self.min_frequency == freq {
          self.advance_min_from(freq);
        }
      }
    }
  }

  /// Track a freshly created key at count 1.
  pub fn insert(&mut self, key: &str) {
    if self.counts.contains_key(key) {
      return;
    }
    self.buckets.entry(1).or_default().push(key.to_string());
    self.counts.insert(key.to_string(), 1);
    self.min_frequency = 1;
  }

  /// Move a key to the next frequency bucket. The new bucket is linked
  /// before the old one is unlinked so that advancing `min_frequency` can
  /// never skip past `freq + 1`.
  pub fn bump(&mut self, key: &str) {
    let Some(freq) = self.counts.get(key).copied() else {
      return;
    };
    self.buckets.entry(freq + 1).or_default().push(key.to_string());
    self.counts.insert(key.to_string(), freq + 1);
    if let Some(keys) = self.buckets.get_mut(&freq) {
      keys.retain(|k| k != key);
      if keys.is_empty() {
        self.buckets.remove(&freq);
        if self.min_frequency == freq {
          self.advance_min_from(freq);
        }
      }
    }
  }

  pub fn remove(&mut self, key: &str) {
    let Some(freq) = self.counts.remove(key) else {
      return;
    };
    self.unlink(key, freq);
    if self.counts.is_empty() {
      self.min_frequency = 0;
    }
  }

  pub fn clear(&mut self) {
    self.buckets.clear();
    self.counts.clear();
    self.min_frequency = 0;
  }

  /// Apply one store mutation to the index.
  pub fn apply(&mut self, event: &StoreEvent) {
    match &event.change {
      StoreChange::Created { key, .. } => self.insert(key),
      StoreChange::Read { key } => self.bump(key),
      StoreChange::Updated { key, .. } => self.bump(key),
      StoreChange::Deleted { key, .. } => self.remove(key),
      StoreChange::Flushed => self.clear(),
    }
  }

  /// Collect up to `target` keys in ascending frequency order, starting at
  /// `min_frequency`. The index itself is not mutated; the store deletes
  /// flow back through `apply`.
  pub fn victims(&self, target: usize) -> Vec<String> {
    let mut picked = Vec::with_capacity(target);
    for keys in self.buckets.values() {
      for key in keys {
        if picked.len() == target {
          return picked;
        }
        picked.push(key.clone());
      }
    }
    picked
  }
}

/// On-demand eviction worker state.
pub struct EvictionEngine {
  index: Mutex<FrequencyIndex>,
  factor: f64,
}

impl EvictionEngine {
  pub fn new(eviction_factor: f64) -> Self {
    Self {
      index: Mutex::new(FrequencyIndex::new()),
      factor: eviction_factor,
    }
  }

  pub fn tracked(&self) -> usize {
    self.index.lock().len()
  }

  /// One eviction pass: pick the victims under the private lock, release
  /// it, then delete through the store so events publish identically to
  /// client-driven deletes. Returns how many keys were removed.
  pub fn evict(&self, store: &Store, bus: &EventBus) -> usize {
    let victims = {
      let index = self.index.lock();
      let target = (self.factor * index.len() as f64).floor() as usize;
      index.victims(target)
    };

    let mut removed = 0;
    for key in victims {
      if let Some(event) = store.delete(&key) {
        bus.publish(&event);
        removed += 1;
      }
    }
    removed
  }

  /// Worker loop: maintains the index from the store feed and runs an
  /// eviction pass per coalesced trigger until shutdown.
  pub async fn run(
    self,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    mut feed: mpsc::UnboundedReceiver<StoreEvent>,
    mut trigger: mpsc::Receiver<()>,
    mut shutdown: broadcast::Receiver<()>,
  ) {
    loop {
      tokio::select! {
        event = feed.recv() => match event {
          Some(event) => self.index.lock().apply(&event),
          None => break,
        },
        signal = trigger.recv() => match signal {
          Some(()) => {
            let removed = self.evict(&store, &bus);
            tracing::info!("eviction pass removed {} entr(ies)", removed);
          }
          None => break,
        },
        _ = shutdown.recv() => {
          tracing::debug!("eviction worker stopping");
          break;
        }
      }
    }
  }
}
