//! TTL expiry engine: bucketed deadline index plus periodic sweep

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::entry::now_secs;
use crate::events::{EventBus, StoreChange, StoreEvent};
use crate::store::Store;

/// Expiry bucket for a deadline.
pub fn bucket_for(deadline: u64, interval: u64) -> u64 {
  deadline / interval * interval
}

/// Deadline index: keys grouped by bucket, with back-pointers for
/// relocation.
///
/// Never-expiring entries (`deadline == 0`) are not tracked.
pub struct ExpiryIndex {
  buckets: BTreeMap<u64, Vec<String>>,
  slots: HashMap<String, u64>,
  interval: u64,
}

impl ExpiryIndex {
  pub fn new(interval: u64) -> Self {
    Self {
      buckets: BTreeMap::new(),
      slots: HashMap::new(),
      interval,
    }
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.slots.contains_key(key)
  }

  pub fn insert(&mut self, key: &str, deadline: u64) {
    if deadline == 0 {
      return;
    }
    let bucket = bucket_for(deadline, self.interval);
    self.buckets.entry(bucket).or_default().push(key.to_string());
    self.slots.insert(key.to_string(), bucket);
  }

  pub fn remove(&mut self, key: &str) {
    let Some(bucket) = self.slots.remove(key) else {
      return;
    };
    if let Some(keys) = self.buckets.get_mut(&bucket) {
      keys.retain(|k| k != key);
      if keys.is_empty() {
        self.buckets.remove(&bucket);
      }
    }
  }

  /// Apply one store mutation to the index. Updates whose deadline did not
  /// change are not re-bucketed.
  pub fn apply(&mut self, event: &StoreEvent) {
    match &event.change {
      StoreChange::Created { key, deadline, .. } => self.insert(key, *deadline),
      StoreChange::Updated {
        key,
        old_deadline,
        new_deadline,
        ..
      } => {
        if old_deadline != new_deadline {
          self.remove(key);
          self.insert(key, *new_deadline);
        }
      }
      StoreChange::Deleted { key, .. } => self.remove(key),
      StoreChange::Flushed => {
        self.buckets.clear();
        self.slots.clear();
      }
      StoreChange::Read { .. } => {}
    }
  }

  /// Drain every bucket whose slot is at or before `horizon`, dropping the
  /// emptied buckets.
  pub fn collect_due(&mut self, horizon: u64) -> Vec<String> {
    let due_buckets: Vec<u64> = self
      .buckets
      .range(..=horizon)
      .map(|(bucket, _)| *bucket)
      .collect();

    let mut due = Vec::new();
    for bucket in due_buckets {
      if let Some(keys) = self.buckets.remove(&bucket) {
        for key in &keys {
          self.slots.remove(key);
        }
        due.extend(keys);
      }
    }
    due
  }
}

/// Periodic sweep over the deadline index.
pub struct ExpiryEngine {
  index: Mutex<ExpiryIndex>,
  interval: u64,
  strict: bool,
}

impl ExpiryEngine {
  pub fn new(sweep_interval: u64, strict: bool) -> Self {
    Self {
      index: Mutex::new(ExpiryIndex::new(sweep_interval)),
      interval: sweep_interval,
      strict,
    }
  }

  pub fn tracked(&self) -> usize {
    self.index.lock().len()
  }

  /// One sweep pass. The due keys are snapshotted under the index lock and
  /// acted on after it is released; the store calls re-enter the store under
  /// its own lock and the delete events publish normally.
  pub fn expire_once(&self, store: &Store, bus: &EventBus) -> usize {
    // The half-interval offset catches deadlines falling between ticks.
    let horizon = now_secs() + self.interval / 2;
    let due = self.index.lock().collect_due(horizon);
    let count = due.len();

    for key in due {
      if self.strict {
        if let Some(event) = store.delete(&key) {
          bus.publish(&event);
        }
      } else {
        store.mark_expired(&key);
      }
    }
    count
  }

  /// Worker loop: maintains the index from the store feed and sweeps every
  /// `sweep_interval` seconds until shutdown.
  pub async fn run(
    self,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    mut feed: mpsc::UnboundedReceiver<StoreEvent>,
    mut shutdown: broadcast::Receiver<()>,
  ) {
    let mut ticker = tokio::time::interval(Duration::from_secs(self.interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it so the
    // first sweep happens one full interval in.
    ticker.tick().await;

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let expired = self.expire_once(&store, &bus);
          if expired > 0 {
            tracing::debug!("expiry sweep removed {} entr(ies)", expired);
          }
        }
        event = feed.recv() => match event {
          Some(event) => self.index.lock().apply(&event),
          None => break,
        },
        _ = shutdown.recv() => {
          tracing::debug!("expiry sweeper stopping");
          break;
        }
      }
    }
  }
}
