//! Authoritative key/value store with memory accounting

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::entry::{deadline_from_ttl, CacheEntry};
use crate::events::{StoreChange, StoreEvent};
use crate::memory::{entry_cost, MemoryAccountant};

/// Contract errors returned to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
  /// Create on an existing key.
  Duplicate,
  /// Read/Update on an absent key.
  NotFound,
  /// Mutation would exceed the memory ceiling.
  MemoryLimit,
}

impl std::fmt::Display for StoreError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StoreError::Duplicate => write!(f, "Key already exists"),
      StoreError::NotFound => write!(f, "Key not found"),
      StoreError::MemoryLimit => write!(f, "Memory limit exceeded"),
    }
  }
}

impl std::error::Error for StoreError {}

/// Outcome of a read.
#[derive(Debug)]
pub enum ReadOutcome {
  Hit(String),
  Miss,
  /// Lazy mode: the entry had been flagged by a sweep and was removed
  /// in-line; the delete event still needs publishing by the caller.
  Expired(StoreEvent),
}

/// In-memory key/entry map.
///
/// One mutex serializes every operation, reads included; the accountant and
/// the index feeds are updated inside the same exclusive section so the
/// engines observe mutations in store order. Mutation events are returned to
/// the caller, which publishes them to the bus after the client response has
/// been enqueued.
pub struct Store {
  entries: Mutex<HashMap<String, CacheEntry>>,
  accountant: MemoryAccountant,
  feeds: Mutex<Vec<mpsc::UnboundedSender<StoreEvent>>>,
  evict_tx: mpsc::Sender<()>,
  evict_rx: Mutex<Option<mpsc::Receiver<()>>>,
  lazy_expiry: bool,
}

impl Store {
  pub fn new(accountant: MemoryAccountant, lazy_expiry: bool) -> Self {
    // Capacity 1 coalesces pressure signals: while a pass is in flight at
    // most one more is queued.
    let (evict_tx, evict_rx) = mpsc::channel(1);
    Self {
      entries: Mutex::new(HashMap::new()),
      accountant,
      feeds: Mutex::new(Vec::new()),
      evict_tx,
      evict_rx: Mutex::new(Some(evict_rx)),
      lazy_expiry,
    }
  }

  /// Register an index-bookkeeping feed; every mutation is sent to every
  /// registered feed in mutation order.
  pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.feeds.lock().push(tx);
    rx
  }

  /// The eviction trigger receiver; taken once by the eviction worker.
  pub fn take_eviction_trigger(&self) -> Option<mpsc::Receiver<()>> {
    self.evict_rx.lock().take()
  }

  pub fn accountant(&self) -> &MemoryAccountant {
    &self.accountant
  }

  pub fn lazy_expiry(&self) -> bool {
    self.lazy_expiry
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.lock().contains_key(key)
  }

  /// Deadline of a live entry, for inspection and tests.
  pub fn deadline_of(&self, key: &str) -> Option<u64> {
    self.entries.lock().get(key).map(|e| e.deadline)
  }

  fn feed_indexes(&self, event: &StoreEvent) {
    for feed in self.feeds.lock().iter() {
      let _ = feed.send(event.clone());
    }
  }

  fn signal_eviction(&self) {
    // Fire-and-forget; a full channel means a pass is already pending.
    let _ = self.evict_tx.try_send(());
  }

  /// Insert a new entry. `ttl_secs == 0` means never expires.
  pub fn create(&self, key: &str, value: &str, ttl_secs: u64) -> Result<StoreEvent, StoreError> {
    let cost = entry_cost(key, value);
    let mut entries = self.entries.lock();

    if entries.contains_key(key) {
      return Err(StoreError::Duplicate);
    }
    if self.accountant.needs_eviction() {
      self.signal_eviction();
    }
    if !self.accountant.can_add(cost) {
      return Err(StoreError::MemoryLimit);
    }

    let deadline = deadline_from_ttl(ttl_secs);
    entries.insert(
      key.to_string(),
      CacheEntry::new(key.to_string(), value.to_string(), deadline),
    );
    self.accountant.add(cost);

    let event = StoreEvent::new(StoreChange::Created {
      key: key.to_string(),
      value: value.to_string(),
      deadline,
    });
    self.feed_indexes(&event);
    Ok(event)
  }

  /// Fetch a value, bumping its usage count.
  pub fn read(&self, key: &str) -> ReadOutcome {
    let mut entries = self.entries.lock();

    let Some(entry) = entries.get_mut(key) else {
      return ReadOutcome::Miss;
    };

    if self.lazy_expiry && entry.expired {
      let Some(entry) = entries.remove(key) else {
        return ReadOutcome::Miss;
      };
      self.accountant.remove(entry.cost());
      let event = StoreEvent::new(StoreChange::Deleted {
        key: entry.key,
        value: entry.value,
        deadline: entry.deadline,
      });
      self.feed_indexes(&event);
      return ReadOutcome::Expired(event);
    }

    entry.touch();
    let value = entry.value.clone();
    self.feed_indexes(&StoreEvent::new(StoreChange::Read {
      key: key.to_string(),
    }));
    ReadOutcome::Hit(value)
  }

  /// Replace value and, when given, ttl. A `None` ttl preserves the prior
  /// deadline.
  pub fn update(
    &self,
    key: &str,
    value: &str,
    ttl_secs: Option<u64>,
  ) -> Result<StoreEvent, StoreError> {
    let mut entries = self.entries.lock();

    let Some(entry) = entries.get_mut(key) else {
      return Err(StoreError::NotFound);
    };

    let old_cost = entry.cost();
    let new_cost = entry_cost(key, value);
    if !self.accountant.can_update(old_cost, new_cost) {
      return Err(StoreError::MemoryLimit);
    }

    let old_value = std::mem::replace(&mut entry.value, value.to_string());
    let old_deadline = entry.deadline;
    if let Some(ttl) = ttl_secs {
      entry.deadline = deadline_from_ttl(ttl);
    }
    // A successful write revives a lazily flagged entry; the fresh value
    // must be readable.
    entry.expired = false;
    entry.touch();
    self.accountant.update(old_cost, new_cost);

    let event = StoreEvent::new(StoreChange::Updated {
      key: key.to_string(),
      old_value,
      new_value: value.to_string(),
      old_deadline,
      new_deadline: entry.deadline,
    });
    self.feed_indexes(&event);
    Ok(event)
  }

  /// Remove an entry. Absent keys are a silent no-op (no event).
  pub fn delete(&self, key: &str) -> Option<StoreEvent> {
    let mut entries = self.entries.lock();
    let entry = entries.remove(key)?;
    self.accountant.remove(entry.cost());

    let event = StoreEvent::new(StoreChange::Deleted {
      key: entry.key,
      value: entry.value,
      deadline: entry.deadline,
    });
    self.feed_indexes(&event);
    Some(event)
  }

  /// Remove every entry and reset the accountant. Emits one event.
  pub fn flush_all(&self) -> StoreEvent {
    let mut entries = self.entries.lock();
    entries.clear();
    self.accountant.reset();

    let event = StoreEvent::new(StoreChange::Flushed);
    self.feed_indexes(&event);
    event
  }

  /// Flag an entry for lazy removal on its next read. No event; the
  /// eventual removal emits the delete.
  pub fn mark_expired(&self, key: &str) {
    if let Some(entry) = self.entries.lock().get_mut(key) {
      entry.expired = true;
    }
  }
}
