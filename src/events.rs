//! Store mutation events and subscriber fan-out

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Subscribable mutation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Create,
  Update,
  Delete,
  FlushAll,
}

impl std::fmt::Display for EventKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EventKind::Create => write!(f, "CREATE"),
      EventKind::Update => write!(f, "UPDATE"),
      EventKind::Delete => write!(f, "DELETE"),
      EventKind::FlushAll => write!(f, "FLUSHALL"),
    }
  }
}

impl std::str::FromStr for EventKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "CREATE" => Ok(EventKind::Create),
      "UPDATE" => Ok(EventKind::Update),
      "DELETE" => Ok(EventKind::Delete),
      "FLUSHALL" => Ok(EventKind::FlushAll),
      _ => Err(format!("unknown event kind: {}", s)),
    }
  }
}

/// What changed in the store.
///
/// `Read` feeds the eviction engine's usage tracking only; it has no
/// subscribable kind and is never published to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
  Created {
    key: String,
    value: String,
    deadline: u64,
  },
  Read {
    key: String,
  },
  Updated {
    key: String,
    old_value: String,
    new_value: String,
    old_deadline: u64,
    new_deadline: u64,
  },
  Deleted {
    key: String,
    value: String,
    deadline: u64,
  },
  Flushed,
}

/// A store mutation record, stamped when the mutation became visible.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
  pub change: StoreChange,
  pub at: DateTime<Utc>,
}

impl StoreEvent {
  pub fn new(change: StoreChange) -> Self {
    Self {
      change,
      at: Utc::now(),
    }
  }

  /// Subscribable kind, if any.
  pub fn kind(&self) -> Option<EventKind> {
    match self.change {
      StoreChange::Created { .. } => Some(EventKind::Create),
      StoreChange::Updated { .. } => Some(EventKind::Update),
      StoreChange::Deleted { .. } => Some(EventKind::Delete),
      StoreChange::Flushed => Some(EventKind::FlushAll),
      StoreChange::Read { .. } => None,
    }
  }

  /// Human-readable description of the mutation.
  pub fn describe(&self) -> String {
    match &self.change {
      StoreChange::Created { key, value, .. } => format!("create {} {}", key, value),
      StoreChange::Updated {
        key,
        old_value,
        new_value,
        ..
      } => format!("update {} {} -> {}", key, old_value, new_value),
      StoreChange::Deleted { key, .. } => format!("delete {}", key),
      StoreChange::Flushed => "flushall".to_string(),
      StoreChange::Read { key } => format!("read {}", key),
    }
  }

  /// The value a mutation left behind, where one applies.
  pub fn new_value(&self) -> Option<&str> {
    match &self.change {
      StoreChange::Created { value, .. } => Some(value),
      StoreChange::Updated { new_value, .. } => Some(new_value),
      _ => None,
    }
  }
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
  Added,
  AlreadyRegistered,
}

/// Per-kind subscriber table with non-blocking fan-out.
///
/// `publish` snapshots the subscriber list before enqueueing so no lock is
/// held across a send, and it never invokes a subscriber inline: it emits
/// one `(client, event)` record per subscriber on the outgoing channel, and
/// turning those into wire frames is the pipeline's problem.
pub struct EventBus {
  subscribers: RwLock<HashMap<EventKind, Vec<Uuid>>>,
  out: mpsc::UnboundedSender<(Uuid, StoreEvent)>,
  out_rx: Mutex<Option<mpsc::UnboundedReceiver<(Uuid, StoreEvent)>>>,
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}

impl EventBus {
  pub fn new() -> Self {
    let (out, out_rx) = mpsc::unbounded_channel();
    Self {
      subscribers: RwLock::new(HashMap::new()),
      out,
      out_rx: Mutex::new(Some(out_rx)),
    }
  }

  /// The outgoing event stream; taken once by the pipeline's forwarder.
  pub fn take_outgoing(&self) -> Option<mpsc::UnboundedReceiver<(Uuid, StoreEvent)>> {
    self.out_rx.lock().take()
  }

  /// Register a client for a kind. Idempotent.
  pub fn subscribe(&self, client: Uuid, kind: EventKind) -> SubscribeOutcome {
    let mut table = self.subscribers.write();
    let subs = table.entry(kind).or_default();
    if subs.contains(&client) {
      SubscribeOutcome::AlreadyRegistered
    } else {
      subs.push(client);
      SubscribeOutcome::Added
    }
  }

  /// Remove a client from a kind. Silent if absent.
  pub fn unsubscribe(&self, client: Uuid, kind: EventKind) {
    let mut table = self.subscribers.write();
    if let Some(subs) = table.get_mut(&kind) {
      subs.retain(|c| *c != client);
    }
  }

  /// Remove a client from every kind; called when its connection dies.
  pub fn purge(&self, client: Uuid) {
    let mut table = self.subscribers.write();
    for subs in table.values_mut() {
      subs.retain(|c| *c != client);
    }
  }

  pub fn subscriber_count(&self, kind: EventKind) -> usize {
    self.subscribers.read().get(&kind).map(Vec::len).unwrap_or(0)
  }

  /// Fan a mutation out to every subscriber of its kind.
  pub fn publish(&self, event: &StoreEvent) {
    let Some(kind) = event.kind() else { return };

    let targets: Vec<Uuid> = match self.subscribers.read().get(&kind) {
      Some(subs) if !subs.is_empty() => subs.clone(),
      _ => return,
    };

    tracing::debug!(
      "publishing {} event to {} subscriber(s) at {}",
      kind,
      targets.len(),
      event.at
    );

    for client in targets {
      let _ = self.out.send((client, event.clone()));
    }
  }
}
