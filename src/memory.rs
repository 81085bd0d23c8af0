//! Memory accounting for the cache store

use std::sync::atomic::{AtomicU64, Ordering};

/// Accounted cost of one entry in bytes.
///
/// The factor of two is a fixed per-character cost and is part of the wire
/// contract for the `MEM` command.
pub fn entry_cost(key: &str, value: &str) -> u64 {
  2 * (key.len() + value.len()) as u64
}

/// Tracks bytes in use against a fixed ceiling.
///
/// All operations are a single atomic word; no lock is taken. The accountant
/// answers can-fit questions and signals when the eviction threshold has been
/// crossed, but never mutates the store itself.
pub struct MemoryAccountant {
  current: AtomicU64,
  ceiling: u64,
  evict_at: u64,
}

impl MemoryAccountant {
  pub fn new(ceiling_bytes: u64, eviction_threshold: f64) -> Self {
    Self {
      current: AtomicU64::new(0),
      ceiling: ceiling_bytes,
      evict_at: (ceiling_bytes as f64 * eviction_threshold) as u64,
    }
  }

  pub fn bytes(&self) -> u64 {
    self.current.load(Ordering::Relaxed)
  }

  pub fn ceiling(&self) -> u64 {
    self.ceiling
  }

  pub fn can_add(&self, n: u64) -> bool {
    self.bytes() + n <= self.ceiling
  }

  /// Whether replacing an entry of cost `old_n` with one of cost `new_n`
  /// stays under the ceiling. A shrinking update can succeed even when
  /// `can_add(new_n)` would not.
  pub fn can_update(&self, old_n: u64, new_n: u64) -> bool {
    self.bytes() + new_n <= self.ceiling + old_n
  }

  pub fn add(&self, n: u64) {
    self.current.fetch_add(n, Ordering::Relaxed);
  }

  pub fn remove(&self, n: u64) {
    let prev = self.current.fetch_sub(n, Ordering::Relaxed);
    if prev < n {
      // Accounting underflow means the store and the accountant disagree;
      // restarting with a clean state is the only safe recovery.
      tracing::error!("memory accountant underflow: removed {} from {}", n, prev);
      std::process::abort();
    }
  }

  pub fn update(&self, old_n: u64, new_n: u64) {
    self.add(new_n);
    self.remove(old_n);
  }

  /// True once the configured high-water fraction of the ceiling is in use.
  pub fn needs_eviction(&self) -> bool {
    self.bytes() >= self.evict_at
  }

  pub fn reset(&self) {
    self.current.store(0, Ordering::Relaxed);
  }

  /// Six-decimal fractional megabyte view for the `MEM` response.
  pub fn current_mb(&self) -> f64 {
    let mb = self.bytes() as f64 / (1024.0 * 1024.0);
    (mb * 1_000_000.0).round() / 1_000_000.0
  }
}
