//! Daemon wiring: builds the store, the engines and the pipeline

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use super::tcp::serve;
use super::ServerConfig;
use crate::commands::CommandContext;
use crate::events::EventBus;
use crate::eviction::EvictionEngine;
use crate::expiry::ExpiryEngine;
use crate::memory::MemoryAccountant;
use crate::store::Store;

pub struct Daemon {
  config: ServerConfig,
  shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
  pub fn new(config: ServerConfig) -> Self {
    let (shutdown_tx, _) = broadcast::channel(1);
    Self {
      config,
      shutdown_tx,
    }
  }

  /// Trigger graceful shutdown of all long-lived tasks.
  pub fn shutdown(&self) {
    tracing::info!("Initiating graceful shutdown...");
    let _ = self.shutdown_tx.send(());
  }

  pub async fn run(&self) -> Result<(), anyhow::Error> {
    let cache = &self.config.cache;
    cache.validate()?;

    let accountant = MemoryAccountant::new(cache.ceiling_bytes(), cache.eviction_threshold);
    let store = Arc::new(Store::new(accountant, !cache.strict_expiry));

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let bus = Arc::new(EventBus::new());

    // The engines consume the store's change feeds on their own tasks; the
    // store never calls into them while holding its lock.
    let expiry_feed = store.subscribe_changes();
    let eviction_feed = store.subscribe_changes();
    let eviction_trigger = store
      .take_eviction_trigger()
      .ok_or_else(|| anyhow::anyhow!("daemon already started"))?;

    let expiry = ExpiryEngine::new(cache.sweep_interval, cache.strict_expiry);
    tokio::spawn(expiry.run(
      store.clone(),
      bus.clone(),
      expiry_feed,
      self.shutdown_tx.subscribe(),
    ));

    let eviction = EvictionEngine::new(cache.eviction_factor);
    tokio::spawn(eviction.run(
      store.clone(),
      bus.clone(),
      eviction_feed,
      eviction_trigger,
      self.shutdown_tx.subscribe(),
    ));

    let addr = self.config.address();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
      "acorncache listening on {} (ceiling {} MB, {} expiry, sweep {}s)",
      addr,
      cache.size_mb,
      if cache.strict_expiry { "strict" } else { "lazy" },
      cache.sweep_interval
    );

    let ctx = CommandContext { store, bus };
    serve(listener, ctx, out_tx, out_rx, self.shutdown_tx.subscribe()).await;
    Ok(())
  }
}
