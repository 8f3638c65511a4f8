//! Poller module: worker pool that collects values for ready items.

mod registry;
mod retention;
mod transport;

pub use registry::*;
pub use retention::*;
pub use transport::*;

use crate::dci::{CollectionContext, ItemStatus, PollGuard};

use chrono::Utc;
use rand::seq::SliceRandom;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Number of worker tasks scanning the registry.
    pub workers: usize,
    /// How often each worker scans for ready items.
    pub tick: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            tick: Duration::from_secs(1),
        }
    }
}

/// Runs a fixed pool of workers. Every worker scans all items each tick;
/// an item claimed by one worker is skipped by the others until its poll
/// completes.
pub struct Poller<T: Transport + 'static> {
    registry: Arc<ItemRegistry>,
    ctx: CollectionContext,
    transport: Arc<T>,
    config: PollerConfig,
    stop: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport + 'static> Poller<T> {
    pub fn new(registry: Arc<ItemRegistry>, ctx: CollectionContext, transport: Arc<T>, config: PollerConfig) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            registry,
            ctx,
            transport,
            config,
            stop,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks.
    pub fn start(&self) {
        let workers = self.config.workers.max(1);
        tracing::info!("Starting poller with {} workers and {} items", workers, self.registry.item_count());

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in 0..workers {
            handles.push(tokio::spawn(run_worker(
                worker,
                self.registry.clone(),
                self.ctx.clone(),
                self.transport.clone(),
                self.config.tick,
                self.stop.subscribe(),
            )));
        }
    }

    /// Signal every worker to stop and wait for them. In-flight polls
    /// complete first.
    pub async fn stop(&self) {
        let _ = self.stop.send(());
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Poller worker failed: {}", e);
            }
        }
        tracing::info!("Poller stopped");
    }
}

async fn run_worker<T: Transport>(
    worker: usize,
    registry: Arc<ItemRegistry>,
    ctx: CollectionContext,
    transport: Arc<T>,
    tick: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                let polled = poll_ready_items(&registry, &ctx, transport.as_ref()).await;
                if polled > 0 {
                    tracing::debug!("Worker {}: polled {} items", worker, polled);
                }
            }
        }
    }
}

/// Poll every item that is ready now. Returns how many were polled.
pub async fn poll_ready_items<T: Transport>(registry: &ItemRegistry, ctx: &CollectionContext, transport: &T) -> usize {
    let mut items = registry.items();
    items.shuffle(&mut rand::thread_rng());

    let mut polled = 0;
    for item in items {
        let guard = match item.try_begin_poll(Utc::now().timestamp(), &*ctx.cluster) {
            Some(guard) => guard,
            None => continue,
        };
        poll_item(guard, ctx, transport).await;
        polled += 1;
    }
    polled
}

/// Fetch one claimed item and hand the outcome to it. The claim is
/// released when the guard drops.
pub async fn poll_item<T: Transport>(guard: PollGuard, ctx: &CollectionContext, transport: &T) {
    let item = guard.item();
    let node = match item.owner_node() {
        Some(node) => node,
        None => return,
    };
    let config = item.config();
    let request = FetchRequest {
        node: &node,
        source: config.source,
        name: &config.name,
        instance: &config.instance,
    };

    let result = transport.fetch(&request).await;
    let now = Utc::now().timestamp();
    match result {
        Ok(raw) => {
            if item.status() == ItemStatus::NotSupported {
                item.set_status(ItemStatus::Active, true, now, ctx);
            }
            item.new_value(now, &raw, ctx);
        }
        Err(FetchError::NotSupported) => {
            if item.status() == ItemStatus::Active {
                item.set_status(ItemStatus::NotSupported, true, now, ctx);
            }
            item.new_error(now, ctx);
        }
        Err(e) => {
            tracing::debug!("Item {} ({}) on {}: {}", item.id(), config.name, node.name, e);
            item.new_error(now, ctx);
        }
    }
}
