//! dcollect - data collection daemon.

use dcollect::config::ServerConfig;
use dcollect::db::{QueuedGateway, Store};
use dcollect::dci::{CollectionContext, CollectionSettings};
use dcollect::poller::{HttpTransport, ItemRegistry, Poller, PollerConfig, RetentionManager, SourceTransport};
use dcollect::services::{run_event_logger, ChannelEventSink, ConsumerIndex, DisabledScriptHost, StaticClusterResources};

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("dcollect=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting dcollect with {} poller workers", cfg.poller_workers);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let (events, events_rx) = ChannelEventSink::new(1000);
    let event_logger = tokio::spawn(run_event_logger(events_rx, store.clone()));

    let (gateway, batch_writer) = QueuedGateway::new(store.clone(), 1000);
    let ctx = CollectionContext {
        persistence: Arc::new(gateway),
        scripts: Arc::new(DisabledScriptHost),
        events: Arc::new(events),
        cluster: Arc::new(StaticClusterResources::parse(&cfg.cluster_resources)),
        consumers: Arc::new(ConsumerIndex::new()),
        settings: CollectionSettings {
            threshold_repeat_interval: cfg.threshold_repeat_interval,
            management_node_id: cfg.management_node_id,
        },
    };

    let registry = Arc::new(ItemRegistry::load(&store, &ctx)?);
    tracing::info!("Loaded {} nodes and {} items", registry.node_count(), registry.item_count());

    let transport = Arc::new(SourceTransport::new(HttpTransport::new(cfg.agent_port, cfg.fetch_timeout)?));
    let poller = Poller::new(
        registry.clone(),
        ctx.clone(),
        transport,
        PollerConfig {
            workers: cfg.poller_workers,
            tick: cfg.poll_tick,
        },
    );
    poller.start();

    let retention = RetentionManager::new(registry.clone(), store.clone(), cfg.retention_interval);
    retention.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    poller.stop().await;
    retention.stop().await;

    // Dropping the last gateway and sink closes their channels so both
    // background writers flush
    drop(poller);
    drop(registry);
    drop(ctx);
    if tokio::time::timeout(Duration::from_secs(5), batch_writer).await.is_err() {
        tracing::warn!("Write queue did not drain in time");
    }
    if tokio::time::timeout(Duration::from_secs(5), event_logger).await.is_err() {
        tracing::warn!("Event logger did not finish in time");
    }

    Ok(())
}
