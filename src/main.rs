// Main entry point - Dependency injection and process lifecycle
use std::sync::Arc;
use std::time::Duration;

use roaster_telemetry::application::history::BackfillService;
use roaster_telemetry::application::ror::RoREstimator;
use roaster_telemetry::application::telemetry_store::{SnapshotStore, TelemetryStore};
use roaster_telemetry::infrastructure::config::load_config;
use roaster_telemetry::infrastructure::history_api::HistoryApiClient;
use roaster_telemetry::infrastructure::snapshot::FileSnapshotStore;
use roaster_telemetry::infrastructure::stream_client::{StreamClient, StreamConfig};
use tokio::signal;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Load configuration
    let cfg = load_config()?;
    let retention_secs = cfg.store.retention_secs as f64;

    // Persistence port (infrastructure layer)
    let snapshot_store = Arc::new(FileSnapshotStore::new(
        &cfg.store.snapshot_path,
        retention_secs,
    ));

    // Central store (application layer), warmed from the last snapshot
    let store = Arc::new(TelemetryStore::new(
        cfg.store.buffer_capacity,
        cfg.store.precision,
        retention_secs,
    )?);
    match snapshot_store.load() {
        Ok(Some(snapshot)) => {
            if let Err(err) = store.restore(snapshot) {
                tracing::warn!(%err, "discarding unusable snapshot");
            }
        }
        Ok(None) => {}
        Err(err) => tracing::warn!(%err, "failed to load snapshot"),
    }

    // Fill the gap since the last snapshot from the history API; the stream
    // only carries points from here on.
    let backfill = BackfillService::new(
        Arc::new(HistoryApiClient::new(cfg.stream.history_url.clone())),
        store.clone(),
    );
    for device_id in store.device_ids() {
        if let Err(err) = backfill.backfill(&device_id, 3600, 1000).await {
            tracing::warn!(%err, device_id, "history backfill failed");
        }
    }

    // Stream client; this process is one consumer until shutdown
    let client = StreamClient::new(StreamConfig::from(&cfg.stream), store.clone());
    let _stream = client.attach();

    // Periodic persistence trigger
    let persist_store = store.clone();
    let persist_sink = snapshot_store.clone();
    let snapshot_interval = Duration::from_secs(cfg.store.snapshot_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(snapshot_interval);
        ticker.tick().await; // immediate first tick carries nothing new
        loop {
            ticker.tick().await;
            if let Err(err) = persist_sink.save(&persist_store.snapshot()) {
                tracing::warn!(%err, "periodic snapshot save failed");
            }
        }
    });

    // Debug trail of accepted points with the derived rate of rise
    let estimator = RoREstimator::new(cfg.ror.estimator_config());
    let ror_store = store.clone();
    let mut updates = Box::pin(store.update_stream());
    tokio::spawn(async move {
        while let Some(update) = updates.next().await {
            let history = ror_store.device_data(&update.device_id, None, None);
            let ror = estimator.estimate_at_end(&history);
            tracing::debug!(
                device_id = %update.device_id,
                bean_temp = update.point.bean_temp,
                env_temp = update.point.env_temp,
                ror = ?ror,
                "point stored"
            );
        }
    });

    tracing::info!(url = %cfg.stream.url, "roaster-telemetry running");
    shutdown_signal().await;

    tracing::info!("shutting down, saving final snapshot");
    snapshot_store.save(&store.snapshot())?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,tokio_tungstenite=warn,tungstenite=warn"))
        .unwrap();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install signal handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
