// Fallback point source - historical query API backfill
use crate::application::telemetry_store::TelemetryStore;
use crate::domain::telemetry::TelemetryPoint;
use async_trait::async_trait;
use std::sync::Arc;

/// Alternate point source used when the stream is disconnected. Returns
/// points oldest-first; implementations live in the infrastructure layer.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch(
        &self,
        device_id: &str,
        since_secs: u64,
        limit: u32,
    ) -> anyhow::Result<Vec<TelemetryPoint>>;
}

/// Use case: pull recent history from the query API into the store.
#[derive(Clone)]
pub struct BackfillService {
    source: Arc<dyn HistorySource>,
    store: Arc<TelemetryStore>,
}

impl BackfillService {
    pub fn new(source: Arc<dyn HistorySource>, store: Arc<TelemetryStore>) -> Self {
        Self { source, store }
    }

    /// Fetch and append, returning how many points were ingested.
    pub async fn backfill(
        &self,
        device_id: &str,
        since_secs: u64,
        limit: u32,
    ) -> anyhow::Result<usize> {
        let points = self.source.fetch(device_id, since_secs, limit).await?;
        let count = points.len();
        self.store.extend(device_id, points);
        tracing::debug!(device_id, count, "backfilled history");
        Ok(count)
    }
}
