// Central store - owns per-device ring buffers and compression cursors
use crate::application::thinner::{thin, ThinnedSeries, ThinnerConfig, ThinningMode};
use crate::application::ror::{RoREstimator, RoRPoint};
use crate::domain::codec::{CompressionCodec, CompressionState, EncodedBlock};
use crate::domain::ring_buffer::RingBuffer;
use crate::domain::telemetry::TelemetryPoint;
use crate::error::{Result, TelemetryError};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Fan-out notification for every accepted point.
#[derive(Debug, Clone)]
pub struct StoreUpdate {
    pub device_id: String,
    pub point: TelemetryPoint,
}

/// Durable snapshot: per device, the compression cursor plus the encoded
/// blocks produced so far. Raw points are never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub devices: HashMap<String, DeviceSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub state: CompressionState,
    pub blocks: Vec<EncodedBlock>,
}

impl Snapshot {
    /// Drop device entries whose cursor base is older than the retention
    /// horizon; stale persisted history is forgotten rather than replayed.
    pub fn prune(&mut self, now: f64, retention_secs: f64) {
        self.devices
            .retain(|_, d| now - d.state.base_timestamp <= retention_secs);
    }
}

/// Persistence port. The store calls this at defined points (periodic
/// trigger, teardown); implementations live in the infrastructure layer.
pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<Snapshot>>;
    fn save(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
}

struct DeviceEntry {
    buffer: RingBuffer,
    state: CompressionState,
    blocks: Vec<EncodedBlock>,
    /// Points appended since the last encode pass; drained on snapshot.
    pending: Vec<TelemetryPoint>,
}

impl DeviceEntry {
    fn new(capacity: usize, base_timestamp: f64) -> Result<Self> {
        Ok(Self {
            buffer: RingBuffer::new(capacity)?,
            state: CompressionState::new(base_timestamp),
            blocks: Vec::new(),
            pending: Vec::new(),
        })
    }
}

/// Owns all per-device history. Push, range queries and clears are
/// synchronous and serialized behind one lock; a device has exactly one
/// active stream, so per-device writes never contend with themselves.
pub struct TelemetryStore {
    devices: RwLock<HashMap<String, DeviceEntry>>,
    codec: CompressionCodec,
    capacity: usize,
    retention_secs: f64,
    updates_tx: broadcast::Sender<StoreUpdate>,
}

impl TelemetryStore {
    pub fn new(capacity: usize, precision: f64, retention_secs: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(TelemetryError::InvalidCapacity(capacity));
        }
        let (updates_tx, _) = broadcast::channel(256);
        Ok(Self {
            devices: RwLock::new(HashMap::new()),
            codec: CompressionCodec::new(precision),
            capacity,
            retention_secs,
            updates_tx,
        })
    }

    /// Append one point in arrival order. Never fails; a buffer is created
    /// lazily for an unseen device id.
    pub fn push(&self, device_id: &str, point: TelemetryPoint) {
        let mut devices = self.devices.write();
        let entry = match devices.entry(device_id.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => match DeviceEntry::new(self.capacity, point.ts) {
                Ok(e) => v.insert(e),
                Err(err) => {
                    tracing::error!(%err, device_id, "failed to create device buffer");
                    return;
                }
            },
        };
        entry.buffer.append(point.clone());
        entry.pending.push(point.clone());
        drop(devices);
        let _ = self.updates_tx.send(StoreUpdate {
            device_id: device_id.to_string(),
            point,
        });
    }

    /// Bulk append, used when backfilling from the historical query API.
    pub fn extend(&self, device_id: &str, points: impl IntoIterator<Item = TelemetryPoint>) {
        for point in points {
            self.push(device_id, point);
        }
    }

    /// Recent history for a device, optionally restricted to
    /// `[start, end]` (inclusive). Unknown devices yield an empty series.
    pub fn device_data(
        &self,
        device_id: &str,
        start: Option<f64>,
        end: Option<f64>,
    ) -> Vec<TelemetryPoint> {
        let devices = self.devices.read();
        let Some(entry) = devices.get(device_id) else {
            return Vec::new();
        };
        match (start, end) {
            (None, None) => entry.buffer.points(),
            (s, e) => entry
                .buffer
                .range(s.unwrap_or(f64::NEG_INFINITY), e.unwrap_or(f64::INFINITY)),
        }
    }

    /// Drop all history and the compression cursor for a device; it is
    /// recreated from scratch on the next point.
    pub fn clear_device(&self, device_id: &str) {
        self.devices.write().remove(device_id);
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn latest(&self, device_id: &str) -> Option<TelemetryPoint> {
        self.devices
            .read()
            .get(device_id)
            .and_then(|e| e.buffer.latest().cloned())
    }

    /// Render-budgeted series for charting.
    pub fn thinned(
        &self,
        device_id: &str,
        budget: usize,
        mode: ThinningMode,
        config: &ThinnerConfig,
    ) -> ThinnedSeries {
        let points = self.device_data(device_id, None, None);
        thin(&points, budget, mode, config)
    }

    /// Derived rate-of-rise series over the device's full buffer.
    pub fn rate_of_rise(&self, device_id: &str, estimator: &RoREstimator) -> Vec<RoRPoint> {
        let points = self.device_data(device_id, None, None);
        estimator.compute(&points)
    }

    /// Encode everything appended since the last pass and return the durable
    /// snapshot. Cursors whose base has aged past the retention horizon are
    /// re-based onto the live buffer so persisted history stays bounded.
    pub fn snapshot(&self) -> Snapshot {
        let mut devices = self.devices.write();
        let mut snap = Snapshot::default();
        for (id, entry) in devices.iter_mut() {
            if !entry.pending.is_empty() {
                let pending = std::mem::take(&mut entry.pending);
                let (block, next) = self.codec.encode(&pending, &entry.state);
                entry.blocks.push(block);
                entry.state = next;
            }
            let span = entry
                .state
                .last_point
                .as_ref()
                .map(|p| p.ts - entry.state.base_timestamp)
                .unwrap_or(0.0);
            if span > self.retention_secs {
                let points = entry.buffer.points();
                if let Some(first) = points.first() {
                    let fresh = CompressionState::new(first.ts);
                    let (block, next) = self.codec.encode(&points, &fresh);
                    entry.blocks = vec![block];
                    entry.state = next;
                }
            }
            snap.devices.insert(
                id.clone(),
                DeviceSnapshot {
                    state: entry.state.clone(),
                    blocks: entry.blocks.clone(),
                },
            );
        }
        snap
    }

    /// Rebuild buffers from a snapshot. Fails fast on a snapshot whose
    /// blocks do not replay to the persisted cursor; nothing is loaded for
    /// the offending device and the error is surfaced to the caller.
    pub fn restore(&self, snapshot: Snapshot) -> Result<()> {
        let mut devices = self.devices.write();
        for (id, device) in snapshot.devices {
            let codec = CompressionCodec::new(
                device
                    .blocks
                    .first()
                    .map(|b| b.precision)
                    .unwrap_or(self.codec.precision()),
            );
            let mut state = CompressionState::new(device.state.base_timestamp);
            let mut points = Vec::new();
            for block in &device.blocks {
                let (decoded, next) = codec.decode(block, &state);
                points.extend(decoded);
                state = next;
            }
            if state.last_point != device.state.last_point {
                return Err(TelemetryError::CorruptSnapshot(format!(
                    "device {id}: replayed cursor does not match persisted cursor"
                )));
            }
            let mut entry = DeviceEntry::new(self.capacity, device.state.base_timestamp)?;
            for point in points {
                entry.buffer.append(point);
            }
            entry.state = device.state;
            entry.blocks = device.blocks;
            devices.insert(id, entry);
        }
        Ok(())
    }

    pub fn updates(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates_tx.subscribe()
    }

    /// Broadcast updates as a `Stream`, skipping over lag gaps.
    pub fn update_stream(&self) -> impl Stream<Item = StoreUpdate> + Send + use<> {
        let mut rx = self.updates_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(update) => yield update,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "store update stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TelemetryStore {
        TelemetryStore::new(3000, 0.1, 7200.0).unwrap()
    }

    fn pt(ts: f64, bean: f64) -> TelemetryPoint {
        TelemetryPoint::new(ts, bean, 200.0)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(TelemetryStore::new(0, 0.1, 7200.0).is_err());
    }

    #[test]
    fn test_push_and_query() {
        let store = store();
        for i in 0..20 {
            store.push("roaster-1", pt(i as f64, 150.0 + i as f64));
        }
        assert_eq!(store.device_data("roaster-1", None, None).len(), 20);
        assert_eq!(store.device_data("roaster-1", Some(5.0), Some(9.0)).len(), 5);
        assert!(store.device_data("unknown", None, None).is_empty());
        assert_eq!(store.device_ids(), vec!["roaster-1".to_string()]);
    }

    #[test]
    fn test_clear_device() {
        let store = store();
        store.push("a", pt(1.0, 150.0));
        store.clear_device("a");
        assert!(store.device_data("a", None, None).is_empty());
        assert!(store.device_ids().is_empty());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let store = store();
        for i in 0..40 {
            store.push("r1", pt(1000.0 + i as f64, 150.0 + i as f64 * 1.5));
        }
        let snap = store.snapshot();

        let restored = TelemetryStore::new(3000, 0.1, 7200.0).unwrap();
        restored.restore(snap).unwrap();
        let points = restored.device_data("r1", None, None);
        assert_eq!(points.len(), 40);
        for (i, p) in points.iter().enumerate() {
            assert!((p.bean_temp - (150.0 + i as f64 * 1.5)).abs() <= 0.05 + 1e-9);
        }

        // Cursor resumes: pushing more and snapshotting again keeps history.
        restored.push("r1", pt(1040.0, 215.0));
        let snap2 = restored.snapshot();
        assert_eq!(snap2.devices["r1"].blocks.len(), 2);
    }

    #[test]
    fn test_restore_rejects_tampered_snapshot() {
        let store = store();
        for i in 0..10 {
            store.push("r1", pt(i as f64, 150.0));
        }
        let mut snap = store.snapshot();
        let device = snap.devices.get_mut("r1").unwrap();
        device.blocks[0].records.pop();

        let fresh = TelemetryStore::new(3000, 0.1, 7200.0).unwrap();
        assert!(matches!(
            fresh.restore(snap),
            Err(TelemetryError::CorruptSnapshot(_))
        ));
        assert!(fresh.device_data("r1", None, None).is_empty());
    }

    #[test]
    fn test_snapshot_prune_drops_stale_devices() {
        let store = store();
        store.push("old", pt(1000.0, 150.0));
        store.push("new", pt(9000.0, 150.0));
        let mut snap = store.snapshot();
        snap.prune(9100.0, 7200.0);
        assert!(!snap.devices.contains_key("old"));
        assert!(snap.devices.contains_key("new"));
    }

    #[test]
    fn test_snapshot_rebases_long_running_cursor() {
        let store = TelemetryStore::new(30, 0.1, 50.0).unwrap();
        for i in 0..80 {
            store.push("r1", pt(i as f64, 150.0));
        }
        let snap = store.snapshot();
        // Cursor span (79 s) exceeded retention (50 s): a single re-based
        // block covering only the live buffer (last 30 points) remains.
        let device = &snap.devices["r1"];
        assert_eq!(device.blocks.len(), 1);
        assert_eq!(device.state.base_timestamp, 50.0);
        assert_eq!(device.blocks[0].records.len(), 30);
    }

    #[tokio::test]
    async fn test_updates_broadcast() {
        let store = store();
        let mut rx = store.updates();
        store.push("r1", pt(1.0, 180.0));
        let update = rx.recv().await.unwrap();
        assert_eq!(update.device_id, "r1");
        assert_eq!(update.point.bean_temp, 180.0);
    }
}
