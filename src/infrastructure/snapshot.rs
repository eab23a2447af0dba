// JSON file implementation of the snapshot persistence port
use crate::application::telemetry_store::{Snapshot, SnapshotStore};
use anyhow::Context;
use std::fs;
use std::path::PathBuf;

/// Persists the per-device compression cursors and encoded blocks to a
/// single JSON file. Entries past the retention horizon are pruned on load,
/// before the snapshot is handed to the store.
pub struct FileSnapshotStore {
    path: PathBuf,
    retention_secs: f64,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>, retention_secs: f64) -> Self {
        Self {
            path: path.into(),
            retention_secs,
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> anyhow::Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read snapshot {}", self.path.display()))?;
        let mut snapshot: Snapshot = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt snapshot file {}", self.path.display()))?;
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        snapshot.prune(now, self.retention_secs);
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string(snapshot).context("failed to serialize snapshot")?;
        // Write-then-rename so a crash mid-save never leaves a torn file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .with_context(|| format!("failed to write snapshot {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move snapshot into {}", self.path.display()))?;
        Ok(())
    }
}
