// Roaster telemetry core: stream ingestion, bounded per-device history,
// compressed snapshots, adaptive thinning and derived rate-of-rise.
pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;
