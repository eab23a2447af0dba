// Configuration loading
use crate::application::ror::{FilterKind, RoRConfig, RoRFilter};
use crate::application::thinner::ThinnerConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub ror: RoRSettings,
    #[serde(default)]
    pub thinner: ThinnerSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamSettings {
    #[serde(default = "default_stream_url")]
    pub url: String,
    #[serde(default = "default_history_url")]
    pub history_url: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_detach_grace_ms")]
    pub detach_grace_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_precision")]
    pub precision: f64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoRSettings {
    #[serde(default = "default_data_window")]
    pub data_window: usize,
    #[serde(default = "default_poly_degree")]
    pub poly_degree: usize,
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThinnerSettings {
    #[serde(default = "default_render_budget")]
    pub render_budget: usize,
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,
}

impl RoRSettings {
    pub fn estimator_config(&self) -> RoRConfig {
        RoRConfig {
            data_window: self.data_window,
            poly_degree: self.poly_degree,
        }
    }

    /// A post-filter of the requested kind carrying the configured window
    /// and smoothing factor.
    pub fn filter(&self, kind: FilterKind) -> RoRFilter {
        RoRFilter::new(kind, self.smoothing_window, self.ema_alpha)
    }
}

impl ThinnerSettings {
    pub fn thinner_config(&self) -> ThinnerConfig {
        ThinnerConfig {
            change_threshold: self.change_threshold,
        }
    }
}

fn default_stream_url() -> String {
    "ws://127.0.0.1:8080/ws/telemetry".to_string()
}
fn default_history_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_cap_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    10
}
fn default_detach_grace_ms() -> u64 {
    100
}
fn default_buffer_capacity() -> usize {
    3000
}
fn default_precision() -> f64 {
    0.1
}
fn default_retention_secs() -> u64 {
    7200
}
fn default_snapshot_interval_secs() -> u64 {
    60
}
fn default_snapshot_path() -> String {
    "data/telemetry_snapshot.json".to_string()
}
fn default_data_window() -> usize {
    30
}
fn default_poly_degree() -> usize {
    4
}
fn default_smoothing_window() -> usize {
    5
}
fn default_ema_alpha() -> f64 {
    0.3
}
fn default_render_budget() -> usize {
    900
}
fn default_change_threshold() -> f64 {
    0.5
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: default_stream_url(),
            history_url: default_history_url(),
            heartbeat_secs: default_heartbeat_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_secs: default_backoff_cap_secs(),
            max_retries: default_max_retries(),
            detach_grace_ms: default_detach_grace_ms(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            precision: default_precision(),
            retention_secs: default_retention_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

impl Default for RoRSettings {
    fn default() -> Self {
        Self {
            data_window: default_data_window(),
            poly_degree: default_poly_degree(),
            smoothing_window: default_smoothing_window(),
            ema_alpha: default_ema_alpha(),
        }
    }
}

impl Default for ThinnerSettings {
    fn default() -> Self {
        Self {
            render_budget: default_render_budget(),
            change_threshold: default_change_threshold(),
        }
    }
}

/// Load `config/telemetry.toml`, falling back to defaults when the file is
/// absent.
pub fn load_config() -> anyhow::Result<TelemetryConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/telemetry").required(false))
        .build()?;

    Ok(settings.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_observed_usage() {
        let cfg = TelemetryConfig::default();
        assert_eq!(cfg.store.buffer_capacity, 3000);
        assert_eq!(cfg.store.precision, 0.1);
        assert_eq!(cfg.store.retention_secs, 7200);
        assert_eq!(cfg.stream.heartbeat_secs, 30);
        assert_eq!(cfg.stream.max_retries, 10);
        assert_eq!(cfg.ror.data_window, 30);
        assert_eq!(cfg.ror.poly_degree, 4);
        assert_eq!(cfg.thinner.render_budget, 900);
        assert_eq!(cfg.thinner.thinner_config().change_threshold, 0.5);
        assert_eq!(cfg.ror.estimator_config().data_window, 30);
    }
}
