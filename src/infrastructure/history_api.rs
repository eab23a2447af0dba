// Historical query API client - fallback source while the stream is down
use crate::application::history::HistorySource;
use crate::domain::telemetry::TelemetryPoint;
use crate::infrastructure::frame::WireTelemetry;
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct HistoryApiClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[allow(dead_code)]
    device_id: String,
    #[allow(dead_code)]
    count: usize,
    items: Vec<HistoryItem>,
}

#[derive(Debug, Deserialize)]
struct HistoryItem {
    ts: i64,
    telemetry: WireTelemetry,
}

impl HistoryApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

/// Rows arrive newest-first from the API; normalize each payload and flip to
/// append order. Rows that fail normalization are skipped, not fatal.
fn into_points(response: HistoryResponse) -> Vec<TelemetryPoint> {
    let mut points = Vec::with_capacity(response.items.len());
    for item in response.items.into_iter().rev() {
        match item.telemetry.normalize(item.ts as f64) {
            Ok(point) => points.push(point),
            Err(err) => tracing::warn!(%err, "skipping malformed history row"),
        }
    }
    points
}

#[async_trait]
impl HistorySource for HistoryApiClient {
    async fn fetch(
        &self,
        device_id: &str,
        since_secs: u64,
        limit: u32,
    ) -> anyhow::Result<Vec<TelemetryPoint>> {
        let url = format!(
            "{}/api/roaster/{}/telemetry?since_secs={}&limit={}",
            self.base_url, device_id, since_secs, limit
        );
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .context("failed to reach history API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("history query failed with status {}: {}", status, body);
        }

        let data = response
            .json::<HistoryResponse>()
            .await
            .context("failed to parse history response")?;

        Ok(into_points(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_normalized_and_reversed() {
        let raw = r#"{
            "device_id": "roaster-1",
            "count": 3,
            "items": [
                {"ts": 30, "telemetry": {"beanTemp": 160.0, "envTemp": 205.0}},
                {"ts": 20, "telemetry": {"bean_temp": 155.0, "env_temp": 204.0}},
                {"ts": 10, "telemetry": {"beanTemp": 150.0, "envTemp": 203.0}}
            ]
        }"#;
        let response: HistoryResponse = serde_json::from_str(raw).unwrap();
        let points = into_points(response);
        assert_eq!(points.len(), 3);
        // Oldest first, timestamps taken from the row when the payload has none.
        assert_eq!(points[0].ts, 10.0);
        assert_eq!(points[2].ts, 30.0);
        assert_eq!(points[1].bean_temp, 155.0);
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let raw = r#"{
            "device_id": "roaster-1",
            "count": 2,
            "items": [
                {"ts": 20, "telemetry": {"beanTemp": 155.0, "envTemp": 204.0}},
                {"ts": 10, "telemetry": {"envTemp": 203.0}}
            ]
        }"#;
        let response: HistoryResponse = serde_json::from_str(raw).unwrap();
        let points = into_points(response);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].ts, 20.0);
    }
}
