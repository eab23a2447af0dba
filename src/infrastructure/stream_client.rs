// Shared duplex stream client
//
// One physical WebSocket per process, shared by every consumer through
// reference-counted handles. The connection opens on the first attach and is
// torn down a grace period after the last detach, so a consumer re-attaching
// immediately (a re-render) never flaps the socket.
use crate::application::telemetry_store::TelemetryStore;
use crate::error::{Result, TelemetryError};
use crate::infrastructure::config::StreamSettings;
use crate::infrastructure::frame::{
    command_frame, parse_frame, ping_frame, DeviceCommand, InboundFrame,
};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub heartbeat: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_retries: u32,
    pub detach_grace: Duration,
}

impl From<&StreamSettings> for StreamConfig {
    fn from(s: &StreamSettings) -> Self {
        Self {
            url: s.url.clone(),
            heartbeat: Duration::from_secs(s.heartbeat_secs),
            backoff_base: Duration::from_millis(s.backoff_base_ms),
            backoff_cap: Duration::from_secs(s.backoff_cap_secs),
            max_retries: s.max_retries,
            detach_grace: Duration::from_millis(s.detach_grace_ms),
        }
    }
}

/// Process-wide connection state as consumers see it. Transitions are driven
/// solely by the client's run loop.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connecting: bool,
    pub last_error: Option<String>,
}

struct Lifecycle {
    consumers: usize,
    /// Bumped on every attach/detach so a stale grace timer can tell that
    /// someone re-attached while it slept.
    epoch: u64,
    cancel: Option<CancellationToken>,
}

struct Inner {
    config: StreamConfig,
    store: Arc<TelemetryStore>,
    status: RwLock<ConnectionStatus>,
    lifecycle: Mutex<Lifecycle>,
    wake: Notify,
    reset_attempts: AtomicBool,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Inner {
    fn set_status(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        f(&mut self.status.write());
    }

    fn record_error(&self, message: String) {
        tracing::warn!(%message, "telemetry stream error");
        self.set_status(|s| {
            s.connected = false;
            s.connecting = false;
            s.last_error = Some(message);
        });
    }

    fn force_reconnect(&self) {
        self.reset_attempts.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }
}

#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<Inner>,
}

/// A consumer's hold on the shared connection; detaches on drop. Must be
/// dropped from within a tokio runtime, since teardown is deferred through a
/// grace timer.
pub struct StreamHandle {
    inner: Arc<Inner>,
}

impl StreamClient {
    pub fn new(config: StreamConfig, store: Arc<TelemetryStore>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                status: RwLock::new(ConnectionStatus::default()),
                lifecycle: Mutex::new(Lifecycle {
                    consumers: 0,
                    epoch: 0,
                    cancel: None,
                }),
                wake: Notify::new(),
                reset_attempts: AtomicBool::new(false),
                outbound_tx,
                outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            }),
        }
    }

    /// Attach a consumer. The physical connection is established when the
    /// first consumer attaches.
    pub fn attach(&self) -> StreamHandle {
        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.consumers += 1;
        lifecycle.epoch += 1;
        if lifecycle.cancel.is_none() {
            let cancel = CancellationToken::new();
            lifecycle.cancel = Some(cancel.clone());
            tokio::spawn(run(self.inner.clone(), cancel));
        }
        StreamHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.read().clone()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lifecycle.lock().consumers
    }

    /// Queue a control command for a device. Validation happens here; the
    /// frame goes out once the connection is up.
    pub fn send_command(&self, device_id: &str, command: &DeviceCommand) -> Result<()> {
        command.validate()?;
        self.inner
            .outbound_tx
            .send(command_frame(device_id, command))
            .map_err(|_| TelemetryError::StreamClosed)
    }

    /// The host process regained foreground visibility; the presumed cause
    /// of a disconnect is gone, so retry immediately with a fresh budget.
    pub fn on_foreground(&self) {
        self.inner.force_reconnect();
    }

    /// The network transitioned from offline to online.
    pub fn on_network_online(&self) {
        self.inner.force_reconnect();
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.consumers = lifecycle.consumers.saturating_sub(1);
        if lifecycle.consumers > 0 {
            return;
        }
        lifecycle.epoch += 1;
        let epoch = lifecycle.epoch;
        drop(lifecycle);

        let inner = self.inner.clone();
        let grace = inner.config.detach_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut lifecycle = inner.lifecycle.lock();
            if lifecycle.consumers == 0 && lifecycle.epoch == epoch {
                if let Some(cancel) = lifecycle.cancel.take() {
                    cancel.cancel();
                }
                drop(lifecycle);
                inner.set_status(|s| {
                    s.connected = false;
                    s.connecting = false;
                });
                tracing::info!("last consumer detached, telemetry stream torn down");
            }
        });
    }
}

/// Exponential backoff with jitter: `min(base * 2^attempt, cap)` stretched
/// by up to 30%, clamped to the cap.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt)).min(cap);
    let jitter: f64 = rand::rng().random_range(0.0..0.3);
    exp.mul_f64(1.0 + jitter).min(cap)
}

fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn dispatch_frame(store: &TelemetryStore, text: &str, received_at: f64) {
    match parse_frame(text, received_at) {
        Ok(InboundFrame::Pong) => {}
        Ok(InboundFrame::Telemetry { device_id, point }) => store.push(&device_id, point),
        Err(err) => tracing::warn!(%err, "dropping malformed frame"),
    }
}

async fn run(inner: Arc<Inner>, cancel: CancellationToken) {
    // Exclusive for the lifetime of this task; there is at most one run loop.
    let mut outbound = inner.outbound_rx.lock().await;
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        inner.set_status(|s| {
            s.connecting = true;
            s.connected = false;
        });
        tracing::info!(url = %inner.config.url, "connecting to telemetry stream");
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_async(&inner.config.url) => result,
        };
        match connected {
            Ok((ws, _)) => {
                attempt = 0;
                inner.set_status(|s| {
                    s.connected = true;
                    s.connecting = false;
                    s.last_error = None;
                });
                tracing::info!("telemetry stream connected");
                let (mut write, mut read) = ws.split();
                // Keep-alive ping so idle proxies don't drop the socket.
                let mut heartbeat = tokio::time::interval_at(
                    tokio::time::Instant::now() + inner.config.heartbeat,
                    inner.config.heartbeat,
                );
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = write.close().await;
                            inner.set_status(|s| {
                                s.connected = false;
                                s.connecting = false;
                            });
                            return;
                        }
                        _ = heartbeat.tick() => {
                            if let Err(err) = write.send(Message::Text(ping_frame().into())).await {
                                inner.record_error(format!("heartbeat failed: {err}"));
                                break;
                            }
                        }
                        Some(frame) = outbound.recv() => {
                            if let Err(err) = write.send(Message::Text(frame.into())).await {
                                inner.record_error(format!("send failed: {err}"));
                                break;
                            }
                        }
                        message = read.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                dispatch_frame(&inner.store, text.as_str(), epoch_now());
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                inner.record_error("connection closed".to_string());
                                break;
                            }
                            Some(Ok(_)) => {} // binary and protocol-level ping/pong
                            Some(Err(err)) => {
                                inner.record_error(format!("stream error: {err}"));
                                break;
                            }
                        }
                    }
                }
                inner.set_status(|s| {
                    s.connected = false;
                    s.connecting = false;
                });
            }
            Err(err) => {
                inner.record_error(format!("connect failed: {err}"));
            }
        }

        // Disconnected: retry with backoff or settle in the terminal state.
        if inner.reset_attempts.swap(false, Ordering::SeqCst) {
            attempt = 0;
        }
        if attempt >= inner.config.max_retries {
            let err = TelemetryError::RetriesExhausted(attempt);
            tracing::error!(%err, "giving up on telemetry stream");
            inner.set_status(|s| {
                s.connected = false;
                s.connecting = false;
                s.last_error = Some(err.to_string());
            });
            return;
        }
        let delay = backoff_delay(attempt, inner.config.backoff_base, inner.config.backoff_cap);
        attempt += 1;
        tracing::info!(delay_ms = delay.as_millis() as u64, attempt, "scheduling reconnect");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            _ = inner.wake.notified() => {
                // Visibility/network trigger: the cause of the disconnect is
                // presumed resolved, start over with a fresh budget.
                if inner.reset_attempts.swap(false, Ordering::SeqCst) {
                    attempt = 0;
                }
            }
        }
    }
    inner.set_status(|s| {
        s.connected = false;
        s.connecting = false;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(max_retries: u32) -> StreamConfig {
        StreamConfig {
            // Nothing listens here; connects fail fast with ECONNREFUSED.
            url: "ws://127.0.0.1:9/".to_string(),
            heartbeat: Duration::from_secs(30),
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(20),
            max_retries,
            detach_grace: Duration::from_millis(50),
        }
    }

    fn test_store() -> Arc<TelemetryStore> {
        Arc::new(TelemetryStore::new(100, 0.1, 7200.0).unwrap())
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        for attempt in 0..4 {
            let floor = Duration::from_secs(1 << attempt);
            let ceil = floor.mul_f64(1.3);
            for _ in 0..50 {
                let d = backoff_delay(attempt, base, cap);
                assert!(d >= floor, "attempt {attempt}: {d:?} below floor");
                assert!(d <= ceil, "attempt {attempt}: {d:?} above ceiling");
            }
        }
        // Past the cap the delay pins to the cap exactly.
        for _ in 0..50 {
            assert_eq!(backoff_delay(10, base, cap), cap);
        }
    }

    #[test]
    fn test_dispatch_frame_routes_points_and_drops_garbage() {
        let store = test_store();
        dispatch_frame(
            &store,
            r#"{"device_id":"r1","telemetry":{"timestamp":10,"beanTemp":150.0,"envTemp":200.0}}"#,
            0.0,
        );
        assert_eq!(store.device_data("r1", None, None).len(), 1);

        dispatch_frame(&store, r#"{"type":"pong"}"#, 0.0);
        dispatch_frame(&store, "garbage", 0.0);
        dispatch_frame(&store, r#"{"device_id":"r1"}"#, 0.0);
        assert_eq!(store.device_data("r1", None, None).len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_state_after_retry_budget() {
        let client = StreamClient::new(test_config(2), test_store());
        let _handle = client.attach();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = client.status();
            if let Some(err) = &status.last_error {
                if err.contains("after 2 attempts") {
                    assert!(!status.connected);
                    assert!(!status.connecting);
                    break;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "never reached terminal state: {status:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_refcounted_lifecycle_with_grace() {
        let client = StreamClient::new(test_config(1000), test_store());
        let first = client.attach();
        let second = client.attach();
        assert_eq!(client.consumer_count(), 2);

        drop(first);
        assert_eq!(client.consumer_count(), 1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        // One consumer remains; the run task must survive.
        assert!(client.inner.lifecycle.lock().cancel.is_some());

        // Rapid detach/re-attach inside the grace window keeps the task.
        drop(second);
        let third = client.attach();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(client.inner.lifecycle.lock().cancel.is_some());

        // Final detach tears everything down after the grace delay.
        drop(third);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(client.consumer_count(), 0);
        assert!(client.inner.lifecycle.lock().cancel.is_none());
    }

    #[tokio::test]
    async fn test_send_command_validates_before_queueing() {
        let client = StreamClient::new(test_config(1), test_store());
        assert!(client
            .send_command("r1", &DeviceCommand::Setpoint(200.0))
            .is_ok());
        assert!(matches!(
            client.send_command("r1", &DeviceCommand::Setpoint(500.0)),
            Err(TelemetryError::InvalidCommand(_))
        ));
    }
}
