//! State-change event stream with auto-reconnect.
//!
//! Holds one authenticated WebSocket subscription to `state_changed` and
//! forwards each change as a [`StreamSignal`]. Connection transitions are
//! forwarded too, so the consumer can suspend mirroring while the stream
//! is down. Reconnects with exponential backoff and never gives up; the
//! loop ends when the token is cancelled or the receiver is dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! let cancel = CancellationToken::new();
//! let mut rx = EventStream::spawn(ws_url, token, ReconnectConfig::default(), cancel.clone());
//!
//! while let Some(signal) = rx.recv().await {
//!     // Connected | StateChanged(change) | Disconnected
//! }
//! ```

use std::time::Duration;

use flux_core::Event;
use flux_core::events::{StateChange, StateChangedData, STATE_CHANGED};
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, HubResult};
use crate::ws::{command_result, connect_authenticated, recv_json, send_json};

const SIGNAL_CHANNEL_CAPACITY: usize = 1024;
const SUBSCRIBE_ID: u64 = 1;

/// What the stream reports to its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// Subscribed; changes follow
    Connected,
    /// One observed state change
    StateChanged(StateChange),
    /// Subscription lost; a reconnect is pending
    Disconnected,
}

/// Exponential backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Spawner for the reconnecting subscription task
pub struct EventStream;

impl EventStream {
    /// Spawn the subscription loop and return its signal receiver
    pub fn spawn(
        ws_url: String,
        token: String,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamSignal> {
        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            stream_loop(ws_url, token, tx, reconnect, cancel).await;
        });
        rx
    }
}

/// Main loop: connect → subscribe → read → on error, backoff → reconnect.
async fn stream_loop(
    ws_url: String,
    token: String,
    tx: mpsc::Sender<StreamSignal>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let mut connected = false;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connect_and_read(&ws_url, &token, &tx, &cancel, &mut connected) => result,
        };

        if connected {
            attempt = 0;
            if tx.send(StreamSignal::Disconnected).await.is_err() {
                break;
            }
        }
        if tx.is_closed() || cancel.is_cancelled() {
            break;
        }

        match result {
            Ok(()) => tracing::info!("Event stream disconnected, reconnecting"),
            Err(HubError::Auth(reason)) => {
                tracing::error!(reason = %reason, attempt, "Event stream authentication rejected")
            }
            Err(e) => tracing::warn!(error = %e, attempt, "Event stream error"),
        }

        let delay = calculate_backoff(attempt, &reconnect);
        tracing::info!(
            delay_ms = delay.as_millis() as u64,
            attempt,
            "Waiting before reconnect"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt = attempt.saturating_add(1);
    }

    tracing::debug!("Event stream loop exiting");
}

/// One connection lifecycle: subscribe and forward until it drops
async fn connect_and_read(
    ws_url: &str,
    token: &str,
    tx: &mpsc::Sender<StreamSignal>,
    cancel: &CancellationToken,
    connected: &mut bool,
) -> HubResult<()> {
    tracing::info!(url = %ws_url, "Connecting to event stream");
    let mut ws = connect_authenticated(ws_url, token).await?;

    send_json(
        &mut ws,
        &json!({"id": SUBSCRIBE_ID, "type": "subscribe_events", "event_type": STATE_CHANGED}),
    )
    .await?;
    loop {
        let msg = recv_json(&mut ws).await?;
        if msg.get("id").and_then(|id| id.as_u64()) == Some(SUBSCRIBE_ID) {
            command_result("subscribe_events", msg)?;
            break;
        }
    }

    tracing::info!("Event stream subscribed to {}", STATE_CHANGED);
    *connected = true;
    if tx.send(StreamSignal::Connected).await.is_err() {
        return Ok(());
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(change) = parse_event_message(&text) {
                            if tx.send(StreamSignal::StateChanged(change)).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite answers pings itself
                        tracing::trace!("WebSocket ping");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(code = %cf.code, reason = %cf.reason, "WebSocket close frame received");
                        }
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(HubError::WebSocket(e.to_string())),
                    None => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

/// Extract a state change from an `event` message
///
/// Anything else (results, pongs, other event types) yields `None`.
pub fn parse_event_message(text: &str) -> Option<StateChange> {
    let msg: serde_json::Value = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to parse stream message");
            return None;
        }
    };
    if msg.get("type").and_then(|t| t.as_str()) != Some("event") {
        return None;
    }

    let event: Event<StateChangedData> = match serde_json::from_value(msg.get("event")?.clone()) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping undecodable event");
            return None;
        }
    };
    if event.event_type.as_str() != STATE_CHANGED {
        return None;
    }
    Some(StateChange::from(event.data))
}

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) * (1 ± 25%)`, never above `max`.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let max = config.max_delay.as_secs_f64();
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt.min(31) as i32);
    let capped = base.min(max);

    // Deterministic jitter seeded from the attempt number
    let jitter_factor = 1.0 + 0.25 * ((attempt as f64 * 7.3).sin());
    let with_jitter = (capped * jitter_factor).clamp(0.0, max);

    Duration::from_secs_f64(with_jitter)
}
