//! WebSocket command client
//!
//! Opens a short-lived authenticated connection per command. Used for
//! registry lookups that have no REST equivalent.

use std::time::Duration;

use flux_core::EntityId;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{HubError, HubResult};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// One entry of `config/entity_registry/list`
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEntry {
    pub entity_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub disabled_by: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

impl RegistryEntry {
    /// Whether the entry belongs to the device and is enabled
    pub fn is_enabled_on(&self, device_id: &str) -> bool {
        self.device_id.as_deref() == Some(device_id) && self.disabled_by.is_none()
    }
}

/// WebSocket command client
#[derive(Debug, Clone)]
pub struct WsClient {
    ws_url: String,
    token: String,
}

impl WsClient {
    /// Create a client for the hub's WebSocket endpoint
    pub fn new(ws_url: &str, token: &str) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            token: token.to_string(),
        }
    }

    /// WebSocket endpoint this client talks to
    pub fn url(&self) -> &str {
        &self.ws_url
    }

    /// List every entry in the entity registry
    pub async fn entity_registry_list(&self) -> HubResult<Vec<RegistryEntry>> {
        let result = self
            .run_command(json!({"type": "config/entity_registry/list"}))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Enabled entities registered to a device
    pub async fn device_entities(&self, device_id: &str) -> HubResult<Vec<EntityId>> {
        let entries = self.entity_registry_list().await?;
        Ok(entities_of_device(&entries, device_id))
    }

    /// Resolve a device roster, retrying while the hub is still loading
    ///
    /// An empty roster or a transient failure is retried up to `max_attempts`
    /// times, waiting `step`, then `2 * step`, and so on between attempts.
    pub async fn device_entities_with_retry(
        &self,
        device_id: &str,
        max_attempts: u32,
        step: Duration,
    ) -> HubResult<Vec<EntityId>> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = self.device_entities(device_id).await;
            match &outcome {
                Ok(entities) => {
                    info!(
                        device = %device_id,
                        attempt,
                        max_attempts,
                        count = entities.len(),
                        "Resolved device entities"
                    );
                    if !entities.is_empty() {
                        return outcome;
                    }
                }
                Err(e) if !e.is_transient() => {
                    warn!(device = %device_id, error = %e, "Device lookup rejected, not retrying");
                    return outcome;
                }
                Err(e) => {
                    warn!(device = %device_id, attempt, error = %e, "Failed to resolve device entities");
                }
            }

            if attempt >= max_attempts {
                return outcome;
            }
            let delay = step * attempt;
            info!(device = %device_id, delay_s = delay.as_secs(), "Hub may still be loading, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Connect, authenticate, and run a single command, returning its `result`
    pub async fn run_command(&self, mut command: Value) -> HubResult<Value> {
        let name = command
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("command")
            .to_string();
        command["id"] = json!(1);

        let mut ws = connect_authenticated(&self.ws_url, &self.token).await?;
        send_json(&mut ws, &command).await?;

        let response = loop {
            let msg = recv_json(&mut ws).await?;
            if msg.get("id").and_then(|id| id.as_u64()) == Some(1) {
                break msg;
            }
        };
        let _ = ws.close(None).await;

        command_result(&name, response)
    }
}

/// Enabled entity ids of one device
pub(crate) fn entities_of_device(entries: &[RegistryEntry], device_id: &str) -> Vec<EntityId> {
    entries
        .iter()
        .filter(|entry| entry.is_enabled_on(device_id))
        .filter_map(|entry| match entry.entity_id.parse() {
            Ok(id) => Some(id),
            Err(e) => {
                debug!(entity_id = %entry.entity_id, error = %e, "Skipping registry entry");
                None
            }
        })
        .collect()
}

/// Unwrap a `result` message
pub(crate) fn command_result(name: &str, response: Value) -> HubResult<Value> {
    if response.get("type").and_then(|t| t.as_str()) != Some("result") {
        return Err(HubError::Protocol(format!(
            "expected result for {}, got {}",
            name, response
        )));
    }
    if response.get("success").and_then(|s| s.as_bool()) != Some(true) {
        let message = response
            .pointer("/error/message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error")
            .to_string();
        return Err(HubError::Command {
            command: name.to_string(),
            message,
        });
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

/// Connect and complete the auth handshake
pub(crate) async fn connect_authenticated(ws_url: &str, token: &str) -> HubResult<WsStream> {
    let (mut ws, _) = timeout(CONNECT_TIMEOUT, connect_async(ws_url))
        .await
        .map_err(|_| HubError::Timeout("WebSocket connect"))?
        .map_err(|e| HubError::WebSocket(format!("connect failed: {}", e)))?;

    let hello = recv_json(&mut ws).await?;
    if hello.get("type").and_then(|t| t.as_str()) != Some("auth_required") {
        return Err(HubError::Protocol(format!("expected auth_required, got {}", hello)));
    }

    send_json(&mut ws, &json!({"type": "auth", "access_token": token})).await?;

    let auth_response = recv_json(&mut ws).await?;
    match auth_response.get("type").and_then(|t| t.as_str()) {
        Some("auth_ok") => Ok(ws),
        Some("auth_invalid") => Err(HubError::Auth(
            auth_response
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("invalid access token")
                .to_string(),
        )),
        _ => Err(HubError::Protocol(format!(
            "unexpected auth response {}",
            auth_response
        ))),
    }
}

pub(crate) async fn send_json(ws: &mut WsStream, value: &Value) -> HubResult<()> {
    ws.send(Message::Text(value.to_string()))
        .await
        .map_err(|e| HubError::WebSocket(format!("send failed: {}", e)))
}

/// Receive the next JSON text frame, skipping control frames
pub(crate) async fn recv_json(ws: &mut WsStream) -> HubResult<Value> {
    loop {
        let msg = timeout(RECV_TIMEOUT, ws.next())
            .await
            .map_err(|_| HubError::Timeout("WebSocket message"))?
            .ok_or_else(|| HubError::WebSocket("connection closed".to_string()))?
            .map_err(|e| HubError::WebSocket(format!("receive error: {}", e)))?;

        match msg {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                return Err(HubError::WebSocket("connection closed".to_string()))
            }
            other => {
                return Err(HubError::Protocol(format!(
                    "unexpected message type: {:?}",
                    other
                )))
            }
        }
    }
}
