//! REST client for the hub

use std::time::Duration;

use async_trait::async_trait;
use flux_core::{EntityId, ServiceCall, State};
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::{HubError, HubResult};
use crate::Hub;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// REST client for `{base_url}/api/...`
#[derive(Clone)]
pub struct HubClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HubClient {
    /// Create a client for the hub at `base_url`
    pub fn new(base_url: &str, token: Option<String>) -> HubResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Base URL without the trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token {
            Some(ref token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn get_json(&self, path: &str) -> HubResult<Option<Value>> {
        let request = self.authorize(self.client.get(self.url(path)));
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(HubError::Status {
                method: "GET",
                path: path.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(Some(response.json().await?))
    }

    async fn post_json(&self, path: &str, body: &Value) -> HubResult<()> {
        let request = self.authorize(self.client.post(self.url(path))).json(body);
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(HubError::Status {
                method: "POST",
                path: path.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Check if the hub API answers
    pub async fn is_healthy(&self) -> bool {
        let request = self
            .authorize(self.client.get(self.url("/")))
            .timeout(HEALTH_TIMEOUT);
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Wait for the hub to become healthy
    pub async fn wait_for_healthy(&self, timeout: Duration) -> bool {
        let start = tokio::time::Instant::now();
        let check_interval = Duration::from_secs(2);

        while start.elapsed() < timeout {
            if self.is_healthy().await {
                return true;
            }
            tokio::time::sleep(check_interval).await;
        }

        false
    }
}

/// Parse a `/api/states` body, skipping entries that don't parse
pub(crate) fn parse_states(body: Value) -> HubResult<Vec<State>> {
    let entries = match body {
        Value::Array(entries) => entries,
        other => {
            return Err(HubError::Protocol(format!(
                "expected a state list, got {}",
                json_kind(&other)
            )))
        }
    };

    let mut states = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<State>(entry) {
            Ok(state) => states.push(state),
            Err(e) => debug!(error = %e, "Skipping unparseable state entry"),
        }
    }
    Ok(states)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl Hub for HubClient {
    async fn get_states(&self) -> HubResult<Vec<State>> {
        match self.get_json("/states").await? {
            Some(body) => parse_states(body),
            None => Ok(Vec::new()),
        }
    }

    async fn get_state(&self, entity_id: &EntityId) -> HubResult<Option<State>> {
        match self.get_json(&format!("/states/{}", entity_id)).await? {
            Some(body) => Ok(Some(serde_json::from_value(body)?)),
            None => Ok(None),
        }
    }

    async fn call_service(&self, call: &ServiceCall) -> HubResult<()> {
        debug!(service = %call.service_id(), data = %call.service_data, "Calling service");
        let path = format!("/services/{}/{}", call.domain, call.service);
        self.post_json(&path, &call.service_data).await
    }

    async fn fire_event(&self, event_type: &str, data: Value) -> HubResult<()> {
        debug!(event_type, "Firing event");
        self.post_json(&format!("/events/{}", event_type), &data).await
    }
}
