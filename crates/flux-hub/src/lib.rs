//! Hub access for the Flux irrigation broker
//!
//! - [`Hub`]: the read-states / call-service seam the broker writes through
//! - [`HubClient`]: REST implementation of [`Hub`]
//! - [`WsClient`]: one-shot WebSocket commands (entity registry)
//! - [`EventStream`]: reconnecting `state_changed` subscription

mod client;
mod error;
mod stream;
mod ws;

use async_trait::async_trait;
use flux_core::{EntityId, ServiceCall, State};

pub use client::HubClient;
pub use error::{HubError, HubResult};
pub use stream::{calculate_backoff, parse_event_message, EventStream, ReconnectConfig, StreamSignal};
pub use ws::{RegistryEntry, WsClient};

/// Read and write access to hub entities
#[async_trait]
pub trait Hub: Send + Sync {
    /// All current entity states
    async fn get_states(&self) -> HubResult<Vec<State>>;

    /// One entity's current state, `None` if the hub doesn't know it
    async fn get_state(&self, entity_id: &EntityId) -> HubResult<Option<State>>;

    /// Invoke a service
    async fn call_service(&self, call: &ServiceCall) -> HubResult<()>;

    /// Fire a custom event on the hub's bus
    async fn fire_event(&self, event_type: &str, data: serde_json::Value) -> HubResult<()>;
}
