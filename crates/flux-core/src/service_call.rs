//! Service call type for writing entities on the hub

use serde::{Deserialize, Serialize};

use crate::EntityId;

/// A call to a hub service
///
/// Every write the broker performs is exactly one of these: a domain, a
/// service name and a JSON body that always carries the target `entity_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    /// The domain the service belongs to (e.g., "switch", "number")
    pub domain: String,

    /// The service name (e.g., "turn_on", "set_value", "press")
    pub service: String,

    /// Data posted with the call
    pub service_data: serde_json::Value,
}

impl ServiceCall {
    /// Create a new service call
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: serde_json::Value,
    ) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data,
        }
    }

    /// Create a call targeting one entity, in the entity's own domain
    pub fn for_entity(entity_id: &EntityId, service: impl Into<String>) -> Self {
        Self::new(
            entity_id.domain(),
            service,
            serde_json::json!({ "entity_id": entity_id.to_string() }),
        )
    }

    /// Add a field to the service data
    pub fn with_data(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(map) = &mut self.service_data {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    /// Get the full service identifier (domain.service)
    pub fn service_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }

    /// Get a value from service_data
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.service_data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The target entity of this call, if it names exactly one
    pub fn entity_id(&self) -> Option<EntityId> {
        self.service_data
            .get("entity_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}
