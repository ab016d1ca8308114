//! State type representing an entity's current value on the hub

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EntityId;

/// The state of an entity as reported by the hub
///
/// Only the fields the broker reads are modelled; anything else the hub
/// sends (such as the change context) is ignored on deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// The entity this state belongs to
    pub entity_id: EntityId,

    /// The state value (e.g., "on", "12", "5:00 AM", "unavailable")
    pub state: String,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,

    /// When the state was last written, even if the value didn't change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl State {
    /// Create a state with the current timestamp and no attributes
    pub fn new(entity_id: EntityId, state: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes: HashMap::new(),
            last_changed: Some(now),
            last_updated: Some(now),
        }
    }

    /// Check if the state value represents an unavailable entity
    pub fn is_unavailable(&self) -> bool {
        self.state == crate::STATE_UNAVAILABLE
    }

    /// Check if the state value represents an unknown state
    pub fn is_unknown(&self) -> bool {
        self.state == crate::STATE_UNKNOWN
    }

    /// Get an attribute value by key
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The entity's friendly name, falling back to the entity ID
    pub fn friendly_name(&self) -> String {
        self.attribute::<String>("friendly_name")
            .unwrap_or_else(|| self.entity_id.to_string())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are not compared
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}
