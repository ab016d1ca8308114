//! Core types for the Flux irrigation broker
//!
//! This crate provides the hub-facing value types shared by every other
//! crate in the workspace: EntityId, State, Event, StateChange and
//! ServiceCall, plus the per-domain write semantics the mirror relies on.

mod domains;
mod entity_id;
mod event;
mod service_call;
mod state;

pub use domains::{is_readonly_domain, WriteKind};
pub use entity_id::{EntityId, EntityIdError};
pub use event::{Event, EventOrigin, EventType};
pub use service_call::ServiceCall;
pub use state::State;

/// State value the hub reports while an entity's device is offline
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State value the hub reports before an entity has a real value
pub const STATE_UNKNOWN: &str = "unknown";

/// Check if a state value is hub bookkeeping rather than a real value
///
/// Bookkeeping values are never mirrored between devices.
pub fn is_bookkeeping_state(value: &str) -> bool {
    value == STATE_UNAVAILABLE || value == STATE_UNKNOWN
}

/// Check if a state value means "active" for toggle-like entities
///
/// Switches report `on`/`off`, valves report `open`/`closed`.
pub fn is_active_state(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "on" | "open" | "opening" | "true" | "1"
    )
}

/// Standard event types the broker consumes
pub mod events {
    use super::*;

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Data for STATE_CHANGED events, as delivered by the hub
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        #[serde(default)]
        pub old_state: Option<State>,
        #[serde(default)]
        pub new_state: Option<State>,
    }

    /// A flattened state change: entity plus old and new values
    ///
    /// This is what the dispatcher works on. A missing state (entity added
    /// or removed) is carried as `None`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct StateChange {
        pub entity_id: EntityId,
        pub new_value: Option<String>,
        pub old_value: Option<String>,
    }

    impl StateChange {
        /// Create a state change from plain values
        pub fn new(entity_id: EntityId, new_value: Option<&str>, old_value: Option<&str>) -> Self {
            Self {
                entity_id,
                new_value: new_value.map(String::from),
                old_value: old_value.map(String::from),
            }
        }

        /// Whether the value actually changed
        pub fn is_change(&self) -> bool {
            self.new_value != self.old_value
        }
    }

    impl From<StateChangedData> for StateChange {
        fn from(data: StateChangedData) -> Self {
            Self {
                entity_id: data.entity_id,
                new_value: data.new_state.map(|s| s.state),
                old_value: data.old_state.map(|s| s.state),
            }
        }
    }
}
