//! Collaborators backed by the hub
//!
//! The broker's duration, moisture, timeline and run-log seams are served
//! here by writing to the hub directly or by firing `flux_irrigation_*`
//! events for the add-on's other subsystems to pick up.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use flux_broker::{Collaborators, DurationUpdater, MoistureHooks, RunLog, TimelineRecalculator};
use flux_core::{EntityId, ServiceCall};
use flux_hub::Hub;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const EVENT_TIMELINE: &str = "flux_irrigation_timeline_recalculate";
pub const EVENT_PROBE: &str = "flux_irrigation_probe_changed";
pub const EVENT_REAPPLY: &str = "flux_irrigation_reapply_durations";
pub const EVENT_ZONE: &str = "flux_irrigation_zone_event";
pub const EVENT_BASE_DURATION: &str = "flux_irrigation_base_duration";

/// Base durations recorded in memory
///
/// A manual run time is written to the controller as-is unless the zone is
/// running, so factors never apply to a value the user just typed.
pub struct BaseDurations {
    hub: Arc<dyn Hub>,
    values: DashMap<EntityId, f64>,
}

impl BaseDurations {
    pub fn new(hub: Arc<dyn Hub>) -> Self {
        Self {
            hub,
            values: DashMap::new(),
        }
    }
}

#[async_trait]
impl DurationUpdater for BaseDurations {
    async fn update_base_duration(&self, entity_id: &EntityId, minutes: f64, zone_running: bool) {
        self.values.insert(entity_id.clone(), minutes);

        let data = json!({ "entity_id": entity_id.to_string(), "minutes": minutes });
        if let Err(e) = self.hub.fire_event(EVENT_BASE_DURATION, data).await {
            warn!(entity_id = %entity_id, error = %e, "Failed to announce base duration");
        }

        if zone_running {
            debug!(entity_id = %entity_id, minutes, "Zone running, base duration recorded only");
            return;
        }
        let call = ServiceCall::for_entity(entity_id, "set_value").with_data("value", minutes);
        if let Err(e) = self.hub.call_service(&call).await {
            warn!(entity_id = %entity_id, error = %e, "Failed to write base duration");
        }
    }

    async fn base_duration(&self, entity_id: &EntityId) -> Option<f64> {
        self.values.get(entity_id).map(|v| *v)
    }
}

/// Forwards notifications to the hub's event bus
pub struct HubEventForwarder {
    hub: Arc<dyn Hub>,
}

impl HubEventForwarder {
    pub fn new(hub: Arc<dyn Hub>) -> Self {
        Self { hub }
    }

    async fn fire(&self, event_type: &str, data: Value) {
        if let Err(e) = self.hub.fire_event(event_type, data).await {
            warn!(event_type, error = %e, "Failed to fire event");
        }
    }
}

#[async_trait]
impl MoistureHooks for HubEventForwarder {
    /// The moisture subsystem decides transitions itself; this only tells it
    async fn check_skip_factor_transition(
        &self,
        entity_id: &EntityId,
        new_value: &str,
        old_value: Option<&str>,
    ) -> bool {
        self.fire(
            EVENT_PROBE,
            json!({
                "entity_id": entity_id.to_string(),
                "new_state": new_value,
                "old_state": old_value,
            }),
        )
        .await;
        false
    }

    async fn reapply_durations(&self) {
        self.fire(EVENT_REAPPLY, json!({})).await;
    }
}

#[async_trait]
impl TimelineRecalculator for HubEventForwarder {
    async fn recalculate(&self) {
        self.fire(EVENT_TIMELINE, json!({})).await;
    }
}

#[async_trait]
impl RunLog for HubEventForwarder {
    async fn log_zone_event(&self, entity_id: &EntityId, state: &str, source: &str) {
        self.fire(
            EVENT_ZONE,
            json!({
                "entity_id": entity_id.to_string(),
                "state": state,
                "source": source,
            }),
        )
        .await;
    }
}

/// Collaborators for a broker running against a live hub
pub fn hub_collaborators(hub: Arc<dyn Hub>) -> Collaborators {
    let forwarder = Arc::new(HubEventForwarder::new(hub.clone()));
    Collaborators {
        durations: Arc::new(BaseDurations::new(hub)),
        moisture: forwarder.clone(),
        timeline: forwarder.clone(),
        run_log: forwarder,
    }
}
