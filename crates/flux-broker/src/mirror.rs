//! Mirror executor
//!
//! Turns "target should now hold value" into exactly one service call in the
//! target's domain, and guards the target so the hub's echo of that write is
//! not taken for an external change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flux_core::{is_active_state, is_bookkeeping_state, EntityId, ServiceCall, WriteKind};
use flux_hub::{Hub, HubError};
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::classifier::classify;
use crate::expiring::ExpiringMap;
use crate::time_format;

/// Why a mirror did not happen
#[derive(Debug, Error)]
pub enum MirrorError {
    /// `unavailable` / `unknown` are never written
    #[error("'{0}' is hub bookkeeping, not a value")]
    Bookkeeping(String),

    /// A numeric target got a value that is not a number
    #[error("'{value}' is not a number for {target}")]
    NotNumeric { target: EntityId, value: String },

    /// The target's domain cannot be written
    #[error("{0} is read-only")]
    NotWritable(EntityId),

    /// The hub rejected or failed the call
    #[error("hub call failed: {0}")]
    Hub(#[from] HubError),
}

/// Build the service call that sets `target` to `value`
///
/// Start-time text targets are rewritten in the system clock format.
pub fn build_call(target: &EntityId, value: &str, use_12h: bool) -> Result<ServiceCall, MirrorError> {
    if is_bookkeeping_state(value) {
        return Err(MirrorError::Bookkeeping(value.to_string()));
    }

    let kind = WriteKind::for_domain(target.domain());
    let service = kind
        .service(is_active_state(value))
        .ok_or_else(|| MirrorError::NotWritable(target.clone()))?;
    let call = ServiceCall::for_entity(target, service);

    Ok(match kind {
        WriteKind::Number => {
            let number: f64 = value
                .trim()
                .parse()
                .ok()
                .filter(|n: &f64| n.is_finite())
                .ok_or_else(|| MirrorError::NotNumeric {
                    target: target.clone(),
                    value: value.to_string(),
                })?;
            call.with_data("value", number)
        }
        WriteKind::Text => {
            let text = if classify(target.object_id()).is_start_time() {
                time_format::convert(value, use_12h).unwrap_or_else(|| value.to_string())
            } else {
                value.to_string()
            };
            call.with_data("value", text)
        }
        WriteKind::Select => call.with_data("option", value),
        WriteKind::Toggle | WriteKind::Valve | WriteKind::Press | WriteKind::ReadOnly => call,
    })
}

/// Whether a target already shows `desired`, compared the way its domain reads
pub fn values_match(target: &EntityId, desired: &str, current: &str) -> bool {
    if desired == current {
        return true;
    }
    match WriteKind::for_domain(target.domain()) {
        WriteKind::Toggle | WriteKind::Valve => {
            !is_bookkeeping_state(current) && is_active_state(desired) == is_active_state(current)
        }
        WriteKind::Number => match (desired.trim().parse::<f64>(), current.trim().parse::<f64>()) {
            (Ok(a), Ok(b)) => (a - b).abs() < 1e-9,
            _ => false,
        },
        WriteKind::Text if classify(target.object_id()).is_start_time() => {
            match (
                time_format::minutes_of_day(desired),
                time_format::minutes_of_day(current),
            ) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        // A press has no state worth matching
        WriteKind::Press => true,
        _ => false,
    }
}

/// Issues guarded writes against the hub
#[derive(Clone)]
pub struct MirrorExecutor {
    hub: Arc<dyn Hub>,
    guard: Arc<ExpiringMap<EntityId, ()>>,
    use_12h: Arc<AtomicBool>,
}

impl MirrorExecutor {
    pub fn new(
        hub: Arc<dyn Hub>,
        guard: Arc<ExpiringMap<EntityId, ()>>,
        use_12h: Arc<AtomicBool>,
    ) -> Self {
        Self {
            hub,
            guard,
            use_12h,
        }
    }

    /// Whether the entity is currently being written by the broker
    pub fn is_guarded(&self, id: &EntityId) -> bool {
        self.guard.contains(id)
    }

    /// Mirror `value` from `source` onto `target`
    ///
    /// The guard is armed before the call so an echo racing the response is
    /// still suppressed; it is dropped again if the call fails.
    pub async fn mirror(
        &self,
        source: &EntityId,
        target: &EntityId,
        value: &str,
    ) -> Result<(), MirrorError> {
        let call = build_call(target, value, self.use_12h.load(Ordering::Relaxed))?;
        self.guard.insert(target.clone(), ());
        self.execute(source, target, call).await
    }

    /// Arm the guard now and issue the write on the tracker
    ///
    /// Returns false when the value cannot be written to the target.
    pub fn spawn(&self, tracker: &TaskTracker, source: &EntityId, target: &EntityId, value: &str) -> bool {
        let call = match build_call(target, value, self.use_12h.load(Ordering::Relaxed)) {
            Ok(call) => call,
            Err(e) => {
                debug!(source = %source, target = %target, reason = %e, "Mirror skipped");
                return false;
            }
        };
        self.guard.insert(target.clone(), ());

        let this = self.clone();
        let source = source.clone();
        let target = target.clone();
        tracker.spawn(async move {
            let _ = this.execute(&source, &target, call).await;
        });
        true
    }

    async fn execute(
        &self,
        source: &EntityId,
        target: &EntityId,
        call: ServiceCall,
    ) -> Result<(), MirrorError> {
        match self.hub.call_service(&call).await {
            Ok(()) => {
                self.guard.insert(target.clone(), ());
                debug!(source = %source, target = %target, service = %call.service_id(), "Mirrored");
                Ok(())
            }
            Err(e) => {
                self.guard.remove(target);
                warn!(source = %source, target = %target, error = %e, "Mirror write failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: &str) -> EntityId {
        raw.parse().unwrap()
    }

    #[test]
    fn test_toggle_and_valve() {
        let call = build_call(&id("switch.remote_zone_1"), "on", false).unwrap();
        assert_eq!(call.service_id(), "switch.turn_on");

        let call = build_call(&id("valve.irrigator_zone_1"), "on", false).unwrap();
        assert_eq!(call.service_id(), "valve.open_valve");

        let call = build_call(&id("switch.remote_zone_1"), "closed", false).unwrap();
        assert_eq!(call.service_id(), "switch.turn_off");
    }

    #[test]
    fn test_number() {
        let call = build_call(&id("number.remote_zone_1_duration"), "15", false).unwrap();
        assert_eq!(call.service_id(), "number.set_value");
        assert_eq!(call.service_data["value"], json!(15.0));

        let err = build_call(&id("number.remote_zone_1_duration"), "fifteen", false).unwrap_err();
        assert!(matches!(err, MirrorError::NotNumeric { .. }));
    }

    #[test]
    fn test_start_time_follows_system_clock() {
        let call = build_call(&id("text.irrigator_start_time_1"), "17:00", true).unwrap();
        assert_eq!(call.service_data["value"], json!("5:00 PM"));

        let call = build_call(&id("text.irrigator_start_time_1"), "5:00 PM", false).unwrap();
        assert_eq!(call.service_data["value"], json!("17:00"));

        // Other text is written as-is
        let call = build_call(&id("text.remote_status"), "17:00", true).unwrap();
        assert_eq!(call.service_data["value"], json!("17:00"));
    }

    #[test]
    fn test_select_and_press() {
        let call = build_call(&id("select.remote_zone_1_mode"), "Normal", false).unwrap();
        assert_eq!(call.service_id(), "select.select_option");
        assert_eq!(call.service_data["option"], json!("Normal"));

        let call = build_call(&id("button.remote_start_stop"), "2026-05-01T06:00:00", false).unwrap();
        assert_eq!(call.service_id(), "button.press");
        assert_eq!(call.service_data, json!({"entity_id": "button.remote_start_stop"}));
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(
            build_call(&id("switch.remote_zone_1"), "unavailable", false),
            Err(MirrorError::Bookkeeping(_))
        ));
        assert!(matches!(
            build_call(&id("text.remote_status"), "unknown", false),
            Err(MirrorError::Bookkeeping(_))
        ));
        assert!(matches!(
            build_call(&id("sensor.remote_status"), "Idle", false),
            Err(MirrorError::NotWritable(_))
        ));
    }

    #[test]
    fn test_values_match() {
        assert!(values_match(&id("number.remote_zone_count"), "4", "4.0"));
        assert!(!values_match(&id("number.remote_zone_count"), "4", "5.0"));
        assert!(values_match(&id("valve.remote_zone_1"), "on", "open"));
        assert!(!values_match(&id("switch.remote_zone_1"), "off", "unavailable"));
        assert!(values_match(&id("text.remote_start_time_1"), "17:00", "5:00 PM"));
        assert!(!values_match(&id("text.remote_status"), "Idle", "Running"));
    }
}
