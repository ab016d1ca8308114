//! Event dispatcher
//!
//! The single consumer of state changes. Each change is run through the
//! hooks (zone modes, zone transitions, probes, schedule edits), then routed
//! by the first matching rule: ignore, remote duration, reconnect signal,
//! remote → controller, controller → remotes, or unrelated.

use std::sync::atomic::Ordering;

use flux_core::events::StateChange;
use flux_core::{is_active_state, is_bookkeeping_state, EntityId, STATE_UNAVAILABLE};
use tracing::{debug, trace, warn};

use crate::broker::Broker;
use crate::classifier::{keys, FunctionalKey};
use crate::inventory::DeviceId;
use crate::matcher::is_one_way;
use crate::roster::Owner;

/// Source reported for zone runs nobody announced
pub const DEFAULT_RUN_SOURCE: &str = "schedule";

/// Source announced for zone toggles mirrored from a keypad
pub const REMOTE_RUN_SOURCE: &str = "remote";

/// What the dispatcher did with one change
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Old and new values are equal
    Unchanged,
    /// Echo of the broker's own write
    Guarded,
    /// New value is `unavailable`/`unknown` or missing
    Bookkeeping,
    /// Remote duration forwarded to the duration updater
    Duration { controller: EntityId },
    /// A resync was requested for the device
    Resync { device: DeviceId, started: bool },
    /// Remote change from a device that has not finished its resync
    Suppressed { device: DeviceId },
    /// Remote change to a key that only flows controller → remote
    OneWay,
    /// Writes were issued
    Mirrored { writes: usize },
    /// Nothing paired with this entity
    Unrelated,
}

impl Broker {
    /// Route one state change
    pub fn dispatch(&self, change: &StateChange) -> Dispatch {
        if !change.is_change() {
            return Dispatch::Unchanged;
        }

        let roster = self.roster();
        let owner = roster.owner_of(&change.entity_id).cloned();

        self.run_hooks(change, owner.as_ref(), roster.is_probe(&change.entity_id));

        let id = &change.entity_id;
        if self.inner.mirror.is_guarded(id) {
            trace!(entity_id = %id, "Ignoring echo of own write");
            return Dispatch::Guarded;
        }

        let value = match change.new_value.as_deref() {
            Some(value) if !is_bookkeeping_state(value) => value,
            _ => return Dispatch::Bookkeeping,
        };

        let outcome = match owner {
            Some(Owner::Remote(device)) => self.dispatch_remote(&device, change, value),
            Some(Owner::Controller) => self.dispatch_controller(id, value),
            None => Dispatch::Unrelated,
        };
        trace!(entity_id = %id, value, outcome = ?outcome, "Dispatched");
        outcome
    }

    fn dispatch_remote(&self, device: &DeviceId, change: &StateChange, value: &str) -> Dispatch {
        let id = &change.entity_id;
        let Some(map) = self.entity_map(device) else {
            return Dispatch::Unrelated;
        };
        let key = self
            .remote_inventory(device)
            .and_then(|inventory| inventory.key_of(id).cloned());
        let came_back = change.old_value.as_deref() == Some(STATE_UNAVAILABLE);

        // Manual run times go through the duration updater, never a plain mirror
        if !came_back && key.as_ref().is_some_and(FunctionalKey::is_zone_duration) {
            if let Some(controller) = map.remote_to_controller.get(id) {
                if self.is_pending(device) {
                    return Dispatch::Suppressed {
                        device: device.clone(),
                    };
                }
                return self.forward_duration(id, controller, key.as_ref(), value);
            }
        }

        let boot_flag = map.sync_needed_remote.as_ref() == Some(id) && is_active_state(value);
        let reappeared = came_back && map.watched_remote_ids.contains(id);
        if boot_flag || reappeared {
            debug!(
                device = %device,
                entity_id = %id,
                trigger = if boot_flag { "sync_needed" } else { "available" },
                "Remote signalled a reconnect"
            );
            let started = self.trigger_resync(device);
            return Dispatch::Resync {
                device: device.clone(),
                started,
            };
        }

        if self.is_pending(device) {
            trace!(device = %device, entity_id = %id, "Remote pending, dropping change");
            return Dispatch::Suppressed {
                device: device.clone(),
            };
        }

        if key.as_ref().is_some_and(is_one_way) || map.sync_needed_remote.as_ref() == Some(id) {
            return Dispatch::OneWay;
        }

        let Some(target) = map.remote_to_controller.get(id) else {
            return Dispatch::Unrelated;
        };

        let tracker = &self.inner.tracker;
        let mut writes = 0;

        if key.as_ref().is_some_and(FunctionalKey::is_zone) {
            self.inner
                .pre_announced
                .insert_if_absent(target.clone(), REMOTE_RUN_SOURCE.to_string());
        }
        if self.inner.mirror.spawn(tracker, id, target, value) {
            writes += 1;
        }

        // Keep the other keypads in step with the one that changed
        let roster = self.roster();
        for other in roster.remote_ids().filter(|other| *other != device) {
            if self.is_pending(other) {
                continue;
            }
            let Some(other_map) = self.entity_map(other) else {
                continue;
            };
            if let Some(other_target) = other_map.controller_to_remote.get(target) {
                if self.inner.mirror.spawn(tracker, id, other_target, value) {
                    writes += 1;
                }
            }
        }

        Dispatch::Mirrored { writes }
    }

    fn forward_duration(
        &self,
        remote: &EntityId,
        controller: &EntityId,
        key: Option<&FunctionalKey>,
        value: &str,
    ) -> Dispatch {
        let minutes = match value.trim().parse::<f64>() {
            Ok(minutes) if minutes.is_finite() => minutes,
            _ => {
                debug!(entity_id = %remote, value, "Duration is not a number, skipping");
                return Dispatch::Unrelated;
            }
        };
        let zone_running = key
            .and_then(FunctionalKey::zone_index)
            .is_some_and(|zone| self.zone_running(zone));

        debug!(
            remote = %remote,
            controller = %controller,
            minutes,
            zone_running,
            "Forwarding remote duration"
        );
        let durations = self.inner.collab.durations.clone();
        let target = controller.clone();
        self.inner.tracker.spawn(async move {
            durations
                .update_base_duration(&target, minutes, zone_running)
                .await;
        });

        Dispatch::Duration {
            controller: controller.clone(),
        }
    }

    fn dispatch_controller(&self, id: &EntityId, value: &str) -> Dispatch {
        let roster = self.roster();
        let tracker = &self.inner.tracker;
        let mut writes = 0;
        let mut suppressed = None;

        for device in roster.remote_ids() {
            let Some(map) = self.entity_map(device) else {
                continue;
            };
            let Some(target) = map.remote_for(id) else {
                continue;
            };
            if self.is_pending(device) {
                suppressed.get_or_insert_with(|| device.clone());
                continue;
            }

            let value = match map.key_of(id) {
                Some(key) if key == keys::ZONE_COUNT => self.visible_zone_count(value),
                _ => value.to_string(),
            };
            if self.inner.mirror.spawn(tracker, id, target, &value) {
                writes += 1;
            }
        }

        match (writes, suppressed) {
            (0, Some(device)) => Dispatch::Suppressed { device },
            (0, None) if !self.is_paired_controller(id) => Dispatch::Unrelated,
            (writes, _) => Dispatch::Mirrored { writes },
        }
    }

    fn is_paired_controller(&self, id: &EntityId) -> bool {
        let roster = self.roster();
        let paired = roster
            .remote_ids()
            .filter_map(|device| self.entity_map(device))
            .any(|map| map.watched_controller_ids.contains(id));
        paired
    }

    /// Zone count a remote should show: special zones are not zones to a keypad
    pub(crate) fn visible_zone_count(&self, value: &str) -> String {
        let Ok(count) = value.trim().parse::<f64>() else {
            return value.to_string();
        };
        if !count.is_finite() || count < 0.0 {
            return value.to_string();
        }
        let count = count as u32;
        let special = self
            .special_zones()
            .into_iter()
            .filter(|zone| *zone <= count)
            .count() as u32;
        count.saturating_sub(special).to_string()
    }

    fn run_hooks(&self, change: &StateChange, owner: Option<&Owner>, is_probe: bool) {
        let id = &change.entity_id;
        let Some(new_value) = change.new_value.as_deref() else {
            return;
        };

        if is_probe {
            self.spawn_probe_check(id, new_value, change.old_value.as_deref());
        }

        if owner != Some(&Owner::Controller) || is_bookkeeping_state(new_value) {
            return;
        }
        let inventory = self.controller_inventory();
        let Some(key) = inventory.key_of(id) else {
            return;
        };

        if key.is_zone_mode() {
            if let Some(zone) = key.zone_index() {
                self.on_zone_mode(zone, new_value);
            }
        }

        if key.is_zone() && matches!(id.domain(), "switch" | "valve") {
            if let Some(zone) = key.zone_index() {
                self.on_zone_state(id, zone, new_value, change.old_value.as_deref());
            }
        }

        if key == keys::USE_12H {
            let use_12h = is_active_state(new_value);
            if self.inner.use_12h.swap(use_12h, Ordering::Relaxed) != use_12h {
                debug!(use_12h, "Controller clock format changed");
            }
        }

        if is_schedule_defining(id.domain(), key) {
            let timeline = self.inner.collab.timeline.clone();
            self.inner.debouncer.trigger(
                &self.inner.tracker,
                &self.inner.cancel,
                move || async move {
                    debug!("Recalculating schedule timeline");
                    timeline.recalculate().await;
                },
            );
        }
    }

    fn on_zone_mode(&self, zone: u32, mode: &str) {
        let before = self.special_zones();
        self.inner.zone_modes.insert(zone, mode.to_string());
        let after = self.special_zones();

        self.invalidate_maps();
        if before != after {
            debug!(zone, mode, special_zones = ?after, "Special zones changed");
            self.push_zone_count();
        }
    }

    /// Re-send the controller's zone count, since what a keypad shows
    /// depends on how many zones are special
    fn push_zone_count(&self) {
        let inventory = self.controller_inventory();
        let Some(source) = inventory
            .iter()
            .find(|(key, _)| *key == keys::ZONE_COUNT)
            .map(|(_, entity)| entity.id.clone())
        else {
            return;
        };

        let broker = self.clone();
        self.inner.tracker.spawn(async move {
            let live = match broker.inner.hub.get_state(&source).await {
                Ok(Some(state)) if !is_bookkeeping_state(&state.state) => state.state,
                Ok(_) => return,
                Err(e) => {
                    warn!(entity_id = %source, error = %e, "Failed to read zone count");
                    return;
                }
            };
            let value = broker.visible_zone_count(&live);

            let roster = broker.roster();
            for device in roster.remote_ids() {
                if broker.is_pending(device) {
                    continue;
                }
                let Some(map) = broker.entity_map(device) else {
                    continue;
                };
                if let Some(target) = map.remote_for(&source) {
                    broker
                        .inner
                        .mirror
                        .spawn(&broker.inner.tracker, &source, target, &value);
                }
            }
        });
    }

    fn on_zone_state(&self, id: &EntityId, zone: u32, new_value: &str, old_value: Option<&str>) {
        let running = is_active_state(new_value);
        let was_running = self
            .inner
            .zone_states
            .insert(zone, running)
            .unwrap_or_else(|| old_value.is_some_and(is_active_state));
        if running != was_running {
            self.report_zone_event(id, new_value);
        }
    }

    /// Report a zone transition with its announced source, or the schedule
    pub(crate) fn report_zone_event(&self, id: &EntityId, state: &str) {
        let source = self
            .inner
            .pre_announced
            .take(id)
            .unwrap_or_else(|| DEFAULT_RUN_SOURCE.to_string());
        debug!(entity_id = %id, state, source = %source, "Zone transition");

        let run_log = self.inner.collab.run_log.clone();
        let id = id.clone();
        let state = state.to_string();
        self.inner.tracker.spawn(async move {
            run_log.log_zone_event(&id, &state, &source).await;
        });
    }

    fn spawn_probe_check(&self, id: &EntityId, new_value: &str, old_value: Option<&str>) {
        let moisture = self.inner.collab.moisture.clone();
        let id = id.clone();
        let new_value = new_value.to_string();
        let old_value = old_value.map(str::to_string);
        self.inner.tracker.spawn(async move {
            if moisture
                .check_skip_factor_transition(&id, &new_value, old_value.as_deref())
                .await
            {
                debug!(entity_id = %id, "Probe crossed skip/factor boundary, reapplying durations");
                moisture.reapply_durations().await;
            }
        });
    }
}

/// Whether a controller entity feeds the schedule timeline
pub fn is_schedule_defining(domain: &str, key: &FunctionalKey) -> bool {
    match domain {
        "text" | "input_text" => key.is_start_time(),
        "number" | "input_number" => key.is_zone_duration(),
        "switch" | "input_boolean" => {
            key.is_zone_enable() || key.is_day_schedule() || key == keys::SCHEDULE_ENABLE
        }
        _ => false,
    }
}
