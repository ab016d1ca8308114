//! Reconnect / resync coordinator
//!
//! When a remote reboots or comes back, the controller's full state is
//! pushed to it twice around a settle window. The device stays pending, so
//! its boot-time defaults cannot reach the controller, until the final
//! settle completes in the same stream epoch.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use flux_core::{is_active_state, is_bookkeeping_state, EntityId, WriteKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::classifier::keys;
use crate::inventory::DeviceId;
use crate::matcher::EntityMap;
use crate::mirror::values_match;

/// Counts from one resync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub first_pass: usize,
    pub second_pass: usize,
    pub completed: bool,
}

impl Broker {
    /// Start a resync for one remote
    ///
    /// Marks the device pending. Returns false when a resync for the device is
    /// already running; a second trigger for the same boot is a no-op.
    pub fn trigger_resync(&self, device: &DeviceId) -> bool {
        let started = {
            let mut state = self.inner.reconnect.entry(device.clone()).or_default();
            state.pending = true;
            if state.sync_running {
                false
            } else {
                state.sync_running = true;
                true
            }
        };

        if !started {
            debug!(device = %device, "Resync already running");
            return false;
        }

        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let cancel = match self.inner.resync_cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let broker = self.clone();
        let device = device.clone();
        self.inner.tracker.spawn(async move {
            broker.run_resync(&device, epoch, &cancel).await;
        });
        true
    }

    /// Run the full resync sequence for one device
    pub(crate) async fn run_resync(
        &self,
        device: &DeviceId,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> ResyncReport {
        let timings = self.inner.timings;
        let mut report = ResyncReport::default();
        info!(device = %device, "Resync scheduled");

        if let Some(map) = self.entity_map(device) {
            let pushed = self.resync_passes(device, &map, cancel, &mut report).await;
            report.completed = pushed && settle(timings.resync_final_settle(), cancel).await;
        } else {
            warn!(device = %device, "No entity map for device, nothing to resync");
        }

        let same_epoch = self.inner.epoch.load(Ordering::SeqCst) == epoch;
        if same_epoch {
            if let Some(mut state) = self.inner.reconnect.get_mut(device) {
                state.sync_running = false;
                if report.completed {
                    state.pending = false;
                }
            }
        }

        if report.completed && same_epoch {
            info!(
                device = %device,
                first_pass = report.first_pass,
                second_pass = report.second_pass,
                "Resync complete, accepting changes from device"
            );
        } else {
            warn!(device = %device, same_epoch, "Resync abandoned, device stays suppressed");
        }
        report
    }

    async fn resync_passes(
        &self,
        device: &DeviceId,
        map: &EntityMap,
        cancel: &CancellationToken,
        report: &mut ResyncReport,
    ) -> bool {
        let timings = self.inner.timings;

        if !settle(timings.resync_initial_settle(), cancel).await {
            return false;
        }

        let states = match self.read_states().await {
            Ok(states) => states,
            Err(e) => {
                warn!(device = %device, error = %e, "Resync could not read controller state");
                return false;
            }
        };
        info!(device = %device, pairs = map.push_pairs().len(), "Resync first pass");
        for (controller, remote) in map.push_pairs() {
            if cancel.is_cancelled() {
                return false;
            }
            let Some(value) = self.desired_value(map, controller, remote, &states).await else {
                continue;
            };
            if self.inner.mirror.mirror(controller, remote, &value).await.is_ok() {
                report.first_pass += 1;
            }
        }

        if !settle(timings.resync_second_settle(), cancel).await {
            return false;
        }

        if let Some(flag) = &map.sync_needed_remote {
            debug!(device = %device, entity_id = %flag, "Clearing sync flag");
            if let Err(e) = self.inner.mirror.mirror(flag, flag, "off").await {
                debug!(device = %device, entity_id = %flag, error = %e, "Sync flag not cleared");
            }
        }

        // Only what drifted while the device settled
        let states = match self.read_states().await {
            Ok(states) => states,
            Err(e) => {
                warn!(device = %device, error = %e, "Resync could not re-read state");
                return false;
            }
        };
        info!(device = %device, "Resync second pass");
        for (controller, remote) in map.push_pairs() {
            if cancel.is_cancelled() {
                return false;
            }
            let Some(value) = self.desired_value(map, controller, remote, &states).await else {
                continue;
            };
            let current = states.get(remote).map(String::as_str).unwrap_or_default();
            if values_match(remote, &value, current) {
                continue;
            }
            if self.inner.mirror.mirror(controller, remote, &value).await.is_ok() {
                report.second_pass += 1;
            }
        }

        true
    }

    /// Value a remote should show for a controller entity
    ///
    /// Durations use the recorded base duration, falling back to the live
    /// value; zone counts leave out special zones.
    async fn desired_value(
        &self,
        map: &EntityMap,
        controller: &EntityId,
        remote: &EntityId,
        states: &HashMap<EntityId, String>,
    ) -> Option<String> {
        let key = map.key_of(controller);

        // Replaying a press would act on the device, not restore it
        if matches!(WriteKind::for_domain(remote.domain()), WriteKind::Press) {
            return None;
        }

        if key.is_some_and(|key| key.is_zone_duration()) {
            if let Some(minutes) = self.inner.collab.durations.base_duration(controller).await {
                return Some(minutes.to_string());
            }
        }

        let live = states.get(controller)?;
        if is_bookkeeping_state(live) {
            return None;
        }
        if key.is_some_and(|key| key == keys::ZONE_COUNT) {
            return Some(self.visible_zone_count(live));
        }
        Some(live.clone())
    }

    /// Resync every remote whose sync flag is already raised
    pub(crate) async fn resync_flagged_remotes(&self) {
        let states = match self.read_states().await {
            Ok(states) => states,
            Err(e) => {
                warn!(error = %e, "Could not read sync flags after connect");
                return;
            }
        };

        let roster = self.roster();
        for device in roster.remote_ids() {
            let flag = self
                .entity_map(device)
                .and_then(|map| map.sync_needed_remote.clone());
            let raised = flag
                .and_then(|flag| states.get(&flag).cloned())
                .is_some_and(|value| is_active_state(&value));
            if raised {
                info!(device = %device, "Sync flag raised at connect");
                self.trigger_resync(device);
            }
        }
    }
}

/// Sleep unless cancelled; false when cancelled
async fn settle(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
