//! Zone polling fallback
//!
//! While the event stream is down, controller zones are read on a fixed
//! interval so zone runs still reach the run log. Remote mirroring stays
//! suspended until the stream is back.

use flux_core::{is_active_state, is_bookkeeping_state, EntityId};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;

impl Broker {
    /// Controller zone on/off entities and their zone numbers
    fn polled_zones(&self) -> Vec<(EntityId, u32)> {
        self.controller_inventory()
            .iter()
            .filter(|(key, entity)| key.is_zone() && matches!(entity.domain.as_str(), "switch" | "valve"))
            .filter_map(|(key, entity)| Some((entity.id.clone(), key.zone_index()?)))
            .collect()
    }

    /// Start polling if it is not already running
    pub(crate) fn start_poller(&self) {
        let token = {
            let Ok(mut slot) = self.inner.poller.lock() else {
                return;
            };
            if slot.is_some() {
                return;
            }
            let token = self.inner.cancel.child_token();
            *slot = Some(token.clone());
            token
        };

        let interval = self.inner.timings.poll_interval();
        info!(interval_ms = interval.as_millis() as u64, "Zone polling started");

        let broker = self.clone();
        self.inner.tracker.spawn(async move {
            broker.poll_loop(token).await;
        });
    }

    /// Stop polling
    pub(crate) fn stop_poller(&self) {
        let token = match self.inner.poller.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(token) = token {
            token.cancel();
            info!("Zone polling stopped");
        }
    }

    /// Whether the polling fallback is active
    pub fn is_polling(&self) -> bool {
        self.inner
            .poller
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    async fn poll_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.timings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.poll_zones().await,
            }
        }
    }

    /// One poll: report every zone whose running state changed
    ///
    /// A zone seen for the first time is only reported if it is running.
    pub(crate) async fn poll_zones(&self) {
        let zones = self.polled_zones();
        if zones.is_empty() {
            return;
        }

        let states = match self.read_states().await {
            Ok(states) => states,
            Err(e) => {
                warn!(error = %e, "Zone poll failed");
                return;
            }
        };

        for (id, zone) in zones {
            let Some(value) = states.get(&id) else {
                continue;
            };
            if is_bookkeeping_state(value) {
                continue;
            }
            let running = is_active_state(value);
            let was_running = self
                .inner
                .zone_states
                .insert(zone, running)
                .unwrap_or(false);
            if running != was_running {
                debug!(entity_id = %id, zone, running, "Poll saw zone transition");
                self.report_zone_event(&id, value);
            }
        }
    }
}
