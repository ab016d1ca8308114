//! Collaborators the broker calls into but does not implement
//!
//! Run-time bookkeeping, moisture handling, schedule timelines and the run
//! log live elsewhere in the add-on. The broker only needs these seams.

use std::sync::Arc;

use async_trait::async_trait;
use flux_core::EntityId;

/// Records manually-entered zone run times
#[async_trait]
pub trait DurationUpdater: Send + Sync {
    /// Record a new base duration for a controller duration entity
    ///
    /// Unless the zone is running, the raw value is also written to the
    /// controller so a manual run time is honoured without factors.
    async fn update_base_duration(&self, entity_id: &EntityId, minutes: f64, zone_running: bool);

    /// Last recorded base duration, if any
    async fn base_duration(&self, entity_id: &EntityId) -> Option<f64>;
}

/// Moisture probe hooks
#[async_trait]
pub trait MoistureHooks: Send + Sync {
    /// Whether a probe change crossed the skip/factor boundary
    async fn check_skip_factor_transition(
        &self,
        entity_id: &EntityId,
        new_value: &str,
        old_value: Option<&str>,
    ) -> bool;

    /// Re-apply factored durations after a transition
    async fn reapply_durations(&self);
}

/// Schedule timeline recalculation
#[async_trait]
pub trait TimelineRecalculator: Send + Sync {
    async fn recalculate(&self);
}

/// Zone run history
#[async_trait]
pub trait RunLog: Send + Sync {
    /// A controller zone turned on or off; `source` says who started it
    async fn log_zone_event(&self, entity_id: &EntityId, state: &str, source: &str);
}

/// The full set of collaborators handed to the broker
#[derive(Clone)]
pub struct Collaborators {
    pub durations: Arc<dyn DurationUpdater>,
    pub moisture: Arc<dyn MoistureHooks>,
    pub timeline: Arc<dyn TimelineRecalculator>,
    pub run_log: Arc<dyn RunLog>,
}

impl Collaborators {
    /// Collaborators that do nothing
    pub fn noop() -> Self {
        let noop = Arc::new(Noop);
        Self {
            durations: noop.clone(),
            moisture: noop.clone(),
            timeline: noop.clone(),
            run_log: noop,
        }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

struct Noop;

#[async_trait]
impl DurationUpdater for Noop {
    async fn update_base_duration(&self, _: &EntityId, _: f64, _: bool) {}

    async fn base_duration(&self, _: &EntityId) -> Option<f64> {
        None
    }
}

#[async_trait]
impl MoistureHooks for Noop {
    async fn check_skip_factor_transition(&self, _: &EntityId, _: &str, _: Option<&str>) -> bool {
        false
    }

    async fn reapply_durations(&self) {}
}

#[async_trait]
impl TimelineRecalculator for Noop {
    async fn recalculate(&self) {}
}

#[async_trait]
impl RunLog for Noop {
    async fn log_zone_event(&self, _: &EntityId, _: &str, _: &str) {}
}
