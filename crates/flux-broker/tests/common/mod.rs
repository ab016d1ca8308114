//! Common test utilities for the broker
//!
//! A recording hub that applies service calls to its own state table, and
//! collaborators that capture what the broker asked of them.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flux_broker::{
    Broker, Collaborators, DeviceId, DurationUpdater, MoistureHooks, RunLog, Roster,
    TimelineRecalculator,
};
use flux_config::BrokerTimings;
use flux_core::events::StateChange;
use flux_core::{EntityId, ServiceCall, State};
use flux_hub::{Hub, HubError, HubResult};
use serde_json::Value;

pub fn id(raw: &str) -> EntityId {
    raw.parse().expect("Invalid entity_id")
}

pub fn ids(raw: &[&str]) -> Vec<EntityId> {
    raw.iter().map(|s| id(s)).collect()
}

pub fn change(entity_id: &str, old: &str, new: &str) -> StateChange {
    StateChange::new(id(entity_id), Some(new), Some(old))
}

/// A hub with an in-memory state table and captured service calls
#[derive(Default)]
pub struct TestHub {
    states: Mutex<HashMap<EntityId, String>>,
    calls: Mutex<Vec<ServiceCall>>,
    events: Mutex<Vec<(String, Value)>>,
    failing: Mutex<HashSet<EntityId>>,
}

impl TestHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_state(&self, entity_id: &str, state: &str) {
        self.states
            .lock()
            .unwrap()
            .insert(id(entity_id), state.to_string());
    }

    pub fn state(&self, entity_id: &str) -> Option<String> {
        self.states.lock().unwrap().get(&id(entity_id)).cloned()
    }

    /// Make every call targeting this entity fail
    pub fn fail_on(&self, entity_id: &str) {
        self.failing.lock().unwrap().insert(id(entity_id));
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that targeted one entity
    pub fn calls_for(&self, entity_id: &str) -> Vec<ServiceCall> {
        let target = id(entity_id);
        self.calls()
            .into_iter()
            .filter(|call| call.entity_id().as_ref() == Some(&target))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fired_events(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap().clone()
    }

    /// Apply a service call the way the hub's integrations would
    fn apply(&self, call: &ServiceCall) {
        let Some(target) = call.entity_id() else {
            return;
        };
        let value = match call.service.as_str() {
            "turn_on" => Some("on".to_string()),
            "turn_off" => Some("off".to_string()),
            "open_valve" => Some("open".to_string()),
            "close_valve" => Some("closed".to_string()),
            "set_value" => match call.service_data.get("value") {
                Some(Value::Number(n)) => n.as_f64().map(|n| n.to_string()),
                Some(Value::String(s)) => Some(s.clone()),
                _ => None,
            },
            "select_option" => call.get::<String>("option"),
            "press" => Some("2026-01-01T00:00:00+00:00".to_string()),
            _ => None,
        };
        if let Some(value) = value {
            self.states.lock().unwrap().insert(target, value);
        }
    }
}

#[async_trait]
impl Hub for TestHub {
    async fn get_states(&self) -> HubResult<Vec<State>> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .iter()
            .map(|(id, value)| State::new(id.clone(), value.clone()))
            .collect())
    }

    async fn get_state(&self, entity_id: &EntityId) -> HubResult<Option<State>> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(entity_id)
            .map(|value| State::new(entity_id.clone(), value.clone())))
    }

    async fn call_service(&self, call: &ServiceCall) -> HubResult<()> {
        self.calls.lock().unwrap().push(call.clone());
        if let Some(target) = call.entity_id() {
            if self.failing.lock().unwrap().contains(&target) {
                return Err(HubError::Status {
                    method: "POST",
                    path: format!("/services/{}/{}", call.domain, call.service),
                    status: 500,
                    body: "integration error".to_string(),
                });
            }
        }
        self.apply(call);
        Ok(())
    }

    async fn fire_event(&self, event_type: &str, data: Value) -> HubResult<()> {
        self.events
            .lock()
            .unwrap()
            .push((event_type.to_string(), data));
        Ok(())
    }
}

/// Collaborators that record every call
#[derive(Default)]
pub struct Recorder {
    pub durations: Mutex<Vec<(EntityId, f64, bool)>>,
    pub base: Mutex<HashMap<EntityId, f64>>,
    pub recalculations: Mutex<usize>,
    pub zone_events: Mutex<Vec<(EntityId, String, String)>>,
    pub probe_checks: Mutex<Vec<(EntityId, String)>>,
    pub reapplied: Mutex<usize>,
    pub probe_transition: Mutex<bool>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            durations: self.clone(),
            moisture: self.clone(),
            timeline: self.clone(),
            run_log: self.clone(),
        }
    }

    pub fn recalculations(&self) -> usize {
        *self.recalculations.lock().unwrap()
    }

    pub fn zone_events(&self) -> Vec<(String, String, String)> {
        self.zone_events
            .lock()
            .unwrap()
            .iter()
            .map(|(id, state, source)| (id.to_string(), state.clone(), source.clone()))
            .collect()
    }
}

#[async_trait]
impl DurationUpdater for Recorder {
    async fn update_base_duration(&self, entity_id: &EntityId, minutes: f64, zone_running: bool) {
        self.durations
            .lock()
            .unwrap()
            .push((entity_id.clone(), minutes, zone_running));
        self.base.lock().unwrap().insert(entity_id.clone(), minutes);
    }

    async fn base_duration(&self, entity_id: &EntityId) -> Option<f64> {
        self.base.lock().unwrap().get(entity_id).copied()
    }
}

#[async_trait]
impl MoistureHooks for Recorder {
    async fn check_skip_factor_transition(
        &self,
        entity_id: &EntityId,
        new_value: &str,
        _old_value: Option<&str>,
    ) -> bool {
        self.probe_checks
            .lock()
            .unwrap()
            .push((entity_id.clone(), new_value.to_string()));
        *self.probe_transition.lock().unwrap()
    }

    async fn reapply_durations(&self) {
        *self.reapplied.lock().unwrap() += 1;
    }
}

#[async_trait]
impl TimelineRecalculator for Recorder {
    async fn recalculate(&self) {
        *self.recalculations.lock().unwrap() += 1;
    }
}

#[async_trait]
impl RunLog for Recorder {
    async fn log_zone_event(&self, entity_id: &EntityId, state: &str, source: &str) {
        self.zone_events.lock().unwrap().push((
            entity_id.clone(),
            state.to_string(),
            source.to_string(),
        ));
    }
}

pub const CONTROLLER: &str = "ctrl";
pub const FRONT: &str = "front";
pub const BACK: &str = "back";

pub fn controller_entities() -> Vec<EntityId> {
    ids(&[
        "switch.irrigator_zone_1",
        "switch.irrigator_zone_2",
        "switch.irrigator_zone_3",
        "number.irrigator_zone_1_run_duration",
        "number.irrigator_zone_2_run_duration",
        "switch.irrigator_enable_zone_1",
        "select.irrigator_zone_3_mode",
        "text.irrigator_start_time_1",
        "switch.irrigator_schedule_monday",
        "sensor.irrigator_status",
        "sensor.irrigator_detected_zones",
        "switch.irrigator_use_12h",
    ])
}

/// A keypad's entities under its own naming scheme
pub fn remote_entities(prefix: &str) -> Vec<EntityId> {
    let raw = [
        format!("valve.{prefix}_zone_1"),
        format!("switch.{prefix}_zone_2"),
        format!("switch.{prefix}_zone_3"),
        format!("number.{prefix}_zone_1_duration"),
        format!("number.{prefix}_zone_2_duration"),
        format!("text.{prefix}_start_time_1"),
        format!("switch.{prefix}_schedule_monday"),
        format!("text.{prefix}_status"),
        format!("number.{prefix}_zone_count"),
        format!("switch.{prefix}_use_12_hour_format"),
        format!("switch.{prefix}_sync_needed"),
    ];
    raw.iter().map(|s| id(s)).collect()
}

pub fn roster() -> Roster {
    Roster::new(DeviceId::new(CONTROLLER), controller_entities())
        .with_remote(DeviceId::new(FRONT), "Front keypad", remote_entities(FRONT))
        .with_remote(DeviceId::new(BACK), "Back keypad", remote_entities(BACK))
        .with_probe_sensors(ids(&["sensor.probe_1_moisture"]))
}

/// Seed the hub with a controller and two keypads that disagree with it
pub fn seed(hub: &TestHub) {
    for (entity, value) in [
        ("switch.irrigator_zone_1", "off"),
        ("switch.irrigator_zone_2", "off"),
        ("switch.irrigator_zone_3", "off"),
        ("number.irrigator_zone_1_run_duration", "10.0"),
        ("number.irrigator_zone_2_run_duration", "20.0"),
        ("switch.irrigator_enable_zone_1", "on"),
        ("select.irrigator_zone_3_mode", "Normal"),
        ("text.irrigator_start_time_1", "06:00"),
        ("switch.irrigator_schedule_monday", "on"),
        ("sensor.irrigator_status", "Idle"),
        ("sensor.irrigator_detected_zones", "3"),
        ("switch.irrigator_use_12h", "off"),
    ] {
        hub.set_state(entity, value);
    }

    for prefix in [FRONT, BACK] {
        for (suffix, value) in [
            ("valve.{}_zone_1", "closed"),
            ("switch.{}_zone_2", "off"),
            ("switch.{}_zone_3", "off"),
            ("number.{}_zone_1_duration", "5.0"),
            ("number.{}_zone_2_duration", "5.0"),
            ("text.{}_start_time_1", "00:00"),
            ("switch.{}_schedule_monday", "off"),
            ("text.{}_status", ""),
            ("number.{}_zone_count", "0.0"),
            ("switch.{}_use_12_hour_format", "off"),
            ("switch.{}_sync_needed", "off"),
        ] {
            hub.set_state(&suffix.replace("{}", prefix), value);
        }
    }
}

pub struct Fixture {
    pub hub: Arc<TestHub>,
    pub recorder: Arc<Recorder>,
    pub broker: Broker,
}

/// A built broker over a seeded hub; both remotes start pending
pub async fn fixture() -> Fixture {
    let hub = TestHub::new();
    seed(&hub);
    let recorder = Recorder::new();
    let broker = Broker::new(
        hub.clone(),
        roster(),
        recorder.collaborators(),
        BrokerTimings::default(),
        false,
    );
    broker.build().await.expect("build");
    Fixture {
        hub,
        recorder,
        broker,
    }
}

impl Fixture {
    /// Run a resync for a remote to completion and forget the writes it made
    pub async fn ready(&self, device: &str) {
        assert!(self.broker.trigger_resync(&DeviceId::new(device)));
        self.broker.drain().await;
        assert!(!self.broker.is_pending(&DeviceId::new(device)));
        self.hub.clear_calls();
    }
}
