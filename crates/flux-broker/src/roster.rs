//! Device rosters
//!
//! Which entities belong to the controller, to each remote, and which are
//! moisture probes. Supplied from outside (config or the hub's registry);
//! replacing it invalidates every cached inventory and map.

use std::collections::{HashMap, HashSet};

use flux_core::EntityId;
use indexmap::IndexMap;
use tracing::warn;

use crate::inventory::DeviceId;

/// Who owns an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Controller,
    Remote(DeviceId),
}

/// One remote keypad's roster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteRoster {
    pub name: String,
    pub entities: Vec<EntityId>,
}

/// The controller, its remotes, and the probe sensors
#[derive(Debug, Clone)]
pub struct Roster {
    controller: DeviceId,
    controller_entities: Vec<EntityId>,
    remotes: IndexMap<DeviceId, RemoteRoster>,
    probe_sensors: HashSet<EntityId>,
    owners: HashMap<EntityId, Owner>,
}

impl Roster {
    pub fn new(controller: DeviceId, entities: Vec<EntityId>) -> Self {
        let owners = entities
            .iter()
            .map(|id| (id.clone(), Owner::Controller))
            .collect();
        Self {
            controller,
            controller_entities: entities,
            remotes: IndexMap::new(),
            probe_sensors: HashSet::new(),
            owners,
        }
    }

    /// Add a remote device
    ///
    /// An entity already owned by the controller or another remote keeps its
    /// first owner.
    pub fn with_remote(
        mut self,
        device: DeviceId,
        name: impl Into<String>,
        entities: Vec<EntityId>,
    ) -> Self {
        for id in &entities {
            if let Some(existing) = self.owners.get(id) {
                warn!(entity_id = %id, device = %device, owner = ?existing, "Entity already owned, ignoring");
                continue;
            }
            self.owners.insert(id.clone(), Owner::Remote(device.clone()));
        }
        let entities = entities
            .into_iter()
            .filter(|id| self.owners.get(id) == Some(&Owner::Remote(device.clone())))
            .collect();
        self.remotes.insert(
            device,
            RemoteRoster {
                name: name.into(),
                entities,
            },
        );
        self
    }

    pub fn with_probe_sensors(mut self, probes: impl IntoIterator<Item = EntityId>) -> Self {
        self.probe_sensors.extend(probes);
        self
    }

    pub fn controller(&self) -> &DeviceId {
        &self.controller
    }

    pub fn controller_entities(&self) -> &[EntityId] {
        &self.controller_entities
    }

    /// Remote device ids in configuration order
    pub fn remote_ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.remotes.keys()
    }

    pub fn remote(&self, device: &DeviceId) -> Option<&RemoteRoster> {
        self.remotes.get(device)
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    pub fn owner_of(&self, id: &EntityId) -> Option<&Owner> {
        self.owners.get(id)
    }

    pub fn is_probe(&self, id: &EntityId) -> bool {
        self.probe_sensors.contains(id)
    }
}
